mod cli;

use anyhow::Context;
use clap::Parser;
use sustain_notify::NotifyConfig;
use sustain_notify::logging::init_logging;
use sustain_notify::notification::{NotificationPipeline, ToastVariant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => NotifyConfig::load_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => NotifyConfig::from_env().context("loading config from environment")?,
    };

    let (logging, _guard) = init_logging(&config.logging.dir)?;
    if let Some(filter) = &config.logging.filter {
        logging.set_filter(filter)?;
    }
    info!(filter = %logging.get_filter(), dir = %logging.log_dir().display(), "Logging initialized");
    let shutdown = CancellationToken::new();
    logging.start_retention_cleanup(shutdown.clone());

    let pipeline = NotificationPipeline::builder(config).build()?;
    print_toasts(&pipeline, shutdown.clone());

    match cli.command {
        Command::Run => {
            pipeline.start().await?;
            info!("Press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            pipeline.stop().await;
        }
        Command::Probe => {
            println!("{}", serde_json::to_string_pretty(&pipeline.capabilities())?);
        }
        Command::Subscribe => {
            if pipeline.config().push.key_file.is_none() {
                warn!("push.key_file is not set, this subscription ends with the process");
            }
            pipeline.push().request_permission();
            let subscription = pipeline.subscribe_push().await?;
            println!("{}", serde_json::to_string_pretty(&subscription)?);
        }
        Command::Unsubscribe => {
            // Picks up persisted keys, or clears a row that has none.
            pipeline.push().restore().await;
            match pipeline.unsubscribe_push().await {
                Some(outcome) => {
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                    if !outcome.is_complete() {
                        anyhow::bail!("unsubscribe only partially succeeded");
                    }
                }
                None => println!("No push subscription to remove"),
            }
        }
        Command::TestNotification => {
            if pipeline.push().send_test_notification().await.is_none() {
                anyhow::bail!("push notifications are not supported on this device");
            }
        }
    }

    // Let the toast printer drain.
    tokio::task::yield_now().await;
    shutdown.cancel();
    Ok(())
}

/// Mirror toasts to the terminal.
fn print_toasts(pipeline: &NotificationPipeline, shutdown: CancellationToken) {
    let mut toasts = pipeline.toasts().subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                toast = toasts.recv() => match toast {
                    Ok(toast) => {
                        let marker = match toast.variant {
                            ToastVariant::Default => "*",
                            ToastVariant::Destructive => "!",
                        };
                        println!("[{}] {}: {}", marker, toast.title, toast.description);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                },
            }
        }
    });
}
