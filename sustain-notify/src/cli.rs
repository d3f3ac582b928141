use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Notification delivery pipeline: push, realtime fallback and local toasts.
#[derive(Parser, Debug)]
#[command(name = "sustain-notify", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// TOML config file. Environment variables are used when omitted.
    #[arg(short, long, global = true, env = "SUSTAIN_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the pipeline until Ctrl-C.
    Run,

    /// Print detected capabilities as JSON.
    Probe,

    /// Register a push subscription for the configured user.
    Subscribe,

    /// Remove the push subscription locally and remotely.
    Unsubscribe,

    /// Render a local test notification.
    TestNotification,
}
