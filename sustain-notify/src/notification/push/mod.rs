//! Push subscription management and delivery.
//!
//! - [`PushRegistrar`]: the local registration (endpoint + client keys)
//! - [`SubscriptionStore`]: the remote row, one per user
//! - [`PushRelay`]: hands a message to a push service
//! - [`PushSubscriptionManager`]: keeps the two halves of a subscription in step

mod manager;
mod registrar;
mod relay;
mod store;
mod subscription;
mod web_push;

pub use manager::{PushSubscriptionManager, UnsubscribeOutcome};
pub use registrar::{KeypairRegistrar, PushRegistrar};
pub use relay::{EdgeFunctionRelay, PushMessage, PushRelay, RelayReceipt, SEND_PUSH_FUNCTION};
pub use store::{MemorySubscriptionStore, RestSubscriptionStore, SUBSCRIPTIONS_TABLE, SubscriptionStore};
pub use subscription::{PushKeys, PushSubscription, PushSubscriptionRecord};
pub use web_push::{VapidConfig, WebPushRelay};
