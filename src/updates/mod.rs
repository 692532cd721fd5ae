//! Live update notifications
//!
//! Observers subscribe with a namespace filter and receive every WAL
//! record appended to a matching namespace, in WAL order per namespace.

mod filters;
mod multiplexer;
mod observer;

pub use filters::{NamespaceFilter, SubscriptionMode};
pub use multiplexer::UpdatesMultiplexer;
pub use observer::{ConnectionStatus, ObserverStats, UpdatesCounter, UpdatesObserver};
