//! Vigil store: per-kind object cache, lister, and the informer that keeps it current.

#![forbid(unsafe_code)]

mod cache;
mod informer;
mod lister;

pub use cache::{CacheSnapshot, Indexer};
pub use informer::{ChannelSource, EventHandler, FeedSender, Informer, InformerOptions, SyncSignal};
pub use lister::Lister;
