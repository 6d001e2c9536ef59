//! Offline resource cache
//!
//! Resource caching in front of every network request the client makes:
//!
//! - [`classifier`]: which tier owns a request and how it is served
//! - [`storage`]: named stores in memory or on disk
//! - [`lifecycle`]: versioned install/activate of a build's stores
//! - [`router`]: cache-first request handling with offline fallback
//! - [`worker`]: background task answering control messages

pub mod classifier;
pub mod lifecycle;
pub mod router;
pub mod storage;
pub mod worker;

pub use classifier::{CacheTier, HostRule, ResourceClassifier, Route, Strategy};
pub use lifecycle::{
    BuildState, CacheLifecycle, CacheNamespace, ClientContext, NamedCacheStore, StoreId,
    StoreState,
};
pub use router::{CacheRouter, ResponseSource, RoutedResponse};
pub use storage::{CacheStorage, CachedEntry, DiskStorage, MemoryStorage};
pub use worker::{CacheWorkerHandle, ControlMessage, ControlReply};
