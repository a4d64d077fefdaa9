//! Avior encode worker
//!
//! Leases encode jobs, decides through the comparator pipeline whether a
//! recording should replace an existing encode, encodes it and moves every
//! file involved into its lifecycle directory.

pub mod broadcast;
pub mod comparator;
pub mod encode;
pub mod joblog;
pub mod library;
pub mod lifecycle;
pub mod media;
pub mod probe;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod worker;

pub use avior_config as config;
pub use avior_config::Config;
pub use broadcast::{
    spawn_cache_feeder, BroadcastError, Broadcaster, CacheTransport, LocalBroadcast, NoBroadcast,
    RedisBroadcast,
};
pub use comparator::{ModuleResult, PassOutcome, Pipeline, Verdict};
pub use encode::{EncodeError, EncodeRequest, EncodeStats, Encoder, FfmpegEncoder};
pub use library::{find_duplicates, new_shared_cache, LibraryCache, ScanError, SharedLibraryCache};
pub use lifecycle::{move_unit, LifecycleError, MoveRecord};
pub use media::{AudioFormat, MediaError, MediaFile, Resolution};
pub use scheduler::{Service, ServiceError, ServiceHandle};
pub use state::{
    new_shared_config, new_shared_status, PauseReason, ServiceStatus, SharedConfig, SharedStatus,
};
pub use store::{machine_hostname, Client, FileJobStore, Job, JobStore, StoreError};
pub use worker::{JobOutcome, Worker};
