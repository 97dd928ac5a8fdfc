//! AkiDB data coordinator.
//!
//! Hands out row ranges inside growing segments, tracks the cluster
//! time-tick watermark, and seals segments once no outstanding grant can
//! still write to them.

pub mod catalog;
pub mod channel_manager;
pub mod cluster;
pub mod flush_handler;
pub mod keyed_lock;
pub mod messages;
pub mod mock;
pub mod segment_allocator;
pub mod server;
pub mod stats_handler;
pub mod timetick;
pub mod watcher;

pub use catalog::{load_catalog, CatalogClient, CatalogSnapshot, StaticCatalog};
pub use channel_manager::{ChannelGroup, ChannelManager};
pub use cluster::{
    CommandQueueClient, DataNodeClient, DataNodeInfo, NodeCluster, NodeCommand, NodeHealth,
};
pub use flush_handler::{FlushCompletion, FlushHandler};
pub use messages::{FlushCompletedMsg, SegmentStatsMsg, SegmentStatsReport, TimeTickMsg};
pub use mock::MockIdAllocator;
pub use segment_allocator::{AllocatorPolicy, SealOutcome, SegmentAllocator, SegmentGrant};
pub use server::{
    ComponentStates, DataCoordinator, FlushOutcome, NodeComponentState, RegisterNodeResponse,
    SegmentIdAssignment, SegmentIdRequest, SegmentStateInfo, SegmentStateResult,
    SegmentStatistics, StartParams, StateCode,
};
pub use stats_handler::{StatsHandler, StatsOutcome};
pub use timetick::TimeTickBarrier;
pub use watcher::WatermarkWatcher;
