//! Core domain types and traits for the AkiDB data coordinator.

pub mod collection;
pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;
pub mod segment;
pub mod timestamp;
pub mod traits;

pub use collection::{CollectionInfo, CollectionSchema, DataType, FieldSchema};
pub use config::DataCoordConfig;
pub use error::{CoreError, CoreResult};
pub use ids::{CollectionId, NodeId, PartitionId, SegmentId};
pub use segment::{SegmentInfo, SegmentKey, SegmentState, StatsLedger};
pub use timestamp::{add_physical_ms, compose_ts, parse_ts, Timestamp};
pub use traits::{IdAllocator, MetadataStore, SegmentMutation};
