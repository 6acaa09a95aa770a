pub mod byte_store;
pub mod config;
pub mod error;
pub mod layout;
pub mod lock;
pub mod recovery;
pub mod segment;
pub mod segment_map;
pub mod traversal;
pub mod types;

pub use byte_store::{Durability, MMapFile};
pub use config::{MapConfig, MapConfigBuilder, Strictness};
pub use error::{Result, SegmapError};
pub use lock::{SegmentGuard, SegmentLock};
pub use recovery::{RecoveryReport, SegmentStatus};
pub use segment::{PutOutcome, SegmentStats};
pub use segment_map::SegmentMap;
pub use traversal::{EntryView, SegmentContext};
pub use types::{Bincode, BoxError, Bytes, Codec, CodecRegistry, Native, Str};
