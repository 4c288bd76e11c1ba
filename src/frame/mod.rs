//! Frame pacing: per-image sync primitives, the acquire/submit/present loop and the
//! driver that runs shadows and the main pass inside it.

pub mod driver;
pub mod sync;
pub mod synchronizer;

pub use driver::{FrameDriver, MainPass, MainPassFrame};
pub use sync::FrameSyncSet;
pub use synchronizer::{
    FrameContext, FrameOutcome, FrameRecorder, FrameStats, FrameSynchronizer, SyncState,
};
