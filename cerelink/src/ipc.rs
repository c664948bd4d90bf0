//! Inter-process primitives: named shared-memory segments, packet rings and
//! the wake-up signal.

pub mod ring;
pub mod shmem;
pub mod signal;

pub use ring::{
    DataStatus, LevelOfConcern, ReaderCursor, RingChannel, RingError, RingMode, RingRegion,
    RingStore,
};
pub use shmem::{Segment, SharedMemorySafe, ShmError, ShmPath};
pub use signal::{SignalBlock, StatusBlock, WaitOutcome};
