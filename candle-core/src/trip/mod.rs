//! Trip logs: recording metric changes to disk and replaying them

pub mod format;
pub mod player;
pub mod recorder;

pub use format::{Keyframe, LogEntry, TripHeader, TripLogError};
pub use player::{LoadedWindow, TripPlayer, MAX_LOADED_KEYFRAMES, PLAYBACK_INTERVAL};
pub use recorder::{TripRecorder, WRITE_BUFFER_SIZE};
