pub mod manager;
pub mod source;
pub mod synthetic;

pub use manager::{
    DeviceClass, MediaConstraints, MediaDevices, MediaTrackManager, VideoMode,
};
pub use source::{MediaSource, SourceOrigin, TrackSet, WeakMediaSource};
pub use synthetic::{devices_for, SyntheticDevices};
