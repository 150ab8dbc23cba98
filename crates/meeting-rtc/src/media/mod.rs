//! Local media: tracks, capture devices and the shared source

pub mod devices;
pub mod local;
pub mod track;

pub use devices::{ExternalCaptureDevices, MediaDevices};
pub use local::{LocalMediaSource, LocalMediaState};
pub use track::{LocalTrack, MediaKind, MediaStream, TrackSource};
