//! External media processes
//!
//! The encoder and preview player are ffmpeg/ffplay subprocesses. This
//! module builds their command lines, supervises them and lists the
//! capture devices they can read.

pub mod bridge;
pub mod devices;
pub mod preset;

pub use bridge::{BridgeState, MediaBridge};
pub use devices::{list_capture_devices, CaptureDevice};
pub use preset::{EncoderPreset, ProcessSpec};
