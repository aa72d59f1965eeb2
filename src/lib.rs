//! Filtered Output Library
//!
//! Audio output stage: format negotiation with the device, a filter chain
//! between the player and the device, and a bounded ring buffer (one mutex,
//! two condition variables) bridging to the hardware render callback.

pub mod audio;
pub mod device;
pub mod engine;
pub mod error;
pub mod filter;
pub mod mixer;
pub mod output;

pub use audio::{AudioFormat, AudioFormatMask, SampleEncoding};
pub use engine::{Engine, EngineConfig, PlaybackState};
pub use error::{ConfigurationError, DeviceError, OutputError};
pub use output::{FilteredOutput, OutputConfig, OutputState};
