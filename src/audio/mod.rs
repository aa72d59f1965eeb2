//! 音频核心模块
//!
//! 包含：
//! - Format: 音频格式和样本编解码
//! - Ring Buffer: 播放线程到 render 回调的字节桥
//! - Stats: 播放统计

pub mod format;
pub mod ring_buffer;
pub mod stats;

pub use format::{AudioFormat, AudioFormatMask, SampleEncoding};
pub use ring_buffer::RingBuffer;
pub use stats::{PlaybackStats, StatsReport};
