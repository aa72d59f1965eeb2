//! 软件音量
//!
//! 音量 0..=100 线性缩放。音量值放在共享的原子变量里，
//! 混音器可以在播放线程之外随时修改。

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use super::Filter;
use crate::audio::format::{decode_samples, encode_samples};
use crate::audio::{AudioFormat, SampleEncoding};
use crate::error::ConfigurationError;

pub const MAX_VOLUME: u8 = 100;

/// 音量句柄，克隆后共享同一个值
#[derive(Clone, Debug)]
pub struct VolumeControl(Arc<AtomicU8>);

impl VolumeControl {
    pub fn new(volume: u8) -> Self {
        Self(Arc::new(AtomicU8::new(volume.min(MAX_VOLUME))))
    }

    #[inline]
    pub fn get(&self) -> u8 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, volume: u8) {
        self.0.store(volume.min(MAX_VOLUME), Ordering::Relaxed);
    }
}

impl Default for VolumeControl {
    fn default() -> Self {
        Self::new(MAX_VOLUME)
    }
}

/// 软件音量滤波器
pub struct VolumeFilter {
    control: VolumeControl,
    format: Option<AudioFormat>,
    samples: Vec<i32>,
    buffer: Vec<u8>,
}

impl VolumeFilter {
    pub fn new(control: VolumeControl) -> Self {
        Self {
            control,
            format: None,
            samples: Vec::new(),
            buffer: Vec::new(),
        }
    }

    pub fn control(&self) -> VolumeControl {
        self.control.clone()
    }
}

impl Filter for VolumeFilter {
    fn name(&self) -> &'static str {
        "volume"
    }

    fn configure(
        &mut self,
        _in_format: AudioFormat,
        out_format: AudioFormat,
    ) -> Result<(), ConfigurationError> {
        self.reset();
        if out_format.encoding.is_dsd() {
            return Err(ConfigurationError::UnsupportedVolumeFormat(out_format));
        }
        self.format = Some(out_format);
        Ok(())
    }

    fn apply<'a>(&'a mut self, src: &'a [u8]) -> &'a [u8] {
        let volume = self.control.get();
        let Some(format) = self.format else {
            return src;
        };
        if volume >= MAX_VOLUME {
            return src;
        }

        self.buffer.clear();
        match format.encoding {
            SampleEncoding::Float => {
                let gain = volume as f32 / MAX_VOLUME as f32;
                for c in src.chunks_exact(4) {
                    let value = f32::from_le_bytes([c[0], c[1], c[2], c[3]]) * gain;
                    self.buffer.extend_from_slice(&value.to_le_bytes());
                }
            }
            encoding => {
                self.samples.clear();
                decode_samples(encoding, src, &mut self.samples);
                for sample in &mut self.samples {
                    *sample = (*sample as i64 * volume as i64 / MAX_VOLUME as i64) as i32;
                }
                encode_samples(encoding, &self.samples, &mut self.buffer);
            }
        }
        &self.buffer
    }

    fn reset(&mut self) {
        self.format = None;
        self.samples = Vec::new();
        self.buffer = Vec::new();
    }
}
