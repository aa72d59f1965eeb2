//! 格式转换滤波器
//!
//! 支持：
//! - 相同格式直通（零拷贝）
//! - PCM 位深 / float 之间的转换（采样率和声道数不变）
//! - DSD → PCM：每个 DSD 字节按 1 的个数折算成一个样本（盒式低通）
//!
//! 不支持重采样、声道重映射和 PCM → DSD，这些在 configure 时报错。

use super::Filter;
use crate::audio::format::{decode_samples, encode_samples};
use crate::audio::{AudioFormat, SampleEncoding};
use crate::error::ConfigurationError;

/// 每个 DSD 字节的 8 个 1-bit 样本折算为 [-1, 1]，再左对齐到 i32
#[inline]
fn dsd_byte_to_sample(byte: u8) -> i32 {
    let ones = byte.count_ones() as i64;
    // (2 * ones - 8) / 8 * 2^31
    ((ones * 2 - 8) << 28).clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

enum Mode {
    Passthrough,
    Pcm { from: SampleEncoding, to: SampleEncoding },
    DsdToPcm { to: SampleEncoding },
}

/// 格式转换
pub struct ConvertFilter {
    mode: Option<Mode>,
    samples: Vec<i32>,
    buffer: Vec<u8>,
}

impl ConvertFilter {
    pub fn new() -> Self {
        Self {
            mode: None,
            samples: Vec::new(),
            buffer: Vec::new(),
        }
    }
}

impl Default for ConvertFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for ConvertFilter {
    fn name(&self) -> &'static str {
        "convert"
    }

    fn configure(
        &mut self,
        in_format: AudioFormat,
        out_format: AudioFormat,
    ) -> Result<(), ConfigurationError> {
        self.reset();

        let unsupported = |reason| ConfigurationError::UnsupportedConversion {
            from: in_format,
            to: out_format,
            reason,
        };

        if in_format == out_format {
            self.mode = Some(Mode::Passthrough);
            return Ok(());
        }

        if in_format.channels != out_format.channels {
            return Err(unsupported("channel remapping not supported"));
        }
        if in_format.sample_rate != out_format.sample_rate {
            return Err(unsupported("resampling not supported"));
        }

        let mode = match (in_format.encoding, out_format.encoding) {
            (_, SampleEncoding::Dsd) => return Err(unsupported("cannot encode DSD")),
            (SampleEncoding::Dsd, to) => Mode::DsdToPcm { to },
            (from, to) => Mode::Pcm { from, to },
        };

        log::debug!("convert {} -> {}", in_format, out_format);
        self.mode = Some(mode);
        Ok(())
    }

    fn apply<'a>(&'a mut self, src: &'a [u8]) -> &'a [u8] {
        let to = match self.mode {
            // 未配置时按直通处理
            None | Some(Mode::Passthrough) => return src,
            Some(Mode::Pcm { from, to }) => {
                self.samples.clear();
                decode_samples(from, src, &mut self.samples);
                to
            }
            Some(Mode::DsdToPcm { to }) => {
                self.samples.clear();
                self.samples.extend(src.iter().map(|&b| dsd_byte_to_sample(b)));
                to
            }
        };

        self.buffer.clear();
        encode_samples(to, &self.samples, &mut self.buffer);
        &self.buffer
    }

    fn reset(&mut self) {
        self.mode = None;
        self.samples = Vec::new();
        self.buffer = Vec::new();
    }
}
