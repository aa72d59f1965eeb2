//! 音频格式和样本编解码
//!
//! 内部表示：PCM 样本统一左对齐到 i32 的高位
//! - 8-bit: 占据 bit[31:24]
//! - 16-bit: 占据 bit[31:16]
//! - 24-bit: 占据 bit[31:8]
//! - 32-bit: 占据 bit[31:0]
//! - float: [-1.0, 1.0] 映射到完整 i32 范围
//!
//! DSD 不参与样本编解码，只能按字节搬运

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigurationError;

/// 支持的最大声道数
pub const MAX_CHANNELS: u8 = 8;

/// DSD 静音模式（0/1 交替，直流为零）
pub const DSD_SILENCE_BYTE: u8 = 0x69;

const I32_TO_FLOAT: f32 = 1.0 / 2147483648.0; // 1 / 2^31
const FLOAT_TO_I32: f32 = 2147483648.0;

/// 样本编码
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleEncoding {
    Pcm8,
    Pcm16,
    /// packed 3 字节 little-endian
    Pcm24,
    Pcm32,
    /// 32-bit float
    Float,
    /// 每字节 8 个 1-bit 样本（单声道）
    Dsd,
}

impl SampleEncoding {
    pub const ALL: [SampleEncoding; 6] = [
        Self::Pcm8,
        Self::Pcm16,
        Self::Pcm24,
        Self::Pcm32,
        Self::Float,
        Self::Dsd,
    ];

    /// 每样本（每声道每帧）的字节数
    #[inline]
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::Pcm8 | Self::Dsd => 1,
            Self::Pcm16 => 2,
            Self::Pcm24 => 3,
            Self::Pcm32 | Self::Float => 4,
        }
    }

    #[inline]
    pub fn is_dsd(self) -> bool {
        matches!(self, Self::Dsd)
    }

    /// 填充 underrun 时使用的静音字节
    #[inline]
    pub fn silence_byte(self) -> u8 {
        if self.is_dsd() {
            DSD_SILENCE_BYTE
        } else {
            0
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pcm8 => "8",
            Self::Pcm16 => "16",
            Self::Pcm24 => "24",
            Self::Pcm32 => "32",
            Self::Float => "f",
            Self::Dsd => "dsd",
        }
    }
}

impl fmt::Display for SampleEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SampleEncoding {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|e| e.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ConfigurationError::InvalidFormat(format!("unknown sample encoding '{}'", s)))
    }
}

/// 音频格式
///
/// 一次 Open/Close 周期内协商确定后不再改变。
/// DSD 的 `sample_rate` 以字节为单位（DSD64 = 352800）。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u8,
    pub encoding: SampleEncoding,
}

impl AudioFormat {
    /// 创建新的音频格式
    pub fn new(sample_rate: u32, channels: u8, encoding: SampleEncoding) -> Self {
        Self {
            sample_rate,
            channels,
            encoding,
        }
    }

    /// 替换样本编码，保留采样率和声道数
    pub fn with_encoding(self, encoding: SampleEncoding) -> Self {
        Self { encoding, ..self }
    }

    pub fn is_valid(&self) -> bool {
        self.sample_rate > 0 && self.channels > 0 && self.channels <= MAX_CHANNELS
    }

    /// 每帧的字节数
    #[inline]
    pub fn frame_size(&self) -> usize {
        self.encoding.bytes_per_sample() * self.channels as usize
    }

    #[inline]
    pub fn bytes_per_second(&self) -> u64 {
        self.sample_rate as u64 * self.frame_size() as u64
    }

    /// 指定字节数对应的播放时长
    pub fn duration_of(&self, bytes: usize) -> Duration {
        let per_second = self.bytes_per_second();
        if per_second == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos((bytes as u128 * 1_000_000_000 / per_second as u128) as u64)
    }

    /// 指定时长对应的字节数（向下取整到整帧，至少一帧）
    pub fn bytes_for(&self, duration: Duration) -> usize {
        let frame_size = self.frame_size().max(1);
        let frames = (self.sample_rate as u128 * duration.as_nanos() / 1_000_000_000) as usize;
        frames.max(1) * frame_size
    }

    #[inline]
    pub fn silence_byte(&self) -> u8 {
        self.encoding.silence_byte()
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.sample_rate, self.encoding, self.channels)
    }
}

impl FromStr for AudioFormat {
    type Err = ConfigurationError;

    /// 解析 `rate:bits:channels`，如 `44100:16:2`、`352800:dsd:2`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mask: AudioFormatMask = s.parse()?;
        match (mask.sample_rate, mask.encoding, mask.channels) {
            (Some(rate), Some(encoding), Some(channels)) => {
                let format = AudioFormat::new(rate, channels, encoding);
                if format.is_valid() {
                    Ok(format)
                } else {
                    Err(ConfigurationError::InvalidFormat(format!("invalid audio format '{}'", s)))
                }
            }
            _ => Err(ConfigurationError::InvalidFormat(format!(
                "wildcards are not allowed in '{}'",
                s
            ))),
        }
    }
}

/// 输出格式掩码
///
/// 每个字段为 `None` 时沿用源格式，对应配置中的 `*`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AudioFormatMask {
    pub sample_rate: Option<u32>,
    pub encoding: Option<SampleEncoding>,
    pub channels: Option<u8>,
}

impl AudioFormatMask {
    pub fn is_empty(&self) -> bool {
        self.sample_rate.is_none() && self.encoding.is_none() && self.channels.is_none()
    }

    /// 用掩码覆盖源格式中指定的字段
    pub fn apply(&self, format: AudioFormat) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate.unwrap_or(format.sample_rate),
            channels: self.channels.unwrap_or(format.channels),
            encoding: self.encoding.unwrap_or(format.encoding),
        }
    }
}

impl fmt::Display for AudioFormatMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sample_rate {
            Some(rate) => write!(f, "{}:", rate)?,
            None => f.write_str("*:")?,
        }
        match self.encoding {
            Some(encoding) => write!(f, "{}:", encoding)?,
            None => f.write_str("*:")?,
        }
        match self.channels {
            Some(channels) => write!(f, "{}", channels),
            None => f.write_str("*"),
        }
    }
}

impl FromStr for AudioFormatMask {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigurationError::InvalidFormat(format!("invalid audio format '{}'", s));

        let parts: Vec<&str> = s.trim().split(':').collect();
        let [rate, encoding, channels] = parts.as_slice() else {
            return Err(invalid());
        };

        let sample_rate = match *rate {
            "*" => None,
            r => Some(r.parse::<u32>().ok().filter(|&r| r > 0).ok_or_else(invalid)?),
        };
        let encoding = match *encoding {
            "*" => None,
            e => Some(e.parse::<SampleEncoding>()?),
        };
        let channels = match *channels {
            "*" => None,
            c => Some(
                c.parse::<u8>()
                    .ok()
                    .filter(|&c| c > 0 && c <= MAX_CHANNELS)
                    .ok_or_else(invalid)?,
            ),
        };

        Ok(Self {
            sample_rate,
            encoding,
            channels,
        })
    }
}

/// 将原始字节解码为左对齐的 i32 样本，追加到 `output`
///
/// 不完整的尾部样本被忽略；DSD 不支持，返回 0
pub fn decode_samples(encoding: SampleEncoding, bytes: &[u8], output: &mut Vec<i32>) -> usize {
    let before = output.len();
    match encoding {
        SampleEncoding::Pcm8 => {
            output.extend(bytes.iter().map(|&b| (b as i8 as i32) << 24));
        }
        SampleEncoding::Pcm16 => {
            output.extend(
                bytes
                    .chunks_exact(2)
                    .map(|c| (i16::from_le_bytes([c[0], c[1]]) as i32) << 16),
            );
        }
        SampleEncoding::Pcm24 => {
            output.extend(bytes.chunks_exact(3).map(|c| {
                // 先放到 bit[31:8]，符号位自然落在 bit31
                ((c[0] as i32) << 8) | ((c[1] as i32) << 16) | ((c[2] as i32) << 24)
            }));
        }
        SampleEncoding::Pcm32 => {
            output.extend(
                bytes
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]])),
            );
        }
        SampleEncoding::Float => {
            output.extend(bytes.chunks_exact(4).map(|c| {
                let value = f32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                // `as` 对越界值饱和，NaN 变为 0
                (value.clamp(-1.0, 1.0) * FLOAT_TO_I32) as i32
            }));
        }
        SampleEncoding::Dsd => {}
    }
    output.len() - before
}

/// 将左对齐的 i32 样本编码为目标格式字节，追加到 `output`
pub fn encode_samples(encoding: SampleEncoding, samples: &[i32], output: &mut Vec<u8>) {
    output.reserve(samples.len() * encoding.bytes_per_sample());
    match encoding {
        SampleEncoding::Pcm8 => {
            output.extend(samples.iter().map(|&s| (s >> 24) as i8 as u8));
        }
        SampleEncoding::Pcm16 => {
            for &s in samples {
                output.extend_from_slice(&((s >> 16) as i16).to_le_bytes());
            }
        }
        SampleEncoding::Pcm24 => {
            for &s in samples {
                let bytes = s.to_le_bytes();
                output.extend_from_slice(&bytes[1..4]);
            }
        }
        SampleEncoding::Pcm32 => {
            for &s in samples {
                output.extend_from_slice(&s.to_le_bytes());
            }
        }
        SampleEncoding::Float => {
            for &s in samples {
                output.extend_from_slice(&(s as f32 * I32_TO_FLOAT).to_le_bytes());
            }
        }
        SampleEncoding::Dsd => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size() {
        assert_eq!(AudioFormat::new(44100, 2, SampleEncoding::Pcm16).frame_size(), 4);
        assert_eq!(AudioFormat::new(96000, 2, SampleEncoding::Pcm24).frame_size(), 6);
        assert_eq!(AudioFormat::new(48000, 6, SampleEncoding::Float).frame_size(), 24);
        // DSD 固定每声道每帧 1 字节
        assert_eq!(AudioFormat::new(352800, 2, SampleEncoding::Dsd).frame_size(), 2);
    }

    #[test]
    fn test_parse_and_display() {
        let format: AudioFormat = "44100:16:2".parse().unwrap();
        assert_eq!(format, AudioFormat::new(44100, 2, SampleEncoding::Pcm16));
        assert_eq!(format.to_string(), "44100:16:2");

        let dsd: AudioFormat = "352800:dsd:2".parse().unwrap();
        assert_eq!(dsd.encoding, SampleEncoding::Dsd);

        assert!("44100:16".parse::<AudioFormat>().is_err());
        assert!("44100:12:2".parse::<AudioFormat>().is_err());
        assert!("0:16:2".parse::<AudioFormat>().is_err());
        assert!("44100:16:9".parse::<AudioFormat>().is_err());
        assert!("*:16:2".parse::<AudioFormat>().is_err());
    }

    #[test]
    fn test_mask_apply() {
        let mask: AudioFormatMask = "*:24:*".parse().unwrap();
        assert_eq!(mask.to_string(), "*:24:*");

        let source = AudioFormat::new(96000, 2, SampleEncoding::Pcm16);
        assert_eq!(mask.apply(source), AudioFormat::new(96000, 2, SampleEncoding::Pcm24));

        let empty = AudioFormatMask::default();
        assert!(empty.is_empty());
        assert_eq!(empty.apply(source), source);
    }

    #[test]
    fn test_bytes_for_duration() {
        let format = AudioFormat::new(44100, 2, SampleEncoding::Pcm16);
        assert_eq!(format.bytes_for(Duration::from_secs(1)), 44100 * 4);
        // 至少一帧
        assert_eq!(format.bytes_for(Duration::ZERO), 4);
        assert_eq!(format.duration_of(44100 * 4), Duration::from_secs(1));
    }

    #[test]
    fn test_24bit_sign_extend() {
        let mut samples = Vec::new();

        // 最大正值: 0x7FFFFF
        decode_samples(SampleEncoding::Pcm24, &[0xFF, 0xFF, 0x7F], &mut samples);
        assert_eq!(samples[0], 0x7FFFFF << 8);

        // 最小负值: 0x800000
        decode_samples(SampleEncoding::Pcm24, &[0x00, 0x00, 0x80], &mut samples);
        assert_eq!(samples[1], (-8388608i32) << 8);

        // -1: 0xFFFFFF
        decode_samples(SampleEncoding::Pcm24, &[0xFF, 0xFF, 0xFF], &mut samples);
        assert_eq!(samples[2], (-1i32) << 8);

        let mut bytes = Vec::new();
        encode_samples(SampleEncoding::Pcm24, &samples, &mut bytes);
        assert_eq!(bytes, [0xFF, 0xFF, 0x7F, 0x00, 0x00, 0x80, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_16bit_to_float() {
        let mut samples = Vec::new();
        // -16384 = -0.5
        decode_samples(SampleEncoding::Pcm16, &[0x00, 0xC0], &mut samples);

        let mut bytes = Vec::new();
        encode_samples(SampleEncoding::Float, &samples, &mut bytes);
        let value = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(value, -0.5);
    }

    #[test]
    fn test_float_clamp() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2.0f32.to_le_bytes());
        bytes.extend_from_slice(&(-3.0f32).to_le_bytes());

        let mut samples = Vec::new();
        assert_eq!(decode_samples(SampleEncoding::Float, &bytes, &mut samples), 2);
        assert_eq!(samples, [i32::MAX, i32::MIN]);
    }

    #[test]
    fn test_partial_sample_ignored() {
        let mut samples = Vec::new();
        assert_eq!(decode_samples(SampleEncoding::Pcm16, &[0x01, 0x00, 0x02], &mut samples), 1);
        assert_eq!(samples, [1 << 16]);
    }
}
