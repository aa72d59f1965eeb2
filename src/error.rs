//! 错误类型
//!
//! - [`DeviceError`]: 硬件拒绝格式、传输启动/停止失败
//! - [`ConfigurationError`]: 滤波链无法为协商格式完成配置
//! - [`OutputError`]: 输出层附加的上下文包装，始终保留原始错误作为 `source`

use crate::audio::{AudioFormat, SampleEncoding};

/// 设备 / 传输层错误
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// 硬件不支持该样本编码
    #[error("sample encoding {0} not supported by device")]
    UnsupportedEncoding(SampleEncoding),

    #[error("sample rate {0}Hz not supported by device")]
    UnsupportedSampleRate(u32),

    #[error("{0} channels not supported by device")]
    UnsupportedChannels(u8),

    /// 底层音频 API 返回的错误码
    #[error("transport {op} failed: status {status}")]
    Transport { op: &'static str, status: i32 },

    #[error("device is not open")]
    NotOpen,

    /// 设备没有接收任何数据
    #[error("device accepted no data")]
    Stalled,

    #[error("{0}")]
    Other(String),
}

impl DeviceError {
    pub fn transport(op: &'static str, status: i32) -> Self {
        Self::Transport { op, status }
    }
}

/// 滤波链配置错误
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("cannot convert {from} to {to}: {reason}")]
    UnsupportedConversion {
        from: AudioFormat,
        to: AudioFormat,
        reason: &'static str,
    },

    #[error("software volume not supported for {0}")]
    UnsupportedVolumeFormat(AudioFormat),

    #[error("{0}")]
    InvalidFormat(String),
}

/// 输出层错误
///
/// 每个变体都带有输出的日志名称，原始错误通过 `source()` 保留
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("Failed to enable output {name}")]
    Enable {
        name: String,
        #[source]
        source: DeviceError,
    },

    #[error("Failed to open {name}")]
    Open {
        name: String,
        #[source]
        source: DeviceError,
    },

    #[error("Failed to convert for {name}")]
    Convert {
        name: String,
        #[source]
        source: ConfigurationError,
    },

    #[error("Failed to play on {name}")]
    Play {
        name: String,
        #[source]
        source: DeviceError,
    },

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),
}

impl OutputError {
    /// 滤波链配置失败时返回原始的 [`ConfigurationError`]
    pub fn configuration_error(&self) -> Option<&ConfigurationError> {
        match self {
            Self::Convert { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn device_error(&self) -> Option<&DeviceError> {
        match self {
            Self::Enable { source, .. } | Self::Open { source, .. } | Self::Play { source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }
}

/// 拼接完整的错误链，用于日志
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
