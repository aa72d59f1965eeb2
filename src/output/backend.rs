//! 输出后端接口
//!
//! FilteredOutput 装饰的对象。只有 `open` / `close` / `play` 是必须的，
//! 其余操作的默认实现对应"不支持"。

use std::ops::BitOr;
use std::time::Duration;

use crate::audio::{AudioFormat, StatsReport};
use crate::error::DeviceError;

/// 后端可选能力
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities(u8);

impl Capabilities {
    /// 支持 enable / disable（例如持有独占设备）
    pub const ENABLE_DISABLE: Self = Self(1 << 0);
    /// 支持不丢弃设备的暂停
    pub const PAUSE: Self = Self(1 << 1);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// 输出后端
pub trait OutputBackend: Send {
    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }

    fn enable(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn disable(&mut self) {}

    /// 以请求格式打开设备，返回设备实际使用的格式
    fn open(&mut self, format: AudioFormat) -> Result<AudioFormat, DeviceError>;

    fn close(&mut self);

    /// 写入数据，返回接收的字节数（0 表示设备停滞）
    fn play(&mut self, data: &[u8]) -> Result<usize, DeviceError>;

    /// 等待已接收的数据全部播放完毕
    fn drain(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    /// 丢弃已接收但未播放的数据
    fn cancel(&mut self) {}

    /// 暂停期间周期性调用
    ///
    /// 返回 `false` 表示无法保持暂停，调用方应关闭设备
    fn pause(&mut self) -> Result<bool, DeviceError> {
        Ok(false)
    }

    /// 已接收但尚未播放的数据时长
    fn delay(&self) -> Duration {
        Duration::ZERO
    }

    fn stats(&self) -> Option<StatsReport> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities() {
        let caps = Capabilities::PAUSE;
        assert!(caps.contains(Capabilities::PAUSE));
        assert!(!caps.contains(Capabilities::ENABLE_DISABLE));

        let both = caps | Capabilities::ENABLE_DISABLE;
        assert!(both.contains(Capabilities::PAUSE | Capabilities::ENABLE_DISABLE));
        assert!(Capabilities::empty().contains(Capabilities::empty()));
    }
}
