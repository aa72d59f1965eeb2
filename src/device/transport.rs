//! 硬件传输抽象
//!
//! DeviceSink 只通过这个很小的接口接触硬件：
//! negotiate / open / start / stop / close，外加一个 pull 式 render 回调。
//! 更换后端不需要改动 RingBuffer 或输出层。

use std::time::Duration;

use crate::audio::AudioFormat;
use crate::error::DeviceError;

/// Render 回调
///
/// 由硬件线程调用，参数是需要填满的目标区域。
///
/// **绝对禁止：**
/// - 分配
/// - 无界等待
/// - panic
pub type RenderFn = Box<dyn FnMut(&mut [u8]) + Send + 'static>;

/// 硬件传输
pub trait Transport: Send {
    /// 用于日志的名称
    fn name(&self) -> &str;

    /// 查询硬件对请求格式的处理结果
    ///
    /// 硬件可以调整格式（例如换成它支持的采样率），不支持时返回错误。
    /// 不改变任何状态。
    fn negotiate(&self, format: AudioFormat) -> Result<AudioFormat, DeviceError>;

    /// 以协商后的格式打开硬件并注册 render 回调，初始为停止状态
    fn open(&mut self, format: AudioFormat, render: RenderFn) -> Result<(), DeviceError>;

    /// 开始拉取数据
    fn start(&mut self) -> Result<(), DeviceError>;

    /// 停止拉取数据，可以再次 start
    fn stop(&mut self) -> Result<(), DeviceError>;

    /// 释放硬件资源和 render 回调
    fn close(&mut self);

    /// 硬件自身的输出延迟
    fn latency(&self) -> Duration {
        Duration::ZERO
    }
}
