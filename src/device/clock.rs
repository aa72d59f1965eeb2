//! 软件时钟传输
//!
//! 用一个独立线程模拟硬件：每个周期调用一次 render 回调拉取一个周期的数据。
//! 没有声卡的环境（CI、Linux、离线渲染）用它代替 Core Audio。
//!
//! 可选：
//! - `with_negotiator`: 模拟硬件调整或拒绝格式
//! - `with_tap`: 观察每个周期输出的字节（测试、电平显示）

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_utils::sync::{Parker, Unparker};

use super::transport::{RenderFn, Transport};
use crate::audio::AudioFormat;
use crate::error::DeviceError;

/// 默认周期（约等于常见声卡的 512 帧回调）
pub const DEFAULT_PERIOD: Duration = Duration::from_millis(10);

/// 格式协商函数
pub type Negotiator = Box<dyn Fn(AudioFormat) -> Result<AudioFormat, DeviceError> + Send>;

/// 输出观察函数，参数为本周期 render 回调填充后的字节
pub type TapFn = Box<dyn FnMut(&[u8]) + Send>;

/// 时钟线程与控制端共享的状态
struct ClockShared {
    running: AtomicBool,
    closing: AtomicBool,
}

/// 已打开的时钟会话
struct ClockSession {
    shared: Arc<ClockShared>,
    unparker: Unparker,
    thread: Option<JoinHandle<()>>,
}

/// 软件时钟传输
pub struct ClockTransport {
    name: String,
    period: Duration,
    negotiator: Option<Negotiator>,
    tap: Option<Arc<Mutex<TapFn>>>,
    session: Option<ClockSession>,
}

impl ClockTransport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            period: DEFAULT_PERIOD,
            negotiator: None,
            tap: None,
            session: None,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period.max(Duration::from_micros(100));
        self
    }

    pub fn with_negotiator<F>(mut self, negotiator: F) -> Self
    where
        F: Fn(AudioFormat) -> Result<AudioFormat, DeviceError> + Send + 'static,
    {
        self.negotiator = Some(Box::new(negotiator));
        self
    }

    pub fn with_tap<F>(mut self, tap: F) -> Self
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        self.tap = Some(Arc::new(Mutex::new(Box::new(tap))));
        self
    }
}

impl Transport for ClockTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn negotiate(&self, format: AudioFormat) -> Result<AudioFormat, DeviceError> {
        if format.channels == 0 || format.channels > crate::audio::format::MAX_CHANNELS {
            return Err(DeviceError::UnsupportedChannels(format.channels));
        }
        if format.sample_rate == 0 {
            return Err(DeviceError::UnsupportedSampleRate(format.sample_rate));
        }

        match &self.negotiator {
            Some(negotiate) => negotiate(format),
            None => Ok(format),
        }
    }

    fn open(&mut self, format: AudioFormat, mut render: RenderFn) -> Result<(), DeviceError> {
        if self.session.is_some() {
            return Err(DeviceError::Other(format!("{} is already open", self.name)));
        }

        let shared = Arc::new(ClockShared {
            running: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        });
        let parker = Parker::new();
        let unparker = parker.unparker().clone();

        let period = self.period;
        let period_bytes = format.bytes_for(period);
        let tap = self.tap.clone();
        let thread_shared = Arc::clone(&shared);

        let thread = thread::Builder::new()
            .name(format!("clock-{}", self.name))
            .spawn(move || {
                // 周期缓冲区在线程启动时一次性分配
                let mut buffer = vec![0u8; period_bytes];
                let mut next_tick = Instant::now();

                loop {
                    if thread_shared.closing.load(Ordering::Acquire) {
                        break;
                    }
                    if !thread_shared.running.load(Ordering::Acquire) {
                        parker.park();
                        next_tick = Instant::now();
                        continue;
                    }

                    render(&mut buffer);
                    if let Some(tap) = &tap {
                        let mut tap = tap.lock().unwrap_or_else(PoisonError::into_inner);
                        (*tap)(&buffer);
                    }

                    next_tick += period;
                    let now = Instant::now();
                    if next_tick > now {
                        parker.park_timeout(next_tick - now);
                    } else {
                        // 落后太多时不追赶
                        next_tick = now;
                    }
                }
            })
            .map_err(|e| DeviceError::Other(format!("failed to spawn clock thread: {}", e)))?;

        log::debug!(
            "{}: clock opened {} ({} bytes per {:?})",
            self.name,
            format,
            period_bytes,
            period
        );

        self.session = Some(ClockSession {
            shared,
            unparker,
            thread: Some(thread),
        });
        Ok(())
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        let session = self.session.as_ref().ok_or(DeviceError::NotOpen)?;
        session.shared.running.store(true, Ordering::Release);
        session.unparker.unpark();
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        let session = self.session.as_ref().ok_or(DeviceError::NotOpen)?;
        session.shared.running.store(false, Ordering::Release);
        session.unparker.unpark();
        Ok(())
    }

    fn close(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        session.shared.running.store(false, Ordering::Release);
        session.shared.closing.store(true, Ordering::Release);
        session.unparker.unpark();

        // render 回调随线程一起释放
        if let Some(thread) = session.thread.take() {
            if thread.join().is_err() {
                log::warn!("{}: clock thread panicked", self.name);
            }
        }
        log::debug!("{}: clock closed", self.name);
    }

    fn latency(&self) -> Duration {
        self.period
    }
}

impl Drop for ClockTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SampleEncoding;
    use std::sync::atomic::AtomicUsize;

    fn pcm16() -> AudioFormat {
        AudioFormat::new(8000, 1, SampleEncoding::Pcm16)
    }

    #[test]
    fn test_pulls_only_while_running() {
        let pulls = Arc::new(AtomicUsize::new(0));
        let mut clock = ClockTransport::new("test").with_period(Duration::from_millis(2));

        let counter = Arc::clone(&pulls);
        clock
            .open(pcm16(), Box::new(move |_out: &mut [u8]| {
                counter.fetch_add(1, Ordering::Relaxed);
            }))
            .unwrap();

        thread::sleep(Duration::from_millis(20));
        assert_eq!(pulls.load(Ordering::Relaxed), 0);

        clock.start().unwrap();
        thread::sleep(Duration::from_millis(30));
        clock.stop().unwrap();

        // 让正在进行的回调结束
        thread::sleep(Duration::from_millis(10));
        let after_stop = pulls.load(Ordering::Relaxed);
        assert!(after_stop > 0);

        thread::sleep(Duration::from_millis(20));
        assert_eq!(pulls.load(Ordering::Relaxed), after_stop);

        clock.close();
    }

    #[test]
    fn test_period_size_and_tap() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let mut clock = ClockTransport::new("tap")
            .with_period(Duration::from_millis(5))
            .with_tap(move |bytes: &[u8]| sink.lock().unwrap().push(bytes.to_vec()));

        clock
            .open(pcm16(), Box::new(|out: &mut [u8]| out.fill(7)))
            .unwrap();
        clock.start().unwrap();
        thread::sleep(Duration::from_millis(30));
        clock.close();

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        // 8000Hz * 5ms = 40 帧，每帧 2 字节
        assert!(seen.iter().all(|period| period.len() == 80 && period.iter().all(|&b| b == 7)));
    }

    #[test]
    fn test_negotiator_adjusts_format() {
        let clock = ClockTransport::new("fixed-rate").with_negotiator(|format| {
            Ok(AudioFormat {
                sample_rate: 48000,
                ..format
            })
        });

        let negotiated = clock.negotiate(AudioFormat::new(44100, 2, SampleEncoding::Float)).unwrap();
        assert_eq!(negotiated, AudioFormat::new(48000, 2, SampleEncoding::Float));

        assert!(matches!(
            clock.negotiate(AudioFormat::new(44100, 0, SampleEncoding::Float)),
            Err(DeviceError::UnsupportedChannels(0))
        ));
    }

    #[test]
    fn test_start_requires_open() {
        let mut clock = ClockTransport::new("closed");
        assert!(matches!(clock.start(), Err(DeviceError::NotOpen)));
        // 未打开时 close 是空操作
        clock.close();
    }
}
