//! 设备层
//!
//! [`DeviceSink`] 把一个 pull 式硬件传输包装成 [`OutputBackend`]：
//! 播放线程写入 RingBuffer，硬件 render 回调从中读取，不足部分填静音。
//!
//! 传输实现：
//! - [`ClockTransport`]: 软件时钟，任何平台可用
//! - `CoreAudioTransport`: macOS DefaultOutput

pub mod clock;
#[cfg(target_os = "macos")]
pub mod coreaudio;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use crate::audio::{AudioFormat, PlaybackStats, RingBuffer, StatsReport};
use crate::error::DeviceError;
use crate::output::backend::{Capabilities, OutputBackend};

pub use clock::ClockTransport;
#[cfg(target_os = "macos")]
pub use coreaudio::CoreAudioTransport;
pub use transport::{RenderFn, Transport};

/// 默认缓冲时长
pub const DEFAULT_BUFFER_TIME: Duration = Duration::from_secs(1);

/// 一次 Open/Close 周期的状态
struct DeviceSession {
    format: AudioFormat,
    ring: Arc<RingBuffer>,
    /// 传输是否在拉取数据
    started: bool,
}

/// 基于环形缓冲区的设备输出
pub struct DeviceSink {
    transport: Box<dyn Transport>,
    buffer_time: Duration,
    lock_memory: bool,
    stats: Arc<PlaybackStats>,
    session: Option<DeviceSession>,
}

impl DeviceSink {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            buffer_time: DEFAULT_BUFFER_TIME,
            lock_memory: false,
            stats: Arc::new(PlaybackStats::new()),
            session: None,
        }
    }

    /// 环形缓冲区能容纳的播放时长
    pub fn with_buffer_time(mut self, buffer_time: Duration) -> Self {
        self.buffer_time = buffer_time;
        self
    }

    /// 打开时 mlock 环形缓冲区
    pub fn with_memory_lock(mut self, lock_memory: bool) -> Self {
        self.lock_memory = lock_memory;
        self
    }

    /// 已缓冲但未被硬件取走的字节数
    pub fn buffered_bytes(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.ring.available())
    }

    fn session(&self) -> Result<&DeviceSession, DeviceError> {
        self.session.as_ref().ok_or(DeviceError::NotOpen)
    }
}

impl OutputBackend for DeviceSink {
    fn capabilities(&self) -> Capabilities {
        Capabilities::PAUSE
    }

    fn open(&mut self, format: AudioFormat) -> Result<AudioFormat, DeviceError> {
        if self.session.is_some() {
            return Err(DeviceError::Other(format!(
                "{} is already open",
                self.transport.name()
            )));
        }

        let format = self.transport.negotiate(format)?;
        let ring = Arc::new(RingBuffer::new(format.bytes_for(self.buffer_time)));
        if self.lock_memory {
            ring.lock_memory();
        }
        self.stats.reset();

        let render: RenderFn = {
            let ring = Arc::clone(&ring);
            let stats = Arc::clone(&self.stats);
            let silence = format.silence_byte();
            Box::new(move |out: &mut [u8]| {
                let delivered = ring.read(out);
                if delivered < out.len() {
                    out[delivered..].fill(silence);
                }
                stats.on_callback(out.len(), delivered);
            })
        };

        self.transport.open(format, render)?;

        log::debug!(
            "{}: buffer {} bytes ({:?})",
            self.transport.name(),
            ring.capacity(),
            format.duration_of(ring.capacity())
        );

        self.session = Some(DeviceSession {
            format,
            ring,
            started: false,
        });
        Ok(format)
    }

    fn close(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        self.stats.set_streaming(false);
        if session.started {
            if let Err(e) = self.transport.stop() {
                log::warn!("{}: failed to stop transport: {}", self.transport.name(), e);
            }
        }
        self.transport.close();
    }

    fn play(&mut self, data: &[u8]) -> Result<usize, DeviceError> {
        let session = self.session.as_mut().ok_or(DeviceError::NotOpen)?;

        if session.started {
            self.stats.set_streaming(true);
            session.ring.write(data);
            return Ok(data.len());
        }

        // 先放入能放下的部分，传输启动时缓冲区里已有数据
        let queued = session.ring.try_write(data);
        self.stats.set_streaming(true);
        self.transport.start()?;
        session.started = true;
        session.ring.write(&data[queued..]);
        Ok(data.len())
    }

    fn drain(&mut self) -> Result<(), DeviceError> {
        let session = self.session.as_mut().ok_or(DeviceError::NotOpen)?;

        // 排空时的缺口不算 underrun
        self.stats.set_streaming(false);
        if !session.started {
            if session.ring.is_empty() {
                return Ok(());
            }
            self.transport.start()?;
            session.started = true;
        }

        session.ring.wait_until_empty();
        Ok(())
    }

    fn cancel(&mut self) {
        self.stats.set_streaming(false);
        if let Some(session) = &self.session {
            session.ring.clear();
        }
    }

    fn pause(&mut self) -> Result<bool, DeviceError> {
        let session = self.session.as_mut().ok_or(DeviceError::NotOpen)?;

        self.stats.set_streaming(false);
        if session.started {
            self.transport.stop()?;
            session.started = false;
        }
        Ok(true)
    }

    fn delay(&self) -> Duration {
        match self.session() {
            Ok(session) => {
                session.format.duration_of(self.buffered_bytes()) + self.transport.latency()
            }
            Err(_) => Duration::ZERO,
        }
    }

    fn stats(&self) -> Option<StatsReport> {
        Some(self.stats.report())
    }
}

impl Drop for DeviceSink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SampleEncoding;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// 由测试手动驱动 render 回调的传输
    #[derive(Clone, Default)]
    struct ManualTransport {
        render: Arc<Mutex<Option<RenderFn>>>,
        running: Arc<AtomicBool>,
        starts: Arc<AtomicUsize>,
    }

    impl ManualTransport {
        fn pull(&self, len: usize) -> Vec<u8> {
            let mut out = vec![0xAA; len];
            if let Some(render) = self.render.lock().unwrap().as_mut() {
                render(&mut out);
            }
            out
        }
    }

    impl Transport for ManualTransport {
        fn name(&self) -> &str {
            "manual"
        }

        fn negotiate(&self, format: AudioFormat) -> Result<AudioFormat, DeviceError> {
            Ok(format)
        }

        fn open(&mut self, _format: AudioFormat, render: RenderFn) -> Result<(), DeviceError> {
            *self.render.lock().unwrap() = Some(render);
            Ok(())
        }

        fn start(&mut self) -> Result<(), DeviceError> {
            self.running.store(true, Ordering::SeqCst);
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&mut self) -> Result<(), DeviceError> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn close(&mut self) {
            *self.render.lock().unwrap() = None;
        }
    }

    fn pcm16_mono() -> AudioFormat {
        AudioFormat::new(8000, 1, SampleEncoding::Pcm16)
    }

    fn manual_sink() -> (DeviceSink, ManualTransport) {
        let transport = ManualTransport::default();
        // 8000Hz * 10ms = 80 帧 = 160 字节
        let sink = DeviceSink::new(Box::new(transport.clone()))
            .with_buffer_time(Duration::from_millis(10));
        (sink, transport)
    }

    #[test]
    fn test_first_play_starts_transport() {
        let (mut sink, transport) = manual_sink();
        sink.open(pcm16_mono()).unwrap();
        assert!(!transport.running.load(Ordering::SeqCst));

        let data: Vec<u8> = (0..100u8).collect();
        assert_eq!(sink.play(&data).unwrap(), 100);
        assert!(transport.running.load(Ordering::SeqCst));
        assert_eq!(transport.starts.load(Ordering::SeqCst), 1);

        assert_eq!(transport.pull(60), &data[..60]);

        // 剩余 40 字节之后补静音
        let tail = transport.pull(60);
        assert_eq!(&tail[..40], &data[60..]);
        assert!(tail[40..].iter().all(|&b| b == 0));

        let stats = sink.stats().unwrap();
        assert_eq!(stats.bytes_played, 100);
        assert_eq!(stats.underrun_count, 1);
    }

    #[test]
    fn test_dsd_silence_before_data() {
        let (mut sink, transport) = manual_sink();
        sink.open(AudioFormat::new(352800, 2, SampleEncoding::Dsd)).unwrap();

        let out = transport.pull(32);
        assert!(out.iter().all(|&b| b == 0x69));
    }

    #[test]
    fn test_pause_stops_and_play_restarts() {
        let (mut sink, transport) = manual_sink();
        sink.open(pcm16_mono()).unwrap();
        sink.play(&[1; 20]).unwrap();

        assert!(sink.pause().unwrap());
        assert!(!transport.running.load(Ordering::SeqCst));

        // 暂停期间数据保留，恢复播放时重新启动传输
        sink.play(&[2; 20]).unwrap();
        assert!(transport.running.load(Ordering::SeqCst));
        assert_eq!(transport.starts.load(Ordering::SeqCst), 2);
        assert_eq!(sink.buffered_bytes(), 40);
    }

    #[test]
    fn test_cancel_and_delay() {
        let (mut sink, _transport) = manual_sink();
        sink.open(pcm16_mono()).unwrap();

        sink.play(&[0; 160]).unwrap();
        assert_eq!(sink.delay(), Duration::from_millis(10));

        sink.cancel();
        assert_eq!(sink.buffered_bytes(), 0);
        assert_eq!(sink.delay(), Duration::ZERO);
    }

    #[test]
    fn test_drain_restarts_stopped_transport() {
        let (mut sink, transport) = manual_sink();
        sink.open(pcm16_mono()).unwrap();
        sink.play(&[3; 40]).unwrap();
        sink.pause().unwrap();

        let consumer = {
            let transport = transport.clone();
            std::thread::spawn(move || {
                while !transport.running.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
                transport.pull(40)
            })
        };

        sink.drain().unwrap();
        assert_eq!(consumer.join().unwrap(), vec![3; 40]);
        assert_eq!(sink.buffered_bytes(), 0);
    }

    #[test]
    fn test_starved_callback_counts_underrun() {
        let (mut sink, transport) = manual_sink();
        sink.open(pcm16_mono()).unwrap();
        sink.play(&[5; 20]).unwrap();

        assert_eq!(transport.pull(20), vec![5; 20]);
        // 播放中缓冲区被读空
        assert_eq!(transport.pull(20), vec![0; 20]);
        assert_eq!(sink.stats().unwrap().underrun_count, 1);

        // 取消后的静音不计
        sink.cancel();
        transport.pull(20);
        let stats = sink.stats().unwrap();
        assert_eq!(stats.underrun_count, 1);
        assert_eq!(stats.silence_bytes, 40);
    }

    #[test]
    fn test_close_releases_session() {
        let (mut sink, transport) = manual_sink();
        sink.open(pcm16_mono()).unwrap();
        assert!(sink.open(pcm16_mono()).is_err());

        sink.play(&[1; 8]).unwrap();
        sink.close();

        assert!(transport.render.lock().unwrap().is_none());
        assert!(!transport.running.load(Ordering::SeqCst));
        assert!(matches!(sink.play(&[1; 8]), Err(DeviceError::NotOpen)));
        assert_eq!(sink.delay(), Duration::ZERO);

        // 可以重新打开
        sink.open(pcm16_mono()).unwrap();
    }

    #[test]
    fn test_clock_transport_drain() {
        let format = AudioFormat::new(8000, 1, SampleEncoding::Pcm16);
        let transport = ClockTransport::new("clock").with_period(Duration::from_millis(2));
        let mut sink = DeviceSink::new(Box::new(transport)).with_buffer_time(Duration::from_millis(20));
        sink.open(format).unwrap();

        // 50ms 数据，超过缓冲区容量
        let data = vec![5u8; format.bytes_for(Duration::from_millis(50))];
        sink.play(&data).unwrap();
        sink.drain().unwrap();

        assert_eq!(sink.buffered_bytes(), 0);
        assert_eq!(sink.stats().unwrap().bytes_played, data.len() as u64);
        sink.close();
    }
}
