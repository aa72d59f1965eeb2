//! 播放统计模块
//!
//! 在 render 回调中收集统计信息，全部为原子操作

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// 播放统计收集器
///
/// 所有操作都是 lock-free 的，适合在音频回调中使用。
/// 回调线程写入的计数器各自独占一个 cache line。
pub struct PlaybackStats {
    callback_count: CachePadded<AtomicU64>,
    underrun_count: CachePadded<AtomicU64>,
    bytes_played: CachePadded<AtomicU64>,
    silence_bytes: CachePadded<AtomicU64>,
    /// 生产者正在送数据（播放中，未排空/取消/暂停）
    streaming: AtomicBool,
}

impl PlaybackStats {
    pub fn new() -> Self {
        Self {
            callback_count: CachePadded::new(AtomicU64::new(0)),
            underrun_count: CachePadded::new(AtomicU64::new(0)),
            bytes_played: CachePadded::new(AtomicU64::new(0)),
            silence_bytes: CachePadded::new(AtomicU64::new(0)),
            streaming: AtomicBool::new(false),
        }
    }

    /// 在 render callback 内调用
    ///
    /// `requested`: 硬件请求的字节数，`delivered`: 从 ring buffer 读到的字节数。
    /// 播放中出现缺口（包括完全读空）计为 underrun；启动前、排空、取消和暂停后只计静音。
    #[inline]
    pub fn on_callback(&self, requested: usize, delivered: usize) {
        self.callback_count.fetch_add(1, Ordering::Relaxed);

        if delivered > 0 {
            self.bytes_played.fetch_add(delivered as u64, Ordering::Relaxed);
        }

        let shortfall = requested - delivered.min(requested);
        if shortfall > 0 {
            self.silence_bytes.fetch_add(shortfall as u64, Ordering::Relaxed);
            if self.streaming.load(Ordering::Relaxed) {
                self.underrun_count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// 生产者开始/停止送数据
    #[inline]
    pub fn set_streaming(&self, streaming: bool) {
        self.streaming.store(streaming, Ordering::Relaxed);
    }

    #[inline]
    pub fn underrun_count(&self) -> u64 {
        self.underrun_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn callback_count(&self) -> u64 {
        self.callback_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bytes_played(&self) -> u64 {
        self.bytes_played.load(Ordering::Relaxed)
    }

    pub fn report(&self) -> StatsReport {
        StatsReport {
            callback_count: self.callback_count(),
            underrun_count: self.underrun_count(),
            bytes_played: self.bytes_played(),
            silence_bytes: self.silence_bytes.load(Ordering::Relaxed),
        }
    }

    /// 重置统计
    pub fn reset(&self) {
        self.callback_count.store(0, Ordering::Relaxed);
        self.underrun_count.store(0, Ordering::Relaxed);
        self.bytes_played.store(0, Ordering::Relaxed);
        self.silence_bytes.store(0, Ordering::Relaxed);
        self.streaming.store(false, Ordering::Relaxed);
    }
}

impl Default for PlaybackStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 统计报告
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsReport {
    pub callback_count: u64,
    pub underrun_count: u64,
    pub bytes_played: u64,
    pub silence_bytes: u64,
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Playback Statistics")?;
        writeln!(f, "===================")?;
        writeln!(f, "Total callbacks: {}", self.callback_count)?;
        writeln!(f, "Bytes played: {}", self.bytes_played)?;
        writeln!(f, "Silence bytes: {}", self.silence_bytes)?;
        writeln!(f, "Underruns: {}", self.underrun_count)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_underrun_only_while_streaming() {
        let stats = PlaybackStats::new();

        // 传输启动前的纯静音
        stats.on_callback(512, 0);
        assert_eq!(stats.underrun_count(), 0);

        stats.set_streaming(true);
        stats.on_callback(512, 512);
        // 播放中读空也是 underrun
        stats.on_callback(512, 0);
        assert_eq!(stats.underrun_count(), 1);
        stats.on_callback(512, 512);
        stats.on_callback(512, 100);
        assert_eq!(stats.underrun_count(), 2);

        // 排空时的最后一个不完整周期
        stats.set_streaming(false);
        stats.on_callback(512, 100);

        let report = stats.report();
        assert_eq!(report.callback_count, 6);
        assert_eq!(report.bytes_played, 1224);
        assert_eq!(report.silence_bytes, 512 + 512 + 412 + 412);
        assert_eq!(report.underrun_count, 2);
    }

    #[test]
    fn test_reset() {
        let stats = PlaybackStats::new();
        stats.on_callback(64, 32);
        stats.reset();
        assert_eq!(stats.report(), StatsReport {
            callback_count: 0,
            underrun_count: 0,
            bytes_played: 0,
            silence_bytes: 0,
        });
    }
}
