//! 播放引擎
//!
//! 播放线程从字节源读取整帧数据块，经 FilteredOutput 写入设备。
//! 控制端（主线程、信号处理）只通过原子标志和 park/unpark 与播放线程通信。
//!
//! 生命周期：
//! - 源读完：close(drain = true)，等缓冲区播放完
//! - stop：close(drain = false)，丢弃缓冲区
//! - 暂停：BeginPause 后循环 IteratePause；后端不能保持暂停时关闭，恢复时重新打开

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::{AudioFormat, StatsReport};
use crate::error::OutputError;
use crate::output::FilteredOutput;

/// 播放状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
}

impl PlaybackState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Playing,
            2 => Self::Paused,
            _ => Self::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Playing => 1,
            Self::Paused => 2,
        }
    }
}

/// 引擎配置
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// 每次写入输出的数据块时长
    pub chunk_duration: Duration,
    /// 暂停期间调用 IteratePause 的间隔
    pub pause_poll: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_duration: Duration::from_millis(50),
            pause_poll: Duration::from_millis(100),
        }
    }
}

/// 引擎错误
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Output(#[from] OutputError),

    #[error("failed to read source")]
    Source(#[source] io::Error),

    #[error("failed to spawn player thread")]
    Spawn(#[source] io::Error),

    #[error("player thread panicked")]
    PlayerPanicked,
}

/// 播放结束时的汇总
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSummary {
    /// 写入输出的源字节数
    pub bytes_played: u64,
    /// 对应的源时长
    pub duration: Duration,
    /// 被 stop 打断（没有排空）
    pub interrupted: bool,
    pub stats: Option<StatsReport>,
}

/// 播放线程共享状态
///
/// 完全基于原子操作
struct PlayerState {
    stopping: AtomicBool,
    paused: AtomicBool,
    finished: AtomicBool,
    state: AtomicU8,
    bytes_played: AtomicU64,
}

impl PlayerState {
    fn set_state(&self, state: PlaybackState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }
}

type PlayerExit = (FilteredOutput, Result<EngineSummary, EngineError>);

/// 播放引擎
pub struct Engine {
    in_format: AudioFormat,
    state: Arc<PlayerState>,
    player: Option<JoinHandle<PlayerExit>>,
}

impl Engine {
    /// 启动播放线程
    ///
    /// 输出在播放线程上打开，打开失败通过 [`Engine::join`] 返回
    pub fn spawn(
        output: FilteredOutput,
        source: Box<dyn Read + Send>,
        in_format: AudioFormat,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let state = Arc::new(PlayerState {
            stopping: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            state: AtomicU8::new(PlaybackState::Stopped.as_u8()),
            bytes_played: AtomicU64::new(0),
        });

        let thread_state = Arc::clone(&state);
        let player = thread::Builder::new()
            .name("player".to_string())
            .spawn(move || {
                let mut output = output;
                let mut source = source;
                let result = Self::player_thread_main(
                    &mut output,
                    &mut *source,
                    in_format,
                    &thread_state,
                    &config,
                );

                if let Err(e) = &result {
                    log::error!("{}: {}", output.name(), crate::error::error_chain(e));
                    output.close(false);
                }

                thread_state.set_state(PlaybackState::Stopped);
                thread_state.finished.store(true, Ordering::Release);

                let result = result.map(|interrupted| {
                    let bytes_played = thread_state.bytes_played.load(Ordering::Acquire);
                    EngineSummary {
                        bytes_played,
                        duration: in_format.duration_of(bytes_played as usize),
                        interrupted,
                        stats: output.stats(),
                    }
                });
                (output, result)
            })
            .map_err(EngineError::Spawn)?;

        Ok(Self {
            in_format,
            state,
            player: Some(player),
        })
    }

    /// 播放线程主循环，返回是否被 stop 打断
    fn player_thread_main(
        output: &mut FilteredOutput,
        source: &mut dyn Read,
        in_format: AudioFormat,
        state: &PlayerState,
        config: &EngineConfig,
    ) -> Result<bool, EngineError> {
        output.open(in_format)?;
        state.set_state(PlaybackState::Playing);
        log::info!(
            "{}: playing {} as {}",
            output.name(),
            in_format,
            output.out_format().map_or_else(|| "?".to_string(), |f| f.to_string())
        );

        let frame_size = in_format.frame_size();
        let mut buffer = vec![0u8; in_format.bytes_for(config.chunk_duration)];

        loop {
            if state.stopping.load(Ordering::Acquire) {
                output.close(false);
                return Ok(true);
            }

            if state.paused.load(Ordering::Acquire) {
                Self::wait_while_paused(output, in_format, state, config)?;
                continue;
            }

            let filled = read_chunk(source, &mut buffer).map_err(EngineError::Source)?;
            let whole = filled - filled % frame_size;

            if whole > 0 {
                output.play(&buffer[..whole])?;
                state.bytes_played.fetch_add(whole as u64, Ordering::Release);
            }

            if filled < buffer.len() {
                if filled > whole {
                    log::debug!("dropping {} trailing bytes of a partial frame", filled - whole);
                }
                output.close(true);
                return Ok(false);
            }
        }
    }

    fn wait_while_paused(
        output: &mut FilteredOutput,
        in_format: AudioFormat,
        state: &PlayerState,
        config: &EngineConfig,
    ) -> Result<(), EngineError> {
        state.set_state(PlaybackState::Paused);
        output.begin_pause();
        log::info!("Paused");

        if !output.supports_pause() {
            output.close(false);
        }

        while state.paused.load(Ordering::Acquire) && !state.stopping.load(Ordering::Acquire) {
            if output.is_open() && !output.iterate_pause() {
                log::warn!("{} cannot stay paused, closing", output.name());
                output.close(false);
            }
            // resume / stop 会 unpark
            thread::park_timeout(config.pause_poll);
        }

        if state.stopping.load(Ordering::Acquire) {
            return Ok(());
        }

        if !output.is_open() {
            output.open(in_format)?;
        }
        state.set_state(PlaybackState::Playing);
        log::info!("Resumed");
        Ok(())
    }

    fn wake_player(&self) {
        if let Some(player) = &self.player {
            player.thread().unpark();
        }
    }

    pub fn pause(&self) {
        self.state.paused.store(true, Ordering::Release);
        self.wake_player();
    }

    pub fn resume(&self) {
        self.state.paused.store(false, Ordering::Release);
        self.wake_player();
    }

    pub fn toggle_pause(&self) {
        if self.state.paused.load(Ordering::Acquire) {
            self.resume();
        } else {
            self.pause();
        }
    }

    /// 请求停止，不等待
    pub fn stop(&self) {
        self.state.stopping.store(true, Ordering::Release);
        self.wake_player();
    }

    pub fn state(&self) -> PlaybackState {
        PlaybackState::from_u8(self.state.state.load(Ordering::Acquire))
    }

    pub fn is_finished(&self) -> bool {
        self.state.finished.load(Ordering::Acquire)
    }

    pub fn bytes_played(&self) -> u64 {
        self.state.bytes_played.load(Ordering::Acquire)
    }

    /// 已写入输出的源时长
    pub fn position(&self) -> Duration {
        self.in_format.duration_of(self.bytes_played() as usize)
    }

    /// 等待播放线程结束，取回输出
    pub fn join(mut self) -> Result<(FilteredOutput, EngineSummary), EngineError> {
        let player = self.player.take().ok_or(EngineError::PlayerPanicked)?;
        let (output, result) = player.join().map_err(|_| EngineError::PlayerPanicked)?;
        result.map(|summary| (output, summary))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(player) = self.player.take() {
            self.state.stopping.store(true, Ordering::Release);
            player.thread().unpark();
            if player.join().is_err() {
                log::warn!("player thread panicked");
            }
        }
    }
}

/// 尽量填满 `buffer`，只在源结束时返回较少的字节
fn read_chunk(source: &mut dyn Read, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match source.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
