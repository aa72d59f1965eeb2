//! 带滤波链的输出
//!
//! [`FilteredOutput`] 装饰一个 [`OutputBackend`]，负责：
//! - 用格式掩码和设备协商出的格式配置滤波链，配置失败时按回退表重试
//! - 打开/关闭时绑定和解绑软件混音器
//! - 暂停状态机（BeginPause / IteratePause）
//!
//! 状态只在持有 `&mut self` 的播放线程上变化。

pub mod backend;

use std::time::Duration;

use crate::audio::{AudioFormat, AudioFormatMask, SampleEncoding, StatsReport};
use crate::device::{DeviceSink, Transport, DEFAULT_BUFFER_TIME};
use crate::error::{error_chain, DeviceError, OutputError};
use crate::filter::{ConvertFilter, FilterChain, VolumeControl, VolumeFilter};
use crate::mixer::{create_mixer, Mixer, MixerKind};

pub use backend::{Capabilities, OutputBackend};

/// 滤波链配置失败时可用的编码回退，每次打开最多使用一次
const FORMAT_FALLBACKS: &[(SampleEncoding, SampleEncoding)] =
    &[(SampleEncoding::Dsd, SampleEncoding::Float)];

const MAX_FORMAT_RETRIES: usize = 1;

fn fallback_encoding(encoding: SampleEncoding) -> Option<SampleEncoding> {
    FORMAT_FALLBACKS
        .iter()
        .find(|(from, _)| *from == encoding)
        .map(|&(_, to)| to)
}

/// 输出状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputState {
    Closed,
    Open,
    Paused,
}

/// 输出配置
#[derive(Clone, Debug)]
pub struct OutputConfig {
    /// 日志中使用的名称
    pub name: String,
    /// 覆盖源格式的字段
    pub format_mask: AudioFormatMask,
    pub mixer: Option<MixerKind>,
    /// 初始音量 0..=100
    pub volume: u8,
    /// 设备缓冲时长
    pub buffer_time: Duration,
    pub lock_memory: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            format_mask: AudioFormatMask::default(),
            mixer: None,
            volume: 100,
            buffer_time: DEFAULT_BUFFER_TIME,
            lock_memory: false,
        }
    }
}

/// 带滤波链的输出
pub struct FilteredOutput {
    name: String,
    format_mask: AudioFormatMask,
    backend: Box<dyn OutputBackend>,
    chain: FilterChain,
    mixer: Option<Box<dyn Mixer>>,
    state: OutputState,
    in_format: Option<AudioFormat>,
    out_format: Option<AudioFormat>,
}

impl FilteredOutput {
    pub fn new(name: impl Into<String>, backend: Box<dyn OutputBackend>, chain: FilterChain) -> Self {
        Self {
            name: name.into(),
            format_mask: AudioFormatMask::default(),
            backend,
            chain,
            mixer: None,
            state: OutputState::Closed,
            in_format: None,
            out_format: None,
        }
    }

    /// 按配置在硬件传输上组装完整输出
    pub fn from_config(config: &OutputConfig, transport: Box<dyn Transport>) -> Self {
        let sink = DeviceSink::new(transport)
            .with_buffer_time(config.buffer_time)
            .with_memory_lock(config.lock_memory);

        let mut chain = FilterChain::new(Box::new(ConvertFilter::new()));
        if config.mixer == Some(MixerKind::Software) {
            chain = chain.with_volume(VolumeFilter::new(VolumeControl::new(config.volume)));
        }

        let mut output = Self::new(config.name.clone(), Box::new(sink), chain)
            .with_format_mask(config.format_mask);
        if let Some(kind) = config.mixer {
            output = output.with_mixer(create_mixer(kind, config.volume));
        }
        output
    }

    pub fn with_format_mask(mut self, mask: AudioFormatMask) -> Self {
        self.format_mask = mask;
        self
    }

    pub fn with_mixer(mut self, mixer: Box<dyn Mixer>) -> Self {
        self.mixer = Some(mixer);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> OutputState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state != OutputState::Closed
    }

    /// 设备实际使用的格式
    pub fn out_format(&self) -> Option<AudioFormat> {
        self.out_format
    }

    pub fn capabilities(&self) -> Capabilities {
        self.backend.capabilities()
    }

    pub fn supports_enable_disable(&self) -> bool {
        self.capabilities().contains(Capabilities::ENABLE_DISABLE)
    }

    pub fn supports_pause(&self) -> bool {
        self.capabilities().contains(Capabilities::PAUSE)
    }

    pub fn mixer(&self) -> Option<&dyn Mixer> {
        self.mixer.as_deref()
    }

    pub fn mixer_mut(&mut self) -> Option<&mut (dyn Mixer + 'static)> {
        self.mixer.as_deref_mut()
    }

    pub fn stats(&self) -> Option<StatsReport> {
        self.backend.stats()
    }

    /// 后端不区分 enable 和 open 时什么都不做
    pub fn enable(&mut self) -> Result<(), OutputError> {
        if !self.supports_enable_disable() {
            return Ok(());
        }
        self.backend.enable().map_err(|source| OutputError::Enable {
            name: self.name.clone(),
            source,
        })
    }

    pub fn disable(&mut self) {
        if self.supports_enable_disable() {
            self.backend.disable();
        }
    }

    /// 打开设备并配置滤波链
    ///
    /// 设备格式 = 格式掩码作用于 `in_format`，再经设备协商。
    /// 滤波链配置失败时关闭设备；若编码在回退表中，换编码重试一次。
    pub fn open(&mut self, in_format: AudioFormat) -> Result<(), OutputError> {
        if self.state != OutputState::Closed {
            return Err(OutputError::InvalidState("output is already open"));
        }

        let mut desired = self.format_mask.apply(in_format);
        let mut retries = 0;

        let out_format = loop {
            match self.open_output_and_convert(in_format, desired) {
                Ok(out_format) => break out_format,
                Err(err) => {
                    let fallback = match &err {
                        OutputError::Convert { .. } if retries < MAX_FORMAT_RETRIES => {
                            fallback_encoding(desired.encoding)
                        }
                        _ => None,
                    };
                    let Some(encoding) = fallback else {
                        return Err(err);
                    };

                    log::error!("{}", error_chain(&err));
                    log::error!("Retrying without {}", desired.encoding.as_str().to_uppercase());
                    desired = desired.with_encoding(encoding);
                    retries += 1;
                }
            }
        };

        self.in_format = Some(in_format);
        self.out_format = Some(out_format);
        self.open_software_mixer();
        self.state = OutputState::Open;
        Ok(())
    }

    fn open_output_and_convert(
        &mut self,
        in_format: AudioFormat,
        desired: AudioFormat,
    ) -> Result<AudioFormat, OutputError> {
        let out_format = self.backend.open(desired).map_err(|source| OutputError::Open {
            name: self.name.clone(),
            source,
        })?;

        log::debug!("opened {} audio_format={}", self.name, out_format);

        if let Err(source) = self.chain.configure(in_format, out_format) {
            self.backend.close();
            return Err(OutputError::Convert {
                name: self.name.clone(),
                source,
            });
        }

        Ok(out_format)
    }

    fn open_software_mixer(&mut self) {
        if let Some(mixer) = self.mixer.as_deref_mut() {
            self.chain.bind_mixer(mixer);
        }
    }

    fn close_software_mixer(&mut self) {
        if let Some(mixer) = self.mixer.as_deref_mut() {
            self.chain.unbind_mixer(mixer);
        }
    }

    /// 关闭输出；`drain` 为 true 时先等待已缓冲的数据播放完
    pub fn close(&mut self, drain: bool) {
        if self.state == OutputState::Closed {
            return;
        }

        if drain {
            self.drain();
        } else {
            self.cancel();
        }

        self.backend.close();
        self.close_software_mixer();
        self.chain.reset();

        self.state = OutputState::Closed;
        self.in_format = None;
        self.out_format = None;
        log::debug!("closed {}", self.name);
    }

    /// 经过滤波链写入设备，返回消耗的输入字节数
    ///
    /// 只消耗整帧，不足一帧的尾部由调用方下次重新提交
    pub fn play(&mut self, data: &[u8]) -> Result<usize, OutputError> {
        match self.state {
            OutputState::Closed => return Err(OutputError::InvalidState("output is not open")),
            OutputState::Paused => self.state = OutputState::Open,
            OutputState::Open => {}
        }

        let frame_size = self.in_format.map_or(1, |format| format.frame_size());
        let whole = data.len() - data.len() % frame_size;
        if whole == 0 {
            return Ok(0);
        }

        let mut rest = self.chain.apply(&data[..whole]);
        while !rest.is_empty() {
            let written = self.backend.play(rest).map_err(|source| OutputError::Play {
                name: self.name.clone(),
                source,
            })?;
            if written == 0 {
                return Err(OutputError::Play {
                    name: self.name.clone(),
                    source: DeviceError::Stalled,
                });
            }
            rest = &rest[written.min(rest.len())..];
        }

        Ok(whole)
    }

    pub fn drain(&mut self) {
        if let Err(e) = self.backend.drain() {
            log::warn!("Failed to drain {}: {}", self.name, e);
        }
    }

    pub fn cancel(&mut self) {
        self.backend.cancel();
    }

    /// 进入暂停：丢弃已缓冲的数据
    pub fn begin_pause(&mut self) {
        self.cancel();
        if self.state == OutputState::Open {
            self.state = OutputState::Paused;
        }
    }

    /// 暂停期间周期性调用，返回 false 时调用方应关闭输出
    pub fn iterate_pause(&mut self) -> bool {
        match self.backend.pause() {
            Ok(keep_paused) => keep_paused,
            Err(e) => {
                log::error!("Failed to pause {}: {}", self.name, e);
                false
            }
        }
    }

    pub fn delay(&self) -> Duration {
        self.backend.delay()
    }
}

impl Drop for FilteredOutput {
    fn drop(&mut self) {
        self.close(false);
    }
}
