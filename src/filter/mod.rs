//! 滤波链
//!
//! 输入格式 → [convert] → 设备格式 → [volume] → 设备
//!
//! 每次 Open 成功协商设备格式后重新配置，
//! 内部缓冲区不跨格式复用。

pub mod convert;
pub mod volume;

use crate::audio::AudioFormat;
use crate::error::ConfigurationError;
use crate::mixer::{Mixer, MixerKind};

pub use convert::ConvertFilter;
pub use volume::{VolumeControl, VolumeFilter};

/// 滤波器
pub trait Filter: Send {
    fn name(&self) -> &'static str;

    /// 为输入/输出格式准备内部状态
    fn configure(
        &mut self,
        in_format: AudioFormat,
        out_format: AudioFormat,
    ) -> Result<(), ConfigurationError>;

    /// 处理一块数据，返回的切片在下一次调用前有效
    fn apply<'a>(&'a mut self, src: &'a [u8]) -> &'a [u8];

    /// 释放格式相关的缓冲区
    fn reset(&mut self) {}
}

/// 转换 + 可选软件音量
pub struct FilterChain {
    convert: Box<dyn Filter>,
    volume: Option<VolumeFilter>,
}

impl FilterChain {
    pub fn new(convert: Box<dyn Filter>) -> Self {
        Self {
            convert,
            volume: None,
        }
    }

    /// 在转换之后追加软件音量级
    pub fn with_volume(mut self, volume: VolumeFilter) -> Self {
        self.volume = Some(volume);
        self
    }

    pub fn configure(
        &mut self,
        in_format: AudioFormat,
        out_format: AudioFormat,
    ) -> Result<(), ConfigurationError> {
        self.reset();

        if let Err(e) = self.convert.configure(in_format, out_format) {
            log::debug!("{} filter rejected {} -> {}: {}", self.convert.name(), in_format, out_format, e);
            return Err(e);
        }
        if let Some(volume) = &mut self.volume {
            if let Err(e) = volume.configure(out_format, out_format) {
                log::debug!("{} filter rejected {}: {}", volume.name(), out_format, e);
                self.convert.reset();
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn apply<'a>(&'a mut self, src: &'a [u8]) -> &'a [u8] {
        let converted = self.convert.apply(src);
        match &mut self.volume {
            Some(volume) => volume.apply(converted),
            None => converted,
        }
    }

    pub fn reset(&mut self) {
        self.convert.reset();
        if let Some(volume) = &mut self.volume {
            volume.reset();
        }
    }

    pub fn volume_control(&self) -> Option<VolumeControl> {
        self.volume.as_ref().map(VolumeFilter::control)
    }

    /// 把音量级接到软件混音器上；混音器类型不符或没有音量级时返回 false
    pub fn bind_mixer(&self, mixer: &mut dyn Mixer) -> bool {
        if !mixer.is_plugin(MixerKind::Software) {
            return false;
        }
        match self.volume_control() {
            Some(control) => {
                mixer.set_filter(Some(control));
                true
            }
            None => false,
        }
    }

    pub fn unbind_mixer(&self, mixer: &mut dyn Mixer) {
        if mixer.is_plugin(MixerKind::Software) {
            mixer.set_filter(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SampleEncoding;
    use crate::mixer::{HardwareMixer, SoftwareMixer};

    #[test]
    fn test_chain_converts_then_scales() {
        let mut chain = FilterChain::new(Box::new(ConvertFilter::new()))
            .with_volume(VolumeFilter::new(VolumeControl::new(50)));

        let in_format = AudioFormat::new(44100, 1, SampleEncoding::Pcm16);
        let out_format = in_format.with_encoding(SampleEncoding::Pcm32);
        chain.configure(in_format, out_format).unwrap();

        let src = 1000i16.to_le_bytes();
        let out = chain.apply(&src).to_vec();
        assert_eq!(out.len(), 4);
        assert_eq!(i32::from_le_bytes([out[0], out[1], out[2], out[3]]), 500 << 16);
    }

    #[test]
    fn test_configure_failure_leaves_chain_unconfigured() {
        let mut chain = FilterChain::new(Box::new(ConvertFilter::new()));
        let in_format = AudioFormat::new(44100, 2, SampleEncoding::Pcm16);

        chain.configure(in_format, in_format).unwrap();
        assert!(chain.configure(in_format, AudioFormat { sample_rate: 48000, ..in_format }).is_err());

        // 未配置的链按直通处理
        let src = [1u8, 2, 3, 4];
        assert_eq!(chain.apply(&src).as_ptr(), src.as_ptr());
    }

    #[test]
    fn test_bind_mixer_by_kind() {
        let chain = FilterChain::new(Box::new(ConvertFilter::new()))
            .with_volume(VolumeFilter::new(VolumeControl::new(100)));

        let mut software = SoftwareMixer::new(40);
        assert!(chain.bind_mixer(&mut software));
        // 绑定时推送混音器当前音量
        assert_eq!(chain.volume_control().unwrap().get(), 40);

        let mut hardware = HardwareMixer::new(70);
        assert!(!chain.bind_mixer(&mut hardware));

        chain.unbind_mixer(&mut software);
        software.set_volume(10);
        assert_eq!(chain.volume_control().unwrap().get(), 40);
    }

    #[test]
    fn test_bind_without_volume_stage() {
        let chain = FilterChain::new(Box::new(ConvertFilter::new()));
        let mut software = SoftwareMixer::new(40);
        assert!(!chain.bind_mixer(&mut software));
    }
}
