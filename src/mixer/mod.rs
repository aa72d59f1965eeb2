//! 混音器（音量控制）
//!
//! - [`SoftwareMixer`]: 音量作用在滤波链的软件音量级上，输出打开时才绑定
//! - [`HardwareMixer`]: 音量交给设备，不使用滤波链

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigurationError;
use crate::filter::VolumeControl;

/// 混音器类型
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MixerKind {
    Software,
    Hardware,
}

impl MixerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Software => "software",
            Self::Hardware => "hardware",
        }
    }
}

impl fmt::Display for MixerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MixerKind {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "software" => Ok(Self::Software),
            "hardware" => Ok(Self::Hardware),
            _ => Err(ConfigurationError::InvalidFormat(format!("unknown mixer type '{}'", s))),
        }
    }
}

/// 混音器
pub trait Mixer: Send {
    fn kind(&self) -> MixerKind;

    fn is_plugin(&self, kind: MixerKind) -> bool {
        self.kind() == kind
    }

    /// 绑定或解绑软件音量级
    fn set_filter(&mut self, filter: Option<VolumeControl>);

    /// 当前音量 0..=100
    fn volume(&self) -> u8;

    fn set_volume(&mut self, volume: u8);
}

/// 软件混音器
pub struct SoftwareMixer {
    volume: u8,
    filter: Option<VolumeControl>,
}

impl SoftwareMixer {
    pub fn new(volume: u8) -> Self {
        Self {
            volume: volume.min(crate::filter::volume::MAX_VOLUME),
            filter: None,
        }
    }
}

impl Mixer for SoftwareMixer {
    fn kind(&self) -> MixerKind {
        MixerKind::Software
    }

    fn set_filter(&mut self, filter: Option<VolumeControl>) {
        // 新绑定的音量级立即采用当前音量
        if let Some(control) = &filter {
            control.set(self.volume);
        }
        self.filter = filter;
    }

    fn volume(&self) -> u8 {
        self.volume
    }

    fn set_volume(&mut self, volume: u8) {
        self.volume = volume.min(crate::filter::volume::MAX_VOLUME);
        if let Some(control) = &self.filter {
            control.set(self.volume);
        }
    }
}

/// 硬件混音器
///
/// 只记录音量，由设备自己处理
pub struct HardwareMixer {
    volume: u8,
}

impl HardwareMixer {
    pub fn new(volume: u8) -> Self {
        Self {
            volume: volume.min(crate::filter::volume::MAX_VOLUME),
        }
    }
}

impl Mixer for HardwareMixer {
    fn kind(&self) -> MixerKind {
        MixerKind::Hardware
    }

    fn set_filter(&mut self, filter: Option<VolumeControl>) {
        if filter.is_some() {
            log::debug!("hardware mixer ignores software volume stage");
        }
    }

    fn volume(&self) -> u8 {
        self.volume
    }

    fn set_volume(&mut self, volume: u8) {
        self.volume = volume.min(crate::filter::volume::MAX_VOLUME);
    }
}

/// 按类型创建混音器
pub fn create_mixer(kind: MixerKind, volume: u8) -> Box<dyn Mixer> {
    match kind {
        MixerKind::Software => Box::new(SoftwareMixer::new(volume)),
        MixerKind::Hardware => Box::new(HardwareMixer::new(volume)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_software_mixer_forwards_volume() {
        let control = VolumeControl::new(100);
        let mut mixer = SoftwareMixer::new(60);

        mixer.set_volume(80);
        assert_eq!(control.get(), 100);

        mixer.set_filter(Some(control.clone()));
        assert_eq!(control.get(), 80);

        mixer.set_volume(20);
        assert_eq!(control.get(), 20);

        mixer.set_filter(None);
        mixer.set_volume(90);
        assert_eq!(control.get(), 20);
        assert_eq!(mixer.volume(), 90);
    }

    #[test]
    fn test_kind() {
        let software = create_mixer(MixerKind::Software, 50);
        let hardware = create_mixer(MixerKind::Hardware, 150);

        assert!(software.is_plugin(MixerKind::Software));
        assert!(!hardware.is_plugin(MixerKind::Software));
        assert_eq!(hardware.volume(), 100);

        assert_eq!("Hardware".parse::<MixerKind>().unwrap(), MixerKind::Hardware);
        assert!("alsa".parse::<MixerKind>().is_err());
    }
}
