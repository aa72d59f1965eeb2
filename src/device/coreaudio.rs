//! Core Audio 传输
//!
//! 使用 DefaultOutput AudioUnit（经过系统混音器）：
//! - 交织 PCM：16/24/32-bit 整数或 32-bit float
//! - 8-bit 提升为 16-bit，DSD 直接拒绝
//! - 运行期间持有电源断言，防止系统空闲睡眠

use std::ffi::c_void;
use std::ptr;
use std::time::Duration;

use super::transport::{RenderFn, Transport};
use crate::audio::format::MAX_CHANNELS;
use crate::audio::{AudioFormat, SampleEncoding};
use crate::error::DeviceError;

type OSStatus = i32;
type AudioUnit = *mut c_void;
type AudioComponent = *mut c_void;

const NO_ERR: OSStatus = 0;

const K_AUDIO_FORMAT_LINEAR_PCM: u32 = 0x6C70636D; // 'lpcm'
const K_AUDIO_FORMAT_FLAG_IS_FLOAT: u32 = 1 << 0;
const K_AUDIO_FORMAT_FLAG_IS_SIGNED_INTEGER: u32 = 1 << 2;
const K_AUDIO_FORMAT_FLAG_IS_PACKED: u32 = 1 << 3;

const K_AUDIO_UNIT_SCOPE_GLOBAL: u32 = 0;
const K_AUDIO_UNIT_SCOPE_INPUT: u32 = 1;

const K_AUDIO_UNIT_PROPERTY_STREAM_FORMAT: u32 = 8;
const K_AUDIO_UNIT_PROPERTY_LATENCY: u32 = 12;
const K_AUDIO_UNIT_PROPERTY_SET_RENDER_CALLBACK: u32 = 23;

const K_AUDIO_UNIT_TYPE_OUTPUT: u32 = 0x61756F75; // 'auou'
const K_AUDIO_UNIT_SUB_TYPE_DEFAULT_OUTPUT: u32 = 0x64656620; // 'def '
const K_AUDIO_UNIT_MANUFACTURER_APPLE: u32 = 0x6170706C; // 'appl'

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct AudioStreamBasicDescription {
    sample_rate: f64,
    format_id: u32,
    format_flags: u32,
    bytes_per_packet: u32,
    frames_per_packet: u32,
    bytes_per_frame: u32,
    channels_per_frame: u32,
    bits_per_channel: u32,
    reserved: u32,
}

#[repr(C)]
struct AudioComponentDescription {
    component_type: u32,
    component_sub_type: u32,
    component_manufacturer: u32,
    component_flags: u32,
    component_flags_mask: u32,
}

type RenderCallback = extern "C" fn(
    in_ref_con: *mut c_void,
    io_action_flags: *mut u32,
    in_time_stamp: *const c_void,
    in_bus_number: u32,
    in_number_frames: u32,
    io_data: *mut AudioBufferList,
) -> OSStatus;

#[repr(C)]
struct AURenderCallbackStruct {
    input_proc: RenderCallback,
    input_proc_ref_con: *mut c_void,
}

#[repr(C)]
struct AudioBufferList {
    number_buffers: u32,
    buffers: [AudioBuffer; 1],
}

#[repr(C)]
struct AudioBuffer {
    number_channels: u32,
    data_byte_size: u32,
    data: *mut c_void,
}

#[link(name = "AudioToolbox", kind = "framework")]
extern "C" {
    fn AudioComponentFindNext(
        component: AudioComponent,
        desc: *const AudioComponentDescription,
    ) -> AudioComponent;

    fn AudioComponentInstanceNew(component: AudioComponent, out_instance: *mut AudioUnit) -> OSStatus;
    fn AudioComponentInstanceDispose(instance: AudioUnit) -> OSStatus;

    fn AudioUnitInitialize(unit: AudioUnit) -> OSStatus;
    fn AudioUnitUninitialize(unit: AudioUnit) -> OSStatus;
    fn AudioOutputUnitStart(unit: AudioUnit) -> OSStatus;
    fn AudioOutputUnitStop(unit: AudioUnit) -> OSStatus;

    fn AudioUnitSetProperty(
        unit: AudioUnit,
        property_id: u32,
        scope: u32,
        element: u32,
        data: *const c_void,
        data_size: u32,
    ) -> OSStatus;

    fn AudioUnitGetProperty(
        unit: AudioUnit,
        property_id: u32,
        scope: u32,
        element: u32,
        data: *mut c_void,
        data_size: *mut u32,
    ) -> OSStatus;
}

/// IOKit 电源断言
mod power {
    use core_foundation::base::TCFType;
    use core_foundation::string::CFString;
    use std::ffi::c_void;

    type IOPMAssertionID = u32;

    const K_IOPM_ASSERTION_LEVEL_ON: u32 = 255;

    #[link(name = "IOKit", kind = "framework")]
    extern "C" {
        fn IOPMAssertionCreateWithName(
            assertion_type: *const c_void,
            assertion_level: u32,
            assertion_name: *const c_void,
            assertion_id: *mut IOPMAssertionID,
        ) -> i32;

        fn IOPMAssertionRelease(assertion_id: IOPMAssertionID) -> i32;
    }

    /// 持有期间阻止系统空闲睡眠，Drop 时释放
    pub struct PowerAssertion {
        id: IOPMAssertionID,
    }

    impl PowerAssertion {
        pub fn acquire(name: &str) -> Option<Self> {
            let assertion_type = CFString::new("PreventUserIdleSystemSleep");
            let assertion_name = CFString::new(name);
            let mut id: IOPMAssertionID = 0;

            let result = unsafe {
                IOPMAssertionCreateWithName(
                    assertion_type.as_concrete_TypeRef() as *const c_void,
                    K_IOPM_ASSERTION_LEVEL_ON,
                    assertion_name.as_concrete_TypeRef() as *const c_void,
                    &mut id,
                )
            };

            if result == 0 {
                log::debug!("Power assertion acquired: {} (ID: {})", name, id);
                Some(Self { id })
            } else {
                log::warn!("Failed to create power assertion (error: {})", result);
                None
            }
        }
    }

    impl Drop for PowerAssertion {
        fn drop(&mut self) {
            let result = unsafe { IOPMAssertionRelease(self.id) };
            if result != 0 {
                log::warn!("Failed to release power assertion {} (error: {})", self.id, result);
            }
        }
    }
}

/// render 回调上下文，地址在 AudioUnit 存活期间固定
struct RenderContext {
    render: RenderFn,
}

/// Core Audio DefaultOutput 传输
pub struct CoreAudioTransport {
    name: String,
    audio_unit: AudioUnit,
    context: Option<Box<RenderContext>>,
    running: bool,
    power_assertion: Option<power::PowerAssertion>,
}

// AudioUnit 句柄只在持有 &mut self 的线程上操作
unsafe impl Send for CoreAudioTransport {}

impl CoreAudioTransport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            audio_unit: ptr::null_mut(),
            context: None,
            running: false,
            power_assertion: None,
        }
    }

    fn stream_description(format: AudioFormat) -> AudioStreamBasicDescription {
        let bytes_per_sample = format.encoding.bytes_per_sample() as u32;
        let bytes_per_frame = format.frame_size() as u32;
        let format_flags = match format.encoding {
            SampleEncoding::Float => K_AUDIO_FORMAT_FLAG_IS_FLOAT | K_AUDIO_FORMAT_FLAG_IS_PACKED,
            _ => K_AUDIO_FORMAT_FLAG_IS_SIGNED_INTEGER | K_AUDIO_FORMAT_FLAG_IS_PACKED,
        };

        AudioStreamBasicDescription {
            sample_rate: format.sample_rate as f64,
            format_id: K_AUDIO_FORMAT_LINEAR_PCM,
            format_flags,
            bytes_per_packet: bytes_per_frame,
            frames_per_packet: 1,
            bytes_per_frame,
            channels_per_frame: format.channels as u32,
            bits_per_channel: bytes_per_sample * 8,
            reserved: 0,
        }
    }

    /// 创建并初始化 AudioUnit；失败时已释放实例
    unsafe fn create_unit(
        asbd: &AudioStreamBasicDescription,
        context: *mut RenderContext,
    ) -> Result<AudioUnit, DeviceError> {
        let desc = AudioComponentDescription {
            component_type: K_AUDIO_UNIT_TYPE_OUTPUT,
            component_sub_type: K_AUDIO_UNIT_SUB_TYPE_DEFAULT_OUTPUT,
            component_manufacturer: K_AUDIO_UNIT_MANUFACTURER_APPLE,
            component_flags: 0,
            component_flags_mask: 0,
        };

        let component = AudioComponentFindNext(ptr::null_mut(), &desc);
        if component.is_null() {
            return Err(DeviceError::Other("no default output component".to_string()));
        }

        let mut unit: AudioUnit = ptr::null_mut();
        let status = AudioComponentInstanceNew(component, &mut unit);
        if status != NO_ERR {
            return Err(DeviceError::transport("AudioComponentInstanceNew", status));
        }

        let status = AudioUnitSetProperty(
            unit,
            K_AUDIO_UNIT_PROPERTY_STREAM_FORMAT,
            K_AUDIO_UNIT_SCOPE_INPUT,
            0,
            asbd as *const _ as *const c_void,
            std::mem::size_of::<AudioStreamBasicDescription>() as u32,
        );
        if status != NO_ERR {
            AudioComponentInstanceDispose(unit);
            return Err(DeviceError::transport("set stream format", status));
        }

        let callback = AURenderCallbackStruct {
            input_proc: render_callback,
            input_proc_ref_con: context as *mut c_void,
        };
        let status = AudioUnitSetProperty(
            unit,
            K_AUDIO_UNIT_PROPERTY_SET_RENDER_CALLBACK,
            K_AUDIO_UNIT_SCOPE_INPUT,
            0,
            &callback as *const _ as *const c_void,
            std::mem::size_of::<AURenderCallbackStruct>() as u32,
        );
        if status != NO_ERR {
            AudioComponentInstanceDispose(unit);
            return Err(DeviceError::transport("set render callback", status));
        }

        let status = AudioUnitInitialize(unit);
        if status != NO_ERR {
            AudioComponentInstanceDispose(unit);
            return Err(DeviceError::transport("AudioUnitInitialize", status));
        }

        Ok(unit)
    }
}

impl Transport for CoreAudioTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn negotiate(&self, format: AudioFormat) -> Result<AudioFormat, DeviceError> {
        if format.channels == 0 || format.channels > MAX_CHANNELS {
            return Err(DeviceError::UnsupportedChannels(format.channels));
        }
        if format.sample_rate == 0 {
            return Err(DeviceError::UnsupportedSampleRate(format.sample_rate));
        }

        match format.encoding {
            SampleEncoding::Dsd => Err(DeviceError::UnsupportedEncoding(SampleEncoding::Dsd)),
            SampleEncoding::Pcm8 => Ok(format.with_encoding(SampleEncoding::Pcm16)),
            _ => Ok(format),
        }
    }

    fn open(&mut self, format: AudioFormat, render: RenderFn) -> Result<(), DeviceError> {
        if !self.audio_unit.is_null() {
            return Err(DeviceError::Other(format!("{} is already open", self.name)));
        }

        let asbd = Self::stream_description(format);
        let mut context = Box::new(RenderContext { render });
        let context_ptr: *mut RenderContext = &mut *context;

        self.audio_unit = unsafe { Self::create_unit(&asbd, context_ptr)? };
        self.context = Some(context);

        log::debug!("{}: AudioUnit initialized for {}", self.name, format);
        Ok(())
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        if self.audio_unit.is_null() {
            return Err(DeviceError::NotOpen);
        }

        let status = unsafe { AudioOutputUnitStart(self.audio_unit) };
        if status != NO_ERR {
            return Err(DeviceError::transport("AudioOutputUnitStart", status));
        }

        self.running = true;
        self.power_assertion = power::PowerAssertion::acquire("Filtered Output Playback");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        if self.audio_unit.is_null() {
            return Err(DeviceError::NotOpen);
        }

        let status = unsafe { AudioOutputUnitStop(self.audio_unit) };
        if status != NO_ERR {
            return Err(DeviceError::transport("AudioOutputUnitStop", status));
        }

        self.running = false;
        self.power_assertion = None;
        Ok(())
    }

    fn close(&mut self) {
        if self.audio_unit.is_null() {
            return;
        }

        if self.running {
            if let Err(e) = self.stop() {
                log::warn!("{}: {}", self.name, e);
            }
        }

        unsafe {
            AudioUnitUninitialize(self.audio_unit);
            AudioComponentInstanceDispose(self.audio_unit);
        }
        self.audio_unit = ptr::null_mut();
        self.running = false;
        self.power_assertion = None;

        // AudioUnit 已释放，回调不会再被调用
        self.context = None;
    }

    fn latency(&self) -> Duration {
        if self.audio_unit.is_null() {
            return Duration::ZERO;
        }

        let mut seconds: f64 = 0.0;
        let mut size = std::mem::size_of::<f64>() as u32;
        let status = unsafe {
            AudioUnitGetProperty(
                self.audio_unit,
                K_AUDIO_UNIT_PROPERTY_LATENCY,
                K_AUDIO_UNIT_SCOPE_GLOBAL,
                0,
                &mut seconds as *mut _ as *mut c_void,
                &mut size,
            )
        };

        if status == NO_ERR && seconds.is_finite() && seconds > 0.0 {
            Duration::from_secs_f64(seconds)
        } else {
            Duration::ZERO
        }
    }
}

impl Drop for CoreAudioTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// AudioUnit render 回调
///
/// **绝对禁止：**
/// - 分配
/// - I/O
/// - 日志
extern "C" fn render_callback(
    in_ref_con: *mut c_void,
    _io_action_flags: *mut u32,
    _in_time_stamp: *const c_void,
    _in_bus_number: u32,
    _in_number_frames: u32,
    io_data: *mut AudioBufferList,
) -> OSStatus {
    if in_ref_con.is_null() || io_data.is_null() {
        return NO_ERR;
    }

    let ctx = unsafe { &mut *(in_ref_con as *mut RenderContext) };
    let list = unsafe { &mut *io_data };
    let buffers = unsafe {
        std::slice::from_raw_parts_mut(list.buffers.as_mut_ptr(), list.number_buffers as usize)
    };

    for buffer in buffers {
        if buffer.data.is_null() {
            continue;
        }
        let out = unsafe {
            std::slice::from_raw_parts_mut(buffer.data as *mut u8, buffer.data_byte_size as usize)
        };
        (ctx.render)(out);
    }

    NO_ERR
}
