//! 端到端：FilteredOutput + DeviceSink + ClockTransport

use std::sync::{Arc, Mutex};
use std::time::Duration;

use filtered_output::audio::{AudioFormat, AudioFormatMask, SampleEncoding};
use filtered_output::device::ClockTransport;
use filtered_output::error::DeviceError;
use filtered_output::mixer::MixerKind;
use filtered_output::output::{FilteredOutput, OutputConfig, OutputState};

/// 时钟传输，把每个周期输出的字节收集起来
fn tapped_clock(name: &str) -> (ClockTransport, Arc<Mutex<Vec<u8>>>) {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&captured);
    let transport = ClockTransport::new(name)
        .with_period(Duration::from_millis(2))
        .with_tap(move |bytes| sink.lock().unwrap().extend_from_slice(bytes));
    (transport, captured)
}

fn config(name: &str) -> OutputConfig {
    OutputConfig {
        name: name.to_string(),
        buffer_time: Duration::from_millis(500),
        ..OutputConfig::default()
    }
}

fn pcm16(values: &[i16]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn floats(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[test]
fn test_passthrough_drains_on_close() {
    let (transport, captured) = tapped_clock("pass");
    let mut output = FilteredOutput::from_config(&config("pass"), Box::new(transport));

    let format = AudioFormat::new(8000, 2, SampleEncoding::Pcm16);
    output.open(format).unwrap();
    assert_eq!(output.out_format(), Some(format));

    let data = pcm16(&(1..=200).collect::<Vec<i16>>());
    assert_eq!(output.play(&data).unwrap(), data.len());
    output.close(true);

    let captured = captured.lock().unwrap();
    assert!(captured.len() >= data.len());
    assert_eq!(&captured[..data.len()], &data[..]);
    assert!(captured[data.len()..].iter().all(|&b| b == 0));
    assert_eq!(output.state(), OutputState::Closed);
}

#[test]
fn test_output_mask_converts_to_float() {
    let (transport, captured) = tapped_clock("float");
    let mut cfg = config("float");
    cfg.format_mask = "*:f:*".parse::<AudioFormatMask>().unwrap();
    let mut output = FilteredOutput::from_config(&cfg, Box::new(transport));

    output
        .open(AudioFormat::new(8000, 1, SampleEncoding::Pcm16))
        .unwrap();
    assert_eq!(
        output.out_format(),
        Some(AudioFormat::new(8000, 1, SampleEncoding::Float))
    );

    output.play(&pcm16(&[0, 16384, -16384, i16::MIN])).unwrap();
    output.close(true);

    let values = floats(&captured.lock().unwrap());
    assert!(values.len() >= 4);
    assert_eq!(&values[..4], &[0.0, 0.5, -0.5, -1.0]);
}

#[test]
fn test_software_volume() {
    let (transport, captured) = tapped_clock("volume");
    let mut cfg = config("volume");
    cfg.mixer = Some(MixerKind::Software);
    cfg.volume = 50;
    let mut output = FilteredOutput::from_config(&cfg, Box::new(transport));

    output
        .open(AudioFormat::new(8000, 1, SampleEncoding::Pcm16))
        .unwrap();
    output.play(&pcm16(&[1000, -1000])).unwrap();

    output.mixer_mut().unwrap().set_volume(0);
    output.play(&pcm16(&[1000, -1000])).unwrap();
    output.close(true);

    let captured = captured.lock().unwrap();
    assert_eq!(&captured[..4], &pcm16(&[500, -500])[..]);
    assert!(captured[4..].iter().all(|&b| b == 0));
}

#[test]
fn test_dsd_falls_back_to_float() {
    // 设备只接受 DSD128，源是 DSD64：转换失败后改用 float
    let (transport, captured) = tapped_clock("dsd");
    let transport = transport.with_negotiator(|format| {
        if format.encoding == SampleEncoding::Dsd {
            Ok(AudioFormat {
                sample_rate: 705600,
                ..format
            })
        } else {
            Ok(format)
        }
    });
    let mut output = FilteredOutput::from_config(&config("dsd"), Box::new(transport));

    output
        .open(AudioFormat::new(352800, 2, SampleEncoding::Dsd))
        .unwrap();
    assert_eq!(
        output.out_format(),
        Some(AudioFormat::new(352800, 2, SampleEncoding::Float))
    );

    output.play(&[0xFF, 0x00, 0x69, 0x69]).unwrap();
    output.close(true);

    let values = floats(&captured.lock().unwrap());
    assert!((values[0] - 1.0).abs() < 1e-6);
    assert_eq!(&values[1..4], &[-1.0, 0.0, 0.0]);
}

#[test]
fn test_device_rejection_is_reported() {
    let (transport, _) = tapped_clock("reject");
    let transport = transport.with_negotiator(|format| {
        Err(DeviceError::UnsupportedSampleRate(format.sample_rate))
    });
    let mut output = FilteredOutput::from_config(&config("reject"), Box::new(transport));

    let err = output
        .open(AudioFormat::new(44100, 2, SampleEncoding::Pcm16))
        .unwrap_err();
    assert!(matches!(
        err.device_error(),
        Some(DeviceError::UnsupportedSampleRate(44100))
    ));
    assert!(!output.is_open());
}

#[test]
fn test_pause_discards_and_resumes() {
    let (transport, captured) = tapped_clock("pause");
    let mut output = FilteredOutput::from_config(&config("pause"), Box::new(transport));

    output
        .open(AudioFormat::new(8000, 1, SampleEncoding::Pcm16))
        .unwrap();

    output.begin_pause();
    assert_eq!(output.state(), OutputState::Paused);
    assert!(output.iterate_pause());

    output.play(&pcm16(&[7, 8, 9])).unwrap();
    assert_eq!(output.state(), OutputState::Open);
    output.close(true);

    let captured = captured.lock().unwrap();
    assert_eq!(&captured[..6], &pcm16(&[7, 8, 9])[..]);
}
