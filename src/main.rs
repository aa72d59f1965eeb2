//! Filtered Output - 命令行播放器
//!
//! 播放裸 PCM / DSD 数据流（无文件头），用于检验输出级：
//! 格式掩码、设备协商、DSD 回退、软件音量和暂停状态机。

use std::f32::consts::PI;
use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};

use filtered_output::audio::format::encode_samples;
use filtered_output::audio::{AudioFormat, AudioFormatMask, SampleEncoding};
use filtered_output::device::clock::DEFAULT_PERIOD;
use filtered_output::device::{ClockTransport, Transport, DEFAULT_BUFFER_TIME};
use filtered_output::engine::{Engine, EngineConfig, EngineError};
use filtered_output::error::DeviceError;
use filtered_output::mixer::MixerKind;
use filtered_output::output::{FilteredOutput, OutputConfig};

/// 终端原始模式 RAII 守卫
#[cfg(unix)]
struct RawModeGuard {
    original: libc::termios,
}

#[cfg(unix)]
impl RawModeGuard {
    /// 进入原始模式（非终端时返回 None），离开作用域自动恢复
    fn enter() -> Option<Self> {
        unsafe {
            if libc::isatty(libc::STDIN_FILENO) != 1 {
                return None;
            }

            let mut original: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(libc::STDIN_FILENO, &mut original) != 0 {
                return None;
            }

            let mut raw = original;
            raw.c_lflag &= !(libc::ICANON | libc::ECHO);
            // 非阻塞读取
            raw.c_cc[libc::VMIN] = 0;
            raw.c_cc[libc::VTIME] = 0;

            if libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &raw) != 0 {
                return None;
            }

            Some(Self { original })
        }
    }
}

#[cfg(unix)]
impl Drop for RawModeGuard {
    fn drop(&mut self) {
        unsafe {
            libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &self.original);
        }
    }
}

#[cfg(not(unix))]
struct RawModeGuard;

#[cfg(not(unix))]
impl RawModeGuard {
    fn enter() -> Option<Self> {
        None
    }
}

fn read_char_nonblocking() -> Option<u8> {
    let mut buf = [0u8; 1];
    match io::stdin().lock().read(&mut buf) {
        Ok(1) => Some(buf[0]),
        _ => None,
    }
}

/// Filtered Output - audio output stage player
#[derive(Parser)]
#[command(name = "filtered-output")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Play raw interleaved PCM or DSD data ("-" reads stdin)
    Play {
        #[arg(value_name = "FILE")]
        file: PathBuf,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Play a generated sine tone
    Tone {
        /// Tone frequency in Hz
        #[arg(long, default_value_t = 440.0)]
        frequency: f32,

        /// Tone length in seconds
        #[arg(long, default_value_t = 3.0)]
        seconds: f32,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Show transports and supported formats
    Info,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum TransportKind {
    /// Software clock, discards audio (any platform)
    Clock,
    /// Core Audio default output (macOS)
    #[value(name = "coreaudio")]
    CoreAudio,
}

impl Default for TransportKind {
    fn default() -> Self {
        if cfg!(target_os = "macos") {
            Self::CoreAudio
        } else {
            Self::Clock
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum MixerArg {
    None,
    Software,
    Hardware,
}

impl MixerArg {
    fn kind(self) -> Option<MixerKind> {
        match self {
            Self::None => None,
            Self::Software => Some(MixerKind::Software),
            Self::Hardware => Some(MixerKind::Hardware),
        }
    }
}

#[derive(Args)]
struct OutputArgs {
    /// Source format as rate:bits:channels (bits: 8, 16, 24, 32, f, dsd)
    #[arg(short = 'f', long, default_value = "44100:16:2")]
    input_format: AudioFormat,

    /// Output format mask, '*' keeps the source value (e.g. "*:24:*")
    #[arg(short = 'o', long, default_value = "*:*:*")]
    output_format: AudioFormatMask,

    /// Hardware transport
    #[arg(short, long, value_enum, default_value_t = TransportKind::default())]
    transport: TransportKind,

    /// Clock transport only: device accepts DSD at this rate only
    #[arg(long, value_name = "HZ")]
    dsd_rate: Option<u32>,

    /// Clock transport only: device rejects DSD
    #[arg(long)]
    no_dsd: bool,

    /// Volume control
    #[arg(short, long, value_enum, default_value_t = MixerArg::None)]
    mixer: MixerArg,

    /// Initial volume (0-100)
    #[arg(long, default_value_t = 100, value_parser = clap::value_parser!(u8).range(0..=100))]
    volume: u8,

    /// Device buffer size in milliseconds
    #[arg(short, long, default_value_t = DEFAULT_BUFFER_TIME.as_millis() as u64)]
    buffer_ms: u64,

    /// Output name used in log messages
    #[arg(long, default_value = "default")]
    name: String,

    /// Keyboard control: space toggles pause, q stops
    #[arg(short, long)]
    keys: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    match cli.command {
        Commands::Play { ref file, ref output } => {
            let source: Box<dyn Read + Send> = if file.as_os_str() == "-" {
                Box::new(io::stdin())
            } else {
                let f = File::open(file).with_context(|| format!("cannot open {}", file.display()))?;
                Box::new(BufReader::new(f))
            };
            play(output, source, cli.verbose)?;
        }
        Commands::Tone {
            frequency,
            seconds,
            ref output,
        } => {
            let tone = generate_tone(output.input_format, frequency, seconds)?;
            play(output, Box::new(Cursor::new(tone)), cli.verbose)?;
        }
        Commands::Info => show_info(),
    }

    Ok(())
}

fn show_info() {
    println!("=== Transports ===\n");
    println!("  clock      software clock, {:?} periods", DEFAULT_PERIOD);
    if cfg!(target_os = "macos") {
        println!("  coreaudio  Core Audio default output (16/24/32-bit, float)");
    }

    println!("\n=== Sample encodings ===\n");
    for encoding in SampleEncoding::ALL {
        println!("  {:<4} {} byte(s) per sample", encoding.as_str(), encoding.bytes_per_sample());
    }

    println!("\nFormats are written rate:bits:channels, e.g. 44100:16:2 or 352800:dsd:2.");
    println!("Default device buffer: {} ms", DEFAULT_BUFFER_TIME.as_millis());
}

fn build_transport(args: &OutputArgs) -> anyhow::Result<Box<dyn Transport>> {
    match args.transport {
        TransportKind::Clock => {
            let dsd_rate = args.dsd_rate;
            let no_dsd = args.no_dsd;
            let transport = ClockTransport::new(args.name.clone()).with_negotiator(move |format| {
                if format.encoding.is_dsd() {
                    if no_dsd {
                        return Err(DeviceError::UnsupportedEncoding(SampleEncoding::Dsd));
                    }
                    if let Some(sample_rate) = dsd_rate {
                        return Ok(AudioFormat {
                            sample_rate,
                            ..format
                        });
                    }
                }
                Ok(format)
            });
            Ok(Box::new(transport))
        }
        TransportKind::CoreAudio => core_audio_transport(&args.name),
    }
}

#[cfg(target_os = "macos")]
fn core_audio_transport(name: &str) -> anyhow::Result<Box<dyn Transport>> {
    Ok(Box::new(filtered_output::device::CoreAudioTransport::new(name)))
}

#[cfg(not(target_os = "macos"))]
fn core_audio_transport(_name: &str) -> anyhow::Result<Box<dyn Transport>> {
    bail!("the coreaudio transport is only available on macOS, use --transport clock")
}

/// 生成正弦波（-6 dB），编码为输入格式
fn generate_tone(format: AudioFormat, frequency: f32, seconds: f32) -> anyhow::Result<Vec<u8>> {
    if format.encoding.is_dsd() {
        bail!("tone generation needs a PCM input format, got {}", format);
    }
    if !(seconds > 0.0) || !(frequency > 0.0) {
        bail!("frequency and length must be positive");
    }

    let frames = (format.sample_rate as f32 * seconds) as usize;
    let channels = format.channels as usize;
    let step = 2.0 * PI * frequency / format.sample_rate as f32;

    let mut samples = Vec::with_capacity(frames * channels);
    for frame in 0..frames {
        let value = 0.5 * (step * frame as f32).sin();
        let sample = (value as f64 * 2147483648.0) as i32;
        samples.extend(std::iter::repeat(sample).take(channels));
    }

    let mut bytes = Vec::new();
    encode_samples(format.encoding, &samples, &mut bytes);
    Ok(bytes)
}

/// 为常见的打开失败补充处理建议
fn explain_engine_error(err: EngineError) -> anyhow::Error {
    match err {
        EngineError::Output(output_err) => {
            let hint = if output_err.configuration_error().is_some() {
                Some("the conversion is not supported, try another --output-format")
            } else if output_err.device_error().is_some() {
                Some("the device refused the stream")
            } else {
                None
            };
            match hint {
                Some(hint) => anyhow::Error::new(output_err).context(hint),
                None => output_err.into(),
            }
        }
        other => other.into(),
    }
}

fn play(args: &OutputArgs, source: Box<dyn Read + Send>, verbose: bool) -> anyhow::Result<()> {
    let config = OutputConfig {
        name: args.name.clone(),
        format_mask: args.output_format,
        mixer: args.mixer.kind(),
        volume: args.volume,
        buffer_time: Duration::from_millis(args.buffer_ms.max(1)),
        lock_memory: true,
    };

    let transport = build_transport(args)?;
    let mut output = FilteredOutput::from_config(&config, transport);
    output.enable()?;
    if let Some(mixer) = output.mixer() {
        log::info!("{:?} mixer, volume {}", mixer.kind(), mixer.volume());
    }

    let engine = Engine::spawn(output, source, args.input_format, EngineConfig::default())?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })?;

    let keys = if args.keys { RawModeGuard::enter() } else { None };
    if keys.is_some() {
        println!("Playing {}. Space: pause/resume, q: stop.\n", args.input_format);
    } else {
        println!("Playing {}. Press Ctrl+C to stop.\n", args.input_format);
    }

    while !engine.is_finished() {
        if interrupted.load(Ordering::SeqCst) {
            engine.stop();
            break;
        }

        if keys.is_some() {
            match read_char_nonblocking() {
                Some(b' ') => engine.toggle_pause(),
                Some(b'q') => {
                    engine.stop();
                    break;
                }
                _ => {}
            }
        }

        let position = engine.position().as_secs_f64();
        print!(
            "\r  {:02}:{:05.2}  |  {:?}    ",
            (position / 60.0) as u32,
            position % 60.0,
            engine.state()
        );
        io::stdout().flush()?;

        std::thread::sleep(Duration::from_millis(50));
    }

    drop(keys);
    println!();

    let (mut output, summary) = engine.join().map_err(explain_engine_error)?;
    output.disable();

    if verbose {
        if let Some(stats) = summary.stats {
            println!("\n{}", stats);
        }
    }
    println!(
        "Played {:.2}s{}",
        summary.duration.as_secs_f64(),
        if summary.interrupted { " (stopped)" } else { "" }
    );

    Ok(())
}
