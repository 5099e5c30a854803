//! Roger Render - 原始音频流输出工具
//!
//! 把预先格式化好的原始字节流（交织 PCM 或 16-bit IEC 61937 打包的码流）
//! 推给渲染器，由硬件回调实时拉取。

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};

use roger_renderer::audio::{Codec, StreamRequest};
use roger_renderer::backend::{self, HardwareBackend, NullBackend, NullDeviceConfig};
use roger_renderer::{Renderer, RendererConfig};

/// 缓存满时的等待间隔
const BACKPRESSURE_SLEEP: Duration = Duration::from_millis(5);

#[derive(Parser)]
#[command(name = "roger-render")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Select output device by name or ID (use 'info' command to list devices)
    #[arg(short, long, global = true)]
    device: Option<String>,

    /// Use the null output instead of real hardware
    #[arg(long, global = true)]
    null: bool,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show output device information
    Info,

    /// Play a raw interleaved stream and exit
    Play {
        /// Raw stream file (no header)
        file: PathBuf,

        /// Send the stream as a compressed bitstream
        #[arg(long, value_enum)]
        passthrough: Option<PassthroughCodec>,

        /// Sample rate in Hz
        #[arg(short, long, default_value = "48000")]
        rate: u32,

        /// Channel count
        #[arg(short, long, default_value = "2")]
        channels: u16,

        /// Bits per sample (PCM only)
        #[arg(short, long, default_value = "16")]
        bits: u16,

        /// Volume in millibels (-6000 to 0)
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        volume: i32,

        /// Disable exclusive (hog) mode
        #[arg(long)]
        no_exclusive: bool,

        /// Fail instead of spoofing passthrough over PCM
        #[arg(long)]
        no_spoof: bool,

        /// Lock the slice pool in memory
        #[arg(long)]
        lock_memory: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum PassthroughCodec {
    Ac3,
    Dts,
}

impl From<PassthroughCodec> for Codec {
    fn from(codec: PassthroughCodec) -> Self {
        match codec {
            PassthroughCodec::Ac3 => Codec::Ac3,
            PassthroughCodec::Dts => Codec::Dts,
        }
    }
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
        Commands::Info => show_device_info(&cli),
        Commands::Play {
            ref file,
            passthrough,
            rate,
            channels,
            bits,
            volume,
            no_exclusive,
            no_spoof,
            lock_memory,
        } => {
            let request = match passthrough {
                Some(codec) => StreamRequest::Passthrough {
                    codec: codec.into(),
                    channels,
                    sample_rate: rate,
                },
                None => StreamRequest::Pcm {
                    channels,
                    sample_rate: rate,
                    bits_per_sample: bits,
                },
            };
            let config = RendererConfig {
                device: cli.device.clone(),
                exclusive_mode: !no_exclusive,
                allow_spoofing: !no_spoof,
                lock_memory,
                ..RendererConfig::default()
            };
            play(file, request, config, volume, &cli)
        }
    }
}

fn create_backend(cli: &Cli) -> Box<dyn HardwareBackend> {
    if cli.null {
        Box::new(NullBackend::new(NullDeviceConfig {
            realtime_clock: true,
            ..NullDeviceConfig::default()
        }))
    } else {
        backend::default_backend()
    }
}

/// 显示设备信息
fn show_device_info(cli: &Cli) -> anyhow::Result<()> {
    let mut backend = create_backend(cli);
    let info = backend
        .open(cli.device.as_deref())
        .context("failed to open output device")?;

    println!("=== Output Device ({:?}) ===\n", backend.kind());
    println!("[{:>3}] {}", info.id, info.name);
    println!("Frames per callback: {}", info.preferred_frames);
    println!(
        "Exclusive: {}",
        if info.auto_exclusive { "automatic" } else { "hog mode" }
    );
    println!();

    if info.physical_formats.is_empty() {
        println!("No physical formats reported");
    } else {
        println!("Physical formats:");
        for format in &info.physical_formats {
            println!("  {}", format);
        }
    }

    backend.close();
    Ok(())
}

/// 播放原始流
fn play(
    path: &PathBuf,
    request: StreamRequest,
    config: RendererConfig,
    volume: i32,
    cli: &Cli,
) -> anyhow::Result<()> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut reader = BufReader::new(file);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let mut renderer = Renderer::new(create_backend(cli), config);
    renderer.initialize(request)?;
    renderer.set_current_volume(volume)?;

    println!(
        "Playing: {} ({:?} via {:?}, chunk {} bytes)",
        path.display(),
        renderer.passthrough_mode(),
        renderer.backend_kind(),
        renderer.chunk_len()
    );
    println!("Press Ctrl+C to stop\n");

    let chunk_len = renderer.chunk_len();
    let mut chunk = vec![0u8; chunk_len];
    let mut finished = false;

    while running.load(Ordering::SeqCst) {
        let filled = read_full(&mut reader, &mut chunk)?;
        if filled == 0 {
            finished = true;
            break;
        }
        // 最后一段不足一个 chunk 时补静音
        chunk[filled..].fill(0);

        while running.load(Ordering::SeqCst) && renderer.add_packets(&chunk) == 0 {
            thread::sleep(BACKPRESSURE_SLEEP);
        }
    }

    if finished {
        renderer.wait_completion()?;
    } else {
        println!("\nInterrupted");
        renderer.stop()?;
    }

    if cli.verbose {
        if let Some(report) = renderer.stats() {
            println!("\n{}", report);
        }
    }
    renderer.deinitialize();

    Ok(())
}

/// 尽量读满缓冲区，返回读到的字节数（0 表示文件结束）
fn read_full(reader: &mut impl Read, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
