// SPDX-License-Identifier: GPL-3.0-only

use camera_service::backends::camera::PreviewMemory;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "camera-service")]
#[command(about = "Camera capture service publishing frames over shared memory")]
#[command(version = camera_service::constants::app_info::version())]
struct Cli {
    /// Config file (default: ~/.config/camera-service/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Preview buffer memory
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum MemoryArg {
    /// Device buffers mapped into the service
    Mmap,
    /// Service-allocated buffers
    Userptr,
    /// Device buffers exported as DMABUF
    Dmabuf,
    /// Device writes straight into the ring slots
    Shared,
}

impl From<MemoryArg> for PreviewMemory {
    fn from(arg: MemoryArg) -> Self {
        match arg {
            MemoryArg::Mmap => PreviewMemory::Mapped,
            MemoryArg::Userptr => PreviewMemory::UserPointer,
            MemoryArg::Dmabuf => PreviewMemory::ExportedHandle,
            MemoryArg::Shared => PreviewMemory::SharedSlots,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Open a device and publish preview frames until Ctrl+C
    Serve {
        /// Backend ("v4l2" or "virtual")
        #[arg(short, long)]
        backend: Option<String>,

        /// Device path (e.g. /dev/video0, virtual0)
        #[arg(short, long)]
        device: Option<String>,

        /// Buffer memory for the preview
        #[arg(short, long, value_enum)]
        memory: Option<MemoryArg>,

        /// Process to signal after every frame
        #[arg(long, requires = "notify_signal")]
        notify_pid: Option<i32>,

        /// Signal number sent to --notify-pid
        #[arg(long, requires = "notify_pid")]
        notify_signal: Option<i32>,

        /// Also record raw frames (default: ~/Videos/Camera/capture_TIMESTAMP.raw)
        #[arg(short, long)]
        record: bool,

        /// Raw capture output file
        #[arg(short, long, requires = "record")]
        output: Option<PathBuf>,

        /// Stop recording after this many frames
        #[arg(long, requires = "record")]
        max_frames: Option<u64>,

        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Attach to a ring channel and print frame summaries
    Read {
        /// Channel key printed by `serve` (decimal or 0x-prefixed hex)
        #[arg(short, long, value_parser = cli::parse_key)]
        key: i32,

        /// Wait for this signal instead of polling
        #[arg(short, long)]
        signal: Option<i32>,

        /// Polling period without --signal
        #[arg(long, default_value = "33")]
        interval_ms: u64,

        /// Stop after this many frames
        #[arg(short = 'n', long)]
        frames: Option<u64>,
    },

    /// Show device information
    Info {
        /// Device path (default from config)
        path: Option<String>,

        /// Backend ("v4l2" or "virtual")
        #[arg(short, long)]
        backend: Option<String>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    // Set RUST_LOG environment variable to control log level
    // Examples: RUST_LOG=debug, RUST_LOG=camera_service=debug, RUST_LOG=info
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();
    let config = cli::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve {
            backend,
            device,
            memory,
            notify_pid,
            notify_signal,
            record,
            output,
            max_frames,
            duration,
        } => cli::serve(
            config,
            cli::ServeArgs {
                backend,
                device,
                memory: memory.map(PreviewMemory::from),
                notify: notify_pid.zip(notify_signal),
                record,
                output,
                max_frames,
                duration,
            },
        ),
        Commands::Read {
            key,
            signal,
            interval_ms,
            frames,
        } => cli::read(&config, key, signal, interval_ms, frames),
        Commands::Info { path, backend } => cli::device_info(config, path, backend),
    }
}
