// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands
//!
//! This module provides command-line functionality for:
//! - Serving preview frames from a device
//! - Reading frames from a running service
//! - Showing device information

use camera_service::Config;
use camera_service::backends::camera::{FormatSpec, PreviewMemory};
use camera_service::notify::{FrameWaiter, IntervalWaiter, NotifyTarget, SignalWaiter};
use camera_service::pipelines::{CaptureSpec, FrameMeta};
use camera_service::ring::{ReaderEvent, RingReader};
use camera_service::service::CameraHandle;
use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Default folder name for raw captures
const DEFAULT_SAVE_FOLDER: &str = "Camera";

/// Options for [`serve`] that override the config
pub struct ServeArgs {
    pub backend: Option<String>,
    pub device: Option<String>,
    pub memory: Option<PreviewMemory>,
    /// (pid, signal)
    pub notify: Option<(i32, i32)>,
    pub record: bool,
    pub output: Option<PathBuf>,
    pub max_frames: Option<u64>,
    pub duration: Option<u64>,
}

/// Parse a channel key given as decimal or `0x` hex.
pub fn parse_key(value: &str) -> Result<i32, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => i32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid key {:?}: {}", value, e))
}

/// Load the given config file, or the default one.
pub fn load_config(path: Option<&Path>) -> Result<Config, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(Config::load(path)?),
        None => Ok(Config::load_or_default()),
    }
}

/// Open a device, start preview and run until Ctrl+C or the duration ends
pub fn serve(mut config: Config, args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    if let Some(device) = args.device {
        config.device_path = device;
    }
    let memory = args.memory.unwrap_or(config.io_mode);

    let mut handle = CameraHandle::with_config(&config)?;
    let notify = match args.notify {
        Some((pid, signal)) => NotifyTarget::Signal { pid, signal },
        None => NotifyTarget::None,
    };
    handle.open(&config.device_path, 0, notify)?;

    let format = handle.get_format()?;
    println!("Using device: {} ({})", config.device_path, handle.backend_name());
    println!("Format: {}", format);

    let key = handle.start_preview(memory)?;
    println!("Channel key: {:#x} ({})", key, key);
    println!(
        "Slot size: {} bytes, meta size: {} bytes",
        format.size_image, config.ring_meta_size
    );

    if args.record {
        let output_path = match args.output {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                path
            }
            None => {
                let dir = get_default_capture_dir();
                std::fs::create_dir_all(&dir)?;
                let timestamp = Local::now().format("%Y%m%d_%H%M%S");
                dir.join(format!("capture_{}.raw", timestamp))
            }
        };
        handle.start_capture(
            CaptureSpec {
                max_frames: args.max_frames,
            },
            &output_path,
        )?;
        println!("Recording raw frames to {}", output_path.display());
    }

    // Set up Ctrl+C handler
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_flag_clone = stop_flag.clone();
    ctrlc::set_handler(move || {
        stop_flag_clone.store(true, Ordering::SeqCst);
    })?;

    println!();
    println!("Serving... (press Ctrl+C to stop)");
    let start = Instant::now();
    let limit = args.duration.map(Duration::from_secs);

    while !stop_flag.load(Ordering::SeqCst) {
        if limit.is_some_and(|limit| start.elapsed() >= limit) {
            break;
        }
        if !handle.is_streaming() {
            println!();
            eprintln!("Capture stopped unexpectedly");
            break;
        }

        let stats = handle.stats();
        let elapsed = start.elapsed().as_secs();
        print!(
            "\r{:02}:{:02}  published {}  errors {}",
            elapsed / 60,
            elapsed % 60,
            stats.frames_published,
            stats.recoverable_errors
        );
        std::io::Write::flush(&mut std::io::stdout())?;

        std::thread::sleep(Duration::from_millis(200));
    }
    println!();

    if args.record {
        let summary = handle.stop_capture()?;
        println!(
            "Raw capture saved: {} ({} frames, {} bytes)",
            summary.path.display(),
            summary.frames,
            summary.bytes
        );
    }
    let stats = handle.stats();
    handle.close()?;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    Ok(())
}

/// Attach to a channel and print one line per frame
pub fn read(
    config: &Config,
    key: i32,
    signal: Option<i32>,
    interval_ms: u64,
    frames: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    // Block the signal before ctrlc spawns its thread so it inherits the mask.
    let waiter: Box<dyn FrameWaiter> = match signal {
        Some(signal) => Box::new(SignalWaiter::new(signal)?),
        None => Box::new(IntervalWaiter::new(Duration::from_millis(interval_ms))),
    };
    let mut reader = RingReader::attach(key, waiter, config.reader_timeout())?;
    let layout = reader.channel().layout()?;
    println!(
        "Attached to {:#x}: {} slots of {} bytes, meta {} bytes, extra {} bytes",
        key, layout.unit_num, layout.unit_size, layout.meta_size, layout.extra_size
    );

    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_flag_clone = stop_flag.clone();
    ctrlc::set_handler(move || {
        stop_flag_clone.store(true, Ordering::SeqCst);
    })?;

    let mut last_sequence = None;
    while !stop_flag.load(Ordering::SeqCst) {
        if frames.is_some_and(|n| reader.frames_read() >= n) {
            break;
        }
        match reader.next_frame()? {
            ReaderEvent::Frame(frame) => {
                match frame.meta.as_deref().and_then(FrameMeta::decode) {
                    Some(meta) if last_sequence != Some(meta.sequence) => {
                        last_sequence = Some(meta.sequence);
                        println!(
                            "slot {}  seq {}  {}x{} {}  {} bytes  ts {}ns",
                            frame.index,
                            meta.sequence,
                            meta.width,
                            meta.height,
                            camera_service::backends::camera::fourcc_string(meta.fourcc),
                            meta.bytes_used,
                            meta.timestamp_ns
                        );
                    }
                    Some(_) => {}
                    None => println!("slot {}  {} bytes", frame.index, frame.data.len()),
                }
            }
            ReaderEvent::NotReady => {}
            ReaderEvent::Terminated => {
                println!("Producer terminated the channel");
                break;
            }
            ReaderEvent::ProducerGone => {
                println!("No frames within {:?}, producer presumed gone", config.reader_timeout());
                break;
            }
        }
    }

    let read = reader.frames_read();
    reader.close()?;
    println!("Read {} frames", read);
    Ok(())
}

/// Print device information as JSON
pub fn device_info(
    mut config: Config,
    path: Option<String>,
    backend: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(backend) = backend {
        config.backend = backend;
    }
    let path = path.unwrap_or_else(|| config.device_path.clone());
    let mut handle = CameraHandle::create(&config.backend)?;
    let info = handle.get_device_info(&path)?;
    println!("{}", serde_json::to_string_pretty(&info)?);

    // Current format needs an open device
    if handle.open(&path, 0, NotifyTarget::None).is_ok() {
        let format: FormatSpec = handle.get_format()?;
        println!("Current format: {}", format);
        handle.close()?;
    }
    Ok(())
}

/// Get default raw capture directory
fn get_default_capture_dir() -> PathBuf {
    dirs::video_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join(DEFAULT_SAVE_FOLDER)
}
