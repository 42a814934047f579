// SPDX-License-Identifier: GPL-3.0-only

//! Session lifecycle on the virtual backend, read back through a ring reader

use camera_service::backends::camera::v4l2_controls::V4L2_CID_BRIGHTNESS;
use camera_service::backends::camera::{FormatSpec, PreviewMemory};
use camera_service::notify::NotifyTarget;
use camera_service::pipelines::{CaptureSpec, FrameMeta};
use camera_service::ring::{ReaderEvent, RingReader};
use camera_service::{CameraHandle, Config, ResultCode, ServiceError};
use std::time::{Duration, Instant};

const READ_TIMEOUT: Duration = Duration::from_secs(2);

fn opened_handle() -> (CameraHandle, camera_service::notify::ChannelWaiter) {
    let mut handle = CameraHandle::create("virtual").unwrap();
    let (target, waiter) = NotifyTarget::channel();
    handle.open("virtual0", 7, target).unwrap();
    let format = handle.set_format(&FormatSpec::new(32, 8, "GREY")).unwrap();
    assert_eq!(format.size_image, 256);
    (handle, waiter)
}

fn next_frame(reader: &mut RingReader) -> camera_service::ring::LatestFrame {
    for _ in 0..100 {
        match reader.next_frame().unwrap() {
            ReaderEvent::Frame(frame) => return frame,
            ReaderEvent::NotReady => continue,
            other => panic!("unexpected reader event {other:?}"),
        }
    }
    panic!("no frame after 100 notifications");
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + READ_TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_preview_reaches_reader() {
    let (mut handle, waiter) = opened_handle();
    assert_eq!(handle.device_id(), Some(7));

    let key = handle.start_preview(PreviewMemory::Mapped).unwrap();
    assert_eq!(handle.preview_key(), Some(key));
    let mut reader = RingReader::attach(key, Box::new(waiter), READ_TIMEOUT).unwrap();

    let frame = next_frame(&mut reader);
    assert_eq!(frame.data.len(), 256);
    let meta = FrameMeta::decode(frame.meta.as_deref().unwrap()).unwrap();
    assert_eq!(&frame.data[..8], &meta.sequence.to_le_bytes());
    assert_eq!((meta.width, meta.height), (32, 8));

    handle.stop_preview().unwrap();
    assert!(!handle.is_previewing());
    assert_eq!(reader.next_frame().unwrap(), ReaderEvent::Terminated);
    reader.close().unwrap();
    handle.close().unwrap();
}

#[test]
fn test_shared_slot_preview() {
    let (mut handle, waiter) = opened_handle();
    let key = handle.start_preview(PreviewMemory::SharedSlots).unwrap();
    let mut reader = RingReader::attach(key, Box::new(waiter), READ_TIMEOUT).unwrap();

    let layout = reader.channel().layout().unwrap();
    assert_eq!(layout.unit_size, 256);
    assert_eq!(layout.unit_num, Config::default().buffer_count);

    let frame = next_frame(&mut reader);
    let sequence = u64::from_le_bytes(frame.data[..8].try_into().unwrap());
    assert!(frame.data[8..].iter().all(|&b| b == sequence as u8));

    handle.close().unwrap();
    assert!(!handle.is_open());
}

#[test]
fn test_raw_capture_while_previewing() {
    let (mut handle, _waiter) = opened_handle();
    let path = std::env::temp_dir().join(format!("camera-service-capture-{}.raw", std::process::id()));

    let result = handle.start_capture(CaptureSpec::default(), &path);
    assert_eq!(ResultCode::of(&result), ResultCode::InvalidState);

    handle.start_preview(PreviewMemory::UserPointer).unwrap();
    handle
        .start_capture(
            CaptureSpec {
                max_frames: Some(5),
            },
            &path,
        )
        .unwrap();
    assert!(matches!(
        handle.start_capture(CaptureSpec::default(), &path),
        Err(ServiceError::InvalidState(_))
    ));

    wait_until(|| handle.stats().frames_recorded >= 5);
    let summary = handle.stop_capture().unwrap();
    assert_eq!(summary.frames, 5);
    assert_eq!(summary.bytes, 5 * 256);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 5 * 256);
    assert!(matches!(
        handle.stop_capture(),
        Err(ServiceError::InvalidState(_))
    ));

    handle.close().unwrap();
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_lifecycle_order_enforced() {
    let (mut handle, _waiter) = opened_handle();

    assert!(matches!(
        handle.stop_preview(),
        Err(ServiceError::InvalidState(_))
    ));
    handle.start_preview(PreviewMemory::ExportedHandle).unwrap();

    let again = handle.start_preview(PreviewMemory::Mapped);
    assert_eq!(ResultCode::of(&again), ResultCode::InvalidState);
    let format = handle.set_format(&FormatSpec::new(64, 64, "GREY"));
    assert_eq!(ResultCode::of(&format), ResultCode::InvalidState);

    wait_until(|| handle.stats().frames_published >= 3);
    assert!(handle.is_streaming());
    handle.stop_preview().unwrap();

    // Format is free to change again once preview stopped
    let format = handle.set_format(&FormatSpec::new(64, 64, "GREY")).unwrap();
    assert_eq!(format.size_image, 64 * 64);

    let reopen = handle.open("virtual1", 1, NotifyTarget::None);
    assert_eq!(ResultCode::of(&reopen), ResultCode::InvalidState);
    handle.close().unwrap();
}

#[test]
fn test_properties() {
    let (mut handle, _waiter) = opened_handle();
    handle.set_property(V4L2_CID_BRIGHTNESS, 200).unwrap();
    assert_eq!(handle.get_property(V4L2_CID_BRIGHTNESS).unwrap(), 200);
    assert!(handle.get_property(0xdead_beef).is_err());
    let out_of_range = handle.set_property(V4L2_CID_BRIGHTNESS, 300);
    assert_eq!(ResultCode::of(&out_of_range), ResultCode::InvalidParameter);
    handle.close().unwrap();

    let closed = handle.get_property(V4L2_CID_BRIGHTNESS);
    assert_eq!(ResultCode::of(&closed), ResultCode::InvalidState);
}

#[test]
fn test_handle_from_config() {
    let config = Config {
        backend: "virtual".to_string(),
        device_path: "virtual0".to_string(),
        format: FormatSpec::new(16, 16, "RGB3"),
        ..Config::default()
    };
    let mut handle = CameraHandle::with_config(&config).unwrap();
    handle
        .open(&config.device_path, 0, NotifyTarget::None)
        .unwrap();
    let format = handle.get_format().unwrap();
    assert_eq!(format.fourcc, "RGB3");
    assert_eq!(format.size_image, 16 * 16 * 3);
    // Dropping an open handle closes it
    drop(handle);
}
