// SPDX-License-Identifier: GPL-3.0-only

//! Device buffers through the ring channel, end to end on the virtual backend

use camera_service::ServiceError;
use camera_service::backends::camera::virtual_device::VirtualDevice;
use camera_service::backends::camera::{
    BufferState, CaptureBufferManager, DeviceHal, FormatSpec, IoMode, PreviewMemory, SharedHal,
    share,
};
use camera_service::pipelines::publish_frame;
use camera_service::ring::SharedRingChannel;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_millis(500);

fn virtual_hal(format: FormatSpec) -> (SharedHal, FormatSpec) {
    let mut device = VirtualDevice::new();
    device.open("virtual0").unwrap();
    let negotiated = device.set_format(&format).unwrap();
    (share(Box::new(device)), negotiated)
}

fn roundtrip(mode: IoMode, memory: PreviewMemory) {
    let (hal, format) = virtual_hal(FormatSpec::new(64, 16, "YUYV"));
    let mut channel = SharedRingChannel::create(format.size_image, 0, 4, 0).unwrap();
    let mut manager = CaptureBufferManager::new(hal);

    assert_eq!(manager.request_buffers(4, mode).unwrap(), 4);
    manager.start_capture().unwrap();

    for n in 0..10u64 {
        let frame = manager.dequeue(TIMEOUT).unwrap();
        assert_eq!(frame.length, format.size_image);
        assert_eq!(&frame.data()[..8], &n.to_le_bytes());
        let index = frame.index;
        publish_frame(&mut channel, memory, &frame, None).unwrap();
        drop(frame);
        manager.release(index).unwrap();
    }

    manager.stop_capture().unwrap();
    manager.destroy_buffers().unwrap();
    assert_eq!(manager.live_mappings(), 0);
    assert_eq!(manager.state(), BufferState::Idle);

    // Ten writes over four slots
    assert_eq!(channel.write_index().unwrap(), 10 % 4);
    let latest = channel.read_latest().unwrap();
    assert_eq!(&latest.data[..8], &9u64.to_le_bytes());
}

#[test]
fn test_mapped_roundtrip() {
    roundtrip(IoMode::Mapped, PreviewMemory::Mapped);
}

#[test]
fn test_user_pointer_roundtrip() {
    roundtrip(IoMode::UserPointer, PreviewMemory::UserPointer);
}

#[test]
fn test_exported_roundtrip() {
    roundtrip(IoMode::ExportedHandle, PreviewMemory::ExportedHandle);
}

#[test]
fn test_mapped_regions_live_until_destroy() {
    let (hal, _) = virtual_hal(FormatSpec::new(32, 8, "GREY"));
    let mut manager = CaptureBufferManager::new(hal);
    manager.request_buffers(4, IoMode::Mapped).unwrap();
    assert_eq!(manager.live_mappings(), 4);
    manager.destroy_buffers().unwrap();
    assert_eq!(manager.live_mappings(), 0);
}

#[test]
fn test_dequeue_outside_streaming() {
    let (hal, _) = virtual_hal(FormatSpec::new(32, 8, "GREY"));
    let mut manager = CaptureBufferManager::new(hal);
    manager.request_buffers(2, IoMode::Mapped).unwrap();

    assert!(matches!(
        manager.dequeue(TIMEOUT),
        Err(ServiceError::InvalidState(_))
    ));

    manager.start_capture().unwrap();
    let index = manager.dequeue(TIMEOUT).unwrap().index;
    manager.release(index).unwrap();
    manager.stop_capture().unwrap();
    manager.destroy_buffers().unwrap();

    assert!(matches!(
        manager.dequeue(TIMEOUT),
        Err(ServiceError::InvalidState(_))
    ));
    assert!(matches!(
        manager.release(0),
        Err(ServiceError::InvalidState(_))
    ));
}

#[test]
fn test_in_flight_capped_by_pool() {
    let (hal, _) = virtual_hal(FormatSpec::new(32, 8, "GREY"));
    let mut manager = CaptureBufferManager::new(hal);
    manager.request_buffers(2, IoMode::UserPointer).unwrap();
    manager.start_capture().unwrap();

    let first = manager.dequeue(TIMEOUT).unwrap().index;
    let second = manager.dequeue(TIMEOUT).unwrap().index;
    assert_eq!(manager.in_flight(), 2);
    // Nothing is queued, so the device cannot complete another frame
    assert_eq!(
        manager.dequeue(Duration::from_millis(50)).unwrap_err(),
        ServiceError::NoData
    );

    manager.release(first).unwrap();
    manager.release(second).unwrap();
    assert_eq!(manager.in_flight(), 0);
}
