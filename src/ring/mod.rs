// SPDX-License-Identifier: GPL-3.0-only

//! Shared-memory ring channel
//!
//! A fixed number of equally-sized slots in one System V segment, written by a
//! single producer and read by any number of attached processes. Readers always
//! take the most recently published frame; there is no per-reader cursor and no
//! back-pressure. Index updates are the only cross-process synchronisation:
//! the writer fills a slot completely, then publishes it with a release store
//! of `write_index`; readers acquire-load the index before touching the slot.
//!
//! # Example
//!
//! ```no_run
//! use camera_service::ring::SharedRingChannel;
//!
//! let mut producer = SharedRingChannel::create(1024, 64, 4, 0)?;
//! producer.write_copy(&[0xAB; 100], None, None)?;
//!
//! let reader = SharedRingChannel::attach(producer.key())?;
//! let frame = reader.read_latest()?;
//! assert_eq!(frame.data.len(), 100);
//! # Ok::<(), camera_service::errors::ServiceError>(())
//! ```

pub mod layout;
pub mod reader;
mod segment;

pub use layout::{ChannelMark, RingChannelLayout, HEADER_SIZE, WRITE_INDEX_UNSET};
pub use reader::{ReaderEvent, RingReader};

use crate::errors::{ServiceError, ServiceResult};
use layout::{RingHeader, RingView};
use segment::{RingSemaphore, ShmSegment};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use tracing::{debug, info, warn};

/// Parameters for creating a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    pub unit_size: u32,
    pub meta_size: u32,
    pub unit_num: u32,
    /// 0 disables the extra-data region
    pub extra_size: u32,
    /// Also create a System V semaphore under the channel key
    pub with_semaphore: bool,
}

impl ChannelOptions {
    pub fn new(unit_size: u32, meta_size: u32, unit_num: u32) -> Self {
        Self {
            unit_size,
            meta_size,
            unit_num,
            extra_size: 0,
            with_semaphore: false,
        }
    }
}

/// A frame copied out of the channel by [`SharedRingChannel::read_latest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatestFrame {
    /// Slot the frame was read from
    pub index: u32,
    pub data: Vec<u8>,
    /// Present when the slot carries metadata
    pub meta: Option<Vec<u8>>,
    /// Present when the channel has an extra-data region
    pub extra: Option<Vec<u8>>,
}

/// Borrowed address range inside a channel slot.
///
/// Handed to the capture device for zero-copy publishing. The region is only
/// valid while the channel stays open.
#[derive(Debug, Clone, Copy)]
pub struct SlotRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: a region is an address into process-shared memory; ownership of the
// bytes is governed by the buffer queue, not by the handle.
unsafe impl Send for SlotRegion {}

impl SlotRegion {
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Payload (and optionally extra-data) region of one slot.
#[derive(Debug, Clone, Copy)]
pub struct ExportedSlot {
    pub index: u32,
    pub payload: SlotRegion,
    pub extra: Option<SlotRegion>,
}

/// Handle to a ring channel, either as its creator or as an attached reader.
pub struct SharedRingChannel {
    segment: Option<ShmSegment>,
    view: Option<RingView>,
    semaphore: Option<RingSemaphore>,
    key: i32,
}

impl SharedRingChannel {
    /// Create a channel without semaphore.
    pub fn create(
        unit_size: u32,
        meta_size: u32,
        unit_num: u32,
        extra_size: u32,
    ) -> ServiceResult<Self> {
        Self::create_with(ChannelOptions {
            unit_size,
            meta_size,
            unit_num,
            extra_size,
            with_semaphore: false,
        })
    }

    /// Create a channel under a fresh key and initialise its header.
    pub fn create_with(options: ChannelOptions) -> ServiceResult<Self> {
        let layout = RingChannelLayout::new(
            options.unit_size,
            options.meta_size,
            options.unit_num,
            options.extra_size,
        )?;

        let segment = ShmSegment::create_exclusive(layout.total_len())?;
        let key = segment.key();
        // SAFETY: the segment is at least total_len() bytes and lives as long
        // as `self.segment`.
        let view = unsafe { RingView::new(segment.addr(), layout) };
        view.init_header(RingHeader {
            write_index: AtomicI32::new(WRITE_INDEX_UNSET),
            read_index: AtomicI32::new(WRITE_INDEX_UNSET),
            unit_size: layout.unit_size,
            meta_size: layout.meta_size,
            unit_num: layout.unit_num,
            mark: AtomicU32::new(ChannelMark::Normal as u32),
        });
        view.set_extra_size_cell(layout.extra_size);
        for index in 0..layout.unit_num {
            let slot = view.slot(index);
            slot.set_length(0);
            slot.set_meta_length(0);
        }

        let semaphore = if options.with_semaphore {
            match RingSemaphore::create(key) {
                Ok(sem) => Some(sem),
                Err(e) => {
                    segment.remove();
                    return Err(e);
                }
            }
        } else {
            None
        };

        info!(
            key = format_args!("{key:#x}"),
            unit_size = layout.unit_size,
            meta_size = layout.meta_size,
            unit_num = layout.unit_num,
            extra_size = layout.extra_size,
            bytes = layout.total_len(),
            "Created ring channel"
        );

        Ok(Self {
            segment: Some(segment),
            view: Some(view),
            semaphore,
            key,
        })
    }

    /// Attach to an existing channel by key.
    ///
    /// The layout is read back from the header. The extra-data region is
    /// enabled when the segment is larger than the base layout.
    pub fn attach(key: i32) -> ServiceResult<Self> {
        let segment = ShmSegment::attach(key)?;
        if segment.size() < HEADER_SIZE {
            return Err(ServiceError::InvalidParameter(format!(
                "segment {key:#x} too small for a ring header ({} bytes)",
                segment.size()
            )));
        }

        // SAFETY: the header fits, checked above.
        let header = unsafe { &*(segment.addr().as_ptr() as *const RingHeader) };
        let base = RingChannelLayout::new(header.unit_size, header.meta_size, header.unit_num, 0)?;
        if segment.size() < base.base_len() {
            return Err(ServiceError::InvalidParameter(format!(
                "segment {key:#x} is {} bytes, header describes {}",
                segment.size(),
                base.base_len()
            )));
        }

        // SAFETY: base_len() bytes are mapped.
        let base_view = unsafe { RingView::new(segment.addr(), base) };
        let extra_size = if segment.size() > base.base_len() {
            base_view.extra_size_cell()
        } else {
            0
        };
        let layout =
            RingChannelLayout::new(base.unit_size, base.meta_size, base.unit_num, extra_size)?;
        if layout.total_len() > segment.size() {
            return Err(ServiceError::InvalidParameter(format!(
                "segment {key:#x} extra region truncated"
            )));
        }
        // SAFETY: total_len() bytes are mapped, checked above.
        let view = unsafe { RingView::new(segment.addr(), layout) };

        debug!(
            key = format_args!("{key:#x}"),
            unit_size = layout.unit_size,
            unit_num = layout.unit_num,
            extra_size = layout.extra_size,
            "Attached to ring channel"
        );

        Ok(Self {
            segment: Some(segment),
            view: Some(view),
            semaphore: RingSemaphore::open(key),
            key,
        })
    }

    /// System V key readers attach with.
    pub fn key(&self) -> i32 {
        self.key
    }

    pub fn is_closed(&self) -> bool {
        self.view.is_none()
    }

    fn view(&self) -> ServiceResult<&RingView> {
        self.view
            .as_ref()
            .ok_or_else(|| ServiceError::InvalidState("ring channel is closed".to_string()))
    }

    /// Layout of the attached segment.
    pub fn layout(&self) -> ServiceResult<RingChannelLayout> {
        Ok(*self.view()?.layout())
    }

    /// Current raw write index (`-1` before the first publish).
    pub fn write_index(&self) -> ServiceResult<i32> {
        Ok(self.view()?.header().write_index.load(Ordering::Acquire))
    }

    /// Copy one frame into the slot at `write_index` and publish it.
    ///
    /// Meta is stored only when strictly shorter than `meta_size`; longer meta
    /// is dropped with a warning and the frame is still published. Extra data
    /// must be exactly `extra_size` bytes.
    pub fn write_copy(
        &mut self,
        data: &[u8],
        meta: Option<&[u8]>,
        extra: Option<&[u8]>,
    ) -> ServiceResult<()> {
        let view = self.view()?;
        let layout = *view.layout();

        if data.is_empty() || data.len() > layout.unit_size as usize {
            return Err(ServiceError::InvalidParameter(format!(
                "frame of {} bytes does not fit unit size {}",
                data.len(),
                layout.unit_size
            )));
        }
        if let Some(extra) = extra {
            check_extra(&layout, extra)?;
        }

        let header = view.header();
        let current = header.write_index.load(Ordering::Acquire);
        if current >= layout.unit_num as i32 {
            warn!(
                key = format_args!("{:#x}", self.key),
                write_index = current,
                "Write index past wrap point, resetting"
            );
            header.write_index.store(0, Ordering::Release);
            return Err(ServiceError::Overflow);
        }
        let index = current.max(0) as u32;

        let slot = view.slot(index);
        slot.write_payload(data);
        slot.set_length(data.len() as u32);
        store_meta(&layout, &slot, meta);
        if let Some(extra) = extra {
            slot.write_extra(extra);
        }

        header
            .write_index
            .store(next_index(index, layout.unit_num), Ordering::Release);
        Ok(())
    }

    /// Copy out the most recently published frame.
    ///
    /// Non-destructive: calling twice with no intervening write returns the
    /// same frame.
    pub fn read_latest(&self) -> ServiceResult<LatestFrame> {
        let view = self.view()?;
        let layout = *view.layout();
        let write_index = view.header().write_index.load(Ordering::Acquire);

        let index = match write_index {
            i if i < 0 => return Err(ServiceError::NotReady),
            0 => {
                // Either nothing was written yet or the writer just wrapped.
                let last = layout.unit_num - 1;
                if view.slot(last).length() == 0 {
                    return Err(ServiceError::NotReady);
                }
                last
            }
            i if i as u32 > layout.unit_num => {
                return Err(ServiceError::CorruptSlot {
                    index: i as u32,
                    length: 0,
                });
            }
            i => i as u32 - 1,
        };

        let slot = view.slot(index);
        let length = slot.length();
        if length == 0 || length > layout.unit_size {
            return Err(ServiceError::CorruptSlot { index, length });
        }
        let data = slot.read_payload(length as usize);

        let meta = match slot.meta_length() {
            0 => None,
            n if n < layout.meta_size => Some(slot.read_meta(n as usize)),
            _ => None,
        };

        Ok(LatestFrame {
            index,
            data,
            meta,
            extra: slot.read_extra(),
        })
    }

    /// Expose every slot's payload (and optionally extra) region for zero-copy writes.
    ///
    /// `num_buffers` must equal the channel's unit count.
    pub fn export_slots(
        &mut self,
        num_buffers: u32,
        include_extra: bool,
    ) -> ServiceResult<Vec<ExportedSlot>> {
        let view = self.view()?;
        let layout = *view.layout();
        if num_buffers != layout.unit_num {
            return Err(ServiceError::CountMismatch {
                expected: layout.unit_num,
                requested: num_buffers,
            });
        }

        let region = |ptr: *mut u8, len: u32| {
            NonNull::new(ptr).map(|ptr| SlotRegion {
                ptr,
                len: len as usize,
            })
        };

        (0..layout.unit_num)
            .map(|index| {
                let slot = view.slot(index);
                let payload = region(slot.payload_ptr(), layout.unit_size).ok_or_else(|| {
                    ServiceError::InvalidState("slot address is null".to_string())
                })?;
                let extra = if include_extra {
                    slot.extra_ptr()
                        .and_then(|ptr| region(ptr, layout.extra_size))
                } else {
                    None
                };
                Ok(ExportedSlot {
                    index,
                    payload,
                    extra,
                })
            })
            .collect()
    }

    /// Record a zero-copy write: the device already filled slot `index`.
    pub fn publish_header(&mut self, index: u32, bytes_written: u32) -> ServiceResult<()> {
        let view = self.view()?;
        let layout = *view.layout();
        if index >= layout.unit_num {
            return Err(ServiceError::InvalidParameter(format!(
                "slot {} out of range ({} slots)",
                index, layout.unit_num
            )));
        }
        if bytes_written == 0 || bytes_written > layout.unit_size {
            return Err(ServiceError::InvalidParameter(format!(
                "{} bytes written to a {}-byte slot",
                bytes_written, layout.unit_size
            )));
        }

        let slot = view.slot(index);
        slot.set_length(bytes_written);
        slot.set_meta_length(0);
        view.header()
            .write_index
            .store(index as i32, Ordering::Release);
        Ok(())
    }

    /// Attach meta to the slot selected by the last `publish_header`.
    pub fn publish_meta(&mut self, meta: &[u8]) -> ServiceResult<()> {
        let view = self.view()?;
        let layout = *view.layout();
        let index = current_slot(view)?;
        store_meta(&layout, &view.slot(index), Some(meta));
        Ok(())
    }

    /// Attach extra data to the slot selected by the last `publish_header`.
    pub fn publish_extra(&mut self, extra: &[u8]) -> ServiceResult<()> {
        let view = self.view()?;
        let layout = *view.layout();
        check_extra(&layout, extra)?;
        let index = current_slot(view)?;
        view.slot(index).write_extra(extra);
        Ok(())
    }

    /// Move `write_index` past the slot selected by the last `publish_header`.
    pub fn advance_write_index(&mut self) -> ServiceResult<()> {
        let view = self.view()?;
        let layout = *view.layout();
        let index = current_slot(view)?;
        view.header()
            .write_index
            .store(next_index(index, layout.unit_num), Ordering::Release);
        Ok(())
    }

    /// Advisory reader bookkeeping; the writer never consults it.
    pub fn set_read_index(&self, index: i32) -> ServiceResult<()> {
        self.view()?
            .header()
            .read_index
            .store(index, Ordering::Release);
        Ok(())
    }

    pub fn read_index(&self) -> ServiceResult<i32> {
        Ok(self.view()?.header().read_index.load(Ordering::Acquire))
    }

    pub fn set_mark(&self, mark: ChannelMark) -> ServiceResult<()> {
        self.view()?
            .header()
            .mark
            .store(mark as u32, Ordering::Release);
        Ok(())
    }

    /// Producer state; unknown raw values read as `Normal`.
    pub fn mark(&self) -> ServiceResult<ChannelMark> {
        let raw = self.view()?.header().mark.load(Ordering::Acquire);
        Ok(ChannelMark::from_raw(raw).unwrap_or_default())
    }

    /// Whether the channel carries a semaphore.
    pub fn has_semaphore(&self) -> bool {
        self.semaphore.is_some()
    }

    /// Take the channel semaphore until the guard drops.
    pub fn lock_exclusive(&self) -> ServiceResult<RingLockGuard<'_>> {
        self.view()?;
        let semaphore = self.semaphore.as_ref().ok_or_else(|| {
            ServiceError::InvalidState("ring channel was created without a semaphore".to_string())
        })?;
        semaphore.lock()?;
        Ok(RingLockGuard { semaphore })
    }

    /// Detach from the channel; the last process out removes the segment.
    ///
    /// A second call fails with `InvalidState`.
    pub fn close(&mut self) -> ServiceResult<()> {
        let Some(mut segment) = self.segment.take() else {
            return Err(ServiceError::InvalidState(
                "ring channel already closed".to_string(),
            ));
        };
        self.view = None;
        segment.detach()?;

        // After our detach the id may already be gone if another process
        // removed it; that counts as nothing left to clean up.
        let remaining = segment.attach_count().unwrap_or(0);
        if remaining == 0 {
            segment.remove();
            if let Some(semaphore) = self.semaphore.take() {
                semaphore.remove();
            }
            info!(key = format_args!("{:#x}", self.key), "Removed ring channel");
        } else {
            debug!(
                key = format_args!("{:#x}", self.key),
                remaining, "Detached from ring channel"
            );
        }
        self.semaphore = None;
        Ok(())
    }
}

impl Drop for SharedRingChannel {
    fn drop(&mut self) {
        if self.segment.is_some()
            && let Err(e) = self.close()
        {
            warn!(key = format_args!("{:#x}", self.key), error = %e, "Failed to close ring channel");
        }
    }
}

impl std::fmt::Debug for SharedRingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRingChannel")
            .field("key", &format_args!("{:#x}", self.key))
            .field("layout", &self.view.as_ref().map(|v| *v.layout()))
            .field("semaphore", &self.semaphore.is_some())
            .finish()
    }
}

/// Holds the channel semaphore; releases it on drop.
pub struct RingLockGuard<'a> {
    semaphore: &'a RingSemaphore,
}

impl Drop for RingLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.semaphore.unlock() {
            warn!(error = %e, "Failed to release ring semaphore");
        }
    }
}

fn next_index(index: u32, unit_num: u32) -> i32 {
    let next = index + 1;
    if next >= unit_num { 0 } else { next as i32 }
}

fn check_extra(layout: &RingChannelLayout, extra: &[u8]) -> ServiceResult<()> {
    if !layout.has_extra() {
        return Err(ServiceError::InvalidParameter(
            "channel has no extra-data region".to_string(),
        ));
    }
    if extra.len() != layout.extra_size as usize {
        return Err(ServiceError::InvalidParameter(format!(
            "extra data is {} bytes, channel expects {}",
            extra.len(),
            layout.extra_size
        )));
    }
    Ok(())
}

fn store_meta(layout: &RingChannelLayout, slot: &layout::SlotView<'_>, meta: Option<&[u8]>) {
    match meta {
        Some(meta) if !meta.is_empty() && meta.len() < layout.meta_size as usize => {
            slot.write_meta(meta);
            slot.set_meta_length(meta.len() as u32);
        }
        Some(meta) if !meta.is_empty() => {
            warn!(
                len = meta.len(),
                meta_size = layout.meta_size,
                "Frame meta does not fit, skipping"
            );
            slot.set_meta_length(0);
        }
        _ => slot.set_meta_length(0),
    }
}

/// Slot currently selected by `write_index` on the zero-copy path.
fn current_slot(view: &RingView) -> ServiceResult<u32> {
    let index = view.header().write_index.load(Ordering::Acquire);
    let unit_num = view.layout().unit_num;
    if index < 0 || index as u32 >= unit_num {
        return Err(ServiceError::InvalidState(format!(
            "no slot selected (write_index {})",
            index
        )));
    }
    Ok(index as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_index_wraps() {
        assert_eq!(next_index(0, 4), 1);
        assert_eq!(next_index(3, 4), 0);
        assert_eq!(next_index(0, 1), 0);
    }

    #[test]
    fn test_close_twice_is_invalid_state() {
        let mut channel = SharedRingChannel::create(64, 0, 2, 0).unwrap();
        channel.close().unwrap();
        assert!(channel.is_closed());
        assert!(matches!(channel.close(), Err(ServiceError::InvalidState(_))));
        assert!(matches!(
            channel.read_latest(),
            Err(ServiceError::InvalidState(_))
        ));
    }

    #[test]
    fn test_oversized_meta_is_skipped() {
        let mut channel = SharedRingChannel::create(64, 8, 2, 0).unwrap();
        channel.write_copy(&[1; 10], Some(&[2; 8]), None).unwrap();
        let frame = channel.read_latest().unwrap();
        assert_eq!(frame.data, vec![1; 10]);
        assert_eq!(frame.meta, None);

        channel.write_copy(&[3; 10], Some(&[4; 7]), None).unwrap();
        assert_eq!(channel.read_latest().unwrap().meta, Some(vec![4; 7]));
    }

    #[test]
    fn test_write_without_meta_clears_stale_meta() {
        let mut channel = SharedRingChannel::create(16, 8, 1, 0).unwrap();
        channel.write_copy(&[1; 4], Some(&[9; 3]), None).unwrap();
        channel.write_copy(&[2; 4], None, None).unwrap();
        assert_eq!(channel.read_latest().unwrap().meta, None);
    }

    #[test]
    fn test_semaphore_guard() {
        let channel = SharedRingChannel::create_with(ChannelOptions {
            with_semaphore: true,
            ..ChannelOptions::new(32, 0, 2)
        })
        .unwrap();
        assert!(channel.has_semaphore());
        {
            let _guard = channel.lock_exclusive().unwrap();
        }
        let _again = channel.lock_exclusive().unwrap();
    }

    #[test]
    fn test_lock_without_semaphore_is_invalid_state() {
        let channel = SharedRingChannel::create(32, 0, 2, 0).unwrap();
        assert!(matches!(
            channel.lock_exclusive(),
            Err(ServiceError::InvalidState(_))
        ));
    }
}
