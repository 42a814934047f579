// SPDX-License-Identifier: GPL-3.0-only

//! One buffer strategy per [`IoMode`]
//!
//! The strategy is chosen once when buffers are requested; every later step
//! (enqueue, payload lookup, teardown) dispatches through it.

use super::buffers::FramePayload;
use super::mapping::{ExportedMapping, HostBlock, MappedRegion};
use super::types::{Dequeued, EnqueuePayload, IoMode};
use super::DeviceHal;
use crate::errors::{ServiceError, ServiceResult};
use crate::ring::SlotRegion;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use tracing::debug;

pub(crate) trait IoStrategy: Send {
    fn mode(&self) -> IoMode;

    /// Host-side setup after the device granted `count` buffers.
    ///
    /// On error nothing allocated by this call survives.
    fn allocate(&mut self, hal: &dyn DeviceHal, count: u32) -> ServiceResult<()>;

    /// Queue every buffer before streaming starts.
    fn enqueue_all(&mut self, hal: &mut dyn DeviceHal) -> ServiceResult<()>;

    /// Give buffer `index` back to the device.
    fn requeue(&mut self, hal: &mut dyn DeviceHal, index: u32) -> ServiceResult<()>;

    /// Borrowed view of a dequeued buffer; `None` for modes that hand out
    /// transient mappings instead.
    fn view(&self, dequeued: &Dequeued) -> Option<FramePayload<'_>>;

    /// Fresh mapping of a dequeued buffer, owned by the caller.
    fn map_transient(&self, _dequeued: &Dequeued) -> ServiceResult<Option<ExportedMapping>> {
        Ok(None)
    }

    /// Drop every host-side resource.
    fn release(&mut self);
}

/// Build the strategy for `mode`. `slots` only applies to `UserPointer`.
pub(crate) fn strategy_for(
    mode: IoMode,
    slots: Option<Vec<SlotRegion>>,
    live: &Arc<AtomicUsize>,
) -> Box<dyn IoStrategy> {
    match mode {
        IoMode::Mapped => Box::new(MappedStrategy {
            regions: Vec::new(),
            live: Arc::clone(live),
        }),
        IoMode::UserPointer => Box::new(UserPointerStrategy {
            blocks: Vec::new(),
            slots,
        }),
        IoMode::ExportedHandle => Box::new(ExportedStrategy {
            count: 0,
            exported: Vec::new(),
            live: Arc::clone(live),
        }),
    }
}

fn out_of_range(index: u32, count: usize) -> ServiceError {
    ServiceError::IoFailure(format!(
        "device returned buffer {} but only {} exist",
        index, count
    ))
}

/// Device memory mapped into the process once, at allocation.
struct MappedStrategy {
    regions: Vec<MappedRegion>,
    live: Arc<AtomicUsize>,
}

impl IoStrategy for MappedStrategy {
    fn mode(&self) -> IoMode {
        IoMode::Mapped
    }

    fn allocate(&mut self, hal: &dyn DeviceHal, count: u32) -> ServiceResult<()> {
        let mut regions = Vec::with_capacity(count as usize);
        for index in 0..count {
            let placement = hal.query_buffer(index)?;
            let region = MappedRegion::map(placement.fd, placement.offset, placement.length, false)?
                .tracked(&self.live);
            debug!(index, length = placement.length, "Mapped device buffer");
            regions.push(region);
        }
        self.regions = regions;
        Ok(())
    }

    fn enqueue_all(&mut self, hal: &mut dyn DeviceHal) -> ServiceResult<()> {
        for index in 0..self.regions.len() as u32 {
            self.requeue(hal, index)?;
        }
        Ok(())
    }

    fn requeue(&mut self, hal: &mut dyn DeviceHal, index: u32) -> ServiceResult<()> {
        hal.enqueue(index, EnqueuePayload::Mapped)?;
        Ok(())
    }

    fn view(&self, dequeued: &Dequeued) -> Option<FramePayload<'_>> {
        let region = self.regions.get(dequeued.index as usize)?;
        let used = (dequeued.bytes_used as usize).min(region.len());
        Some(FramePayload::Mapped(&region.as_slice()[..used]))
    }

    fn release(&mut self) {
        self.regions.clear();
    }
}

/// Host memory the device writes into by address.
///
/// With `slots`, the blocks are ring channel slots and frames land directly
/// in shared memory.
struct UserPointerStrategy {
    blocks: Vec<HostBlock>,
    slots: Option<Vec<SlotRegion>>,
}

impl IoStrategy for UserPointerStrategy {
    fn mode(&self) -> IoMode {
        IoMode::UserPointer
    }

    fn allocate(&mut self, hal: &dyn DeviceHal, count: u32) -> ServiceResult<()> {
        let frame_len = hal.get_format()?.size_image as usize;
        if frame_len == 0 {
            return Err(ServiceError::InvalidState(
                "device reports a zero frame size".to_string(),
            ));
        }

        let blocks = match &self.slots {
            Some(slots) => {
                if slots.len() != count as usize {
                    return Err(ServiceError::CountMismatch {
                        expected: slots.len() as u32,
                        requested: count,
                    });
                }
                if let Some(small) = slots.iter().find(|s| s.len() < frame_len) {
                    return Err(ServiceError::InvalidParameter(format!(
                        "slot of {} bytes cannot hold a {} byte frame",
                        small.len(),
                        frame_len
                    )));
                }
                slots.iter().copied().map(HostBlock::Slot).collect()
            }
            None => (0..count)
                .map(|_| HostBlock::allocate(frame_len))
                .collect::<ServiceResult<Vec<_>>>()?,
        };

        debug!(count, frame_len, shared = self.slots.is_some(), "User pointer blocks ready");
        self.blocks = blocks;
        Ok(())
    }

    fn enqueue_all(&mut self, hal: &mut dyn DeviceHal) -> ServiceResult<()> {
        for index in 0..self.blocks.len() as u32 {
            self.requeue(hal, index)?;
        }
        Ok(())
    }

    fn requeue(&mut self, hal: &mut dyn DeviceHal, index: u32) -> ServiceResult<()> {
        let block = self
            .blocks
            .get(index as usize)
            .ok_or_else(|| out_of_range(index, self.blocks.len()))?;
        hal.enqueue(
            index,
            EnqueuePayload::UserPointer {
                addr: block.as_mut_ptr(),
                length: block.len(),
            },
        )?;
        Ok(())
    }

    fn view(&self, dequeued: &Dequeued) -> Option<FramePayload<'_>> {
        let block = self.blocks.get(dequeued.index as usize)?;
        Some(FramePayload::UserPointer(
            block.bytes(dequeued.bytes_used as usize),
        ))
    }

    fn release(&mut self) {
        self.blocks.clear();
    }
}

/// Device-owned buffers exported as descriptors at capture start.
struct ExportedStrategy {
    count: u32,
    /// Descriptor and buffer length per index
    exported: Vec<(OwnedFd, usize)>,
    live: Arc<AtomicUsize>,
}

impl IoStrategy for ExportedStrategy {
    fn mode(&self) -> IoMode {
        IoMode::ExportedHandle
    }

    fn allocate(&mut self, _hal: &dyn DeviceHal, count: u32) -> ServiceResult<()> {
        self.count = count;
        Ok(())
    }

    fn enqueue_all(&mut self, hal: &mut dyn DeviceHal) -> ServiceResult<()> {
        self.exported.clear();
        for index in 0..self.count {
            let fd = hal.export_buffer(index)?;
            let length = hal.query_buffer(index)?.length;
            hal.enqueue(
                index,
                EnqueuePayload::Exported {
                    fd: fd.as_raw_fd(),
                },
            )?;
            self.exported.push((fd, length));
        }
        debug!(count = self.count, "Exported and queued device buffers");
        Ok(())
    }

    fn requeue(&mut self, hal: &mut dyn DeviceHal, index: u32) -> ServiceResult<()> {
        let (fd, _) = self
            .exported
            .get(index as usize)
            .ok_or_else(|| out_of_range(index, self.exported.len()))?;
        hal.enqueue(
            index,
            EnqueuePayload::Exported {
                fd: fd.as_raw_fd(),
            },
        )?;
        Ok(())
    }

    fn view(&self, _dequeued: &Dequeued) -> Option<FramePayload<'_>> {
        None
    }

    fn map_transient(&self, dequeued: &Dequeued) -> ServiceResult<Option<ExportedMapping>> {
        let (fd, length) = self
            .exported
            .get(dequeued.index as usize)
            .ok_or_else(|| out_of_range(dequeued.index, self.exported.len()))?;
        let region = MappedRegion::map(fd.as_raw_fd(), 0, *length, false)?.tracked(&self.live);
        Ok(Some(ExportedMapping::new(
            dequeued.index,
            dequeued.bytes_used as usize,
            region,
        )))
    }

    fn release(&mut self) {
        self.exported.clear();
        self.count = 0;
    }
}
