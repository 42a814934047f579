// SPDX-License-Identifier: GPL-3.0-only

//! Byte layout of a ring channel segment
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │ write_index │ read_index │ unit_size │ meta_size │ unit_num │ mark  │  (24 B)
//! ├──────────────────────────────────────────────────────────────────────┤
//! │ length[0] .. length[N-1]                                  (N × u32)  │
//! │ payload[0] .. payload[N-1]                          (N × unit_size)  │
//! │ meta_length[0] .. meta_length[N-1]                        (N × u32)  │
//! │ meta[0] .. meta[N-1]                                (N × meta_size)  │
//! │ extra_size                                                    (u32)  │
//! │ extra[0] .. extra[N-1]                             (N × extra_size)  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are native-endian. Offsets are computed once per attach in
//! [`RingChannelLayout`]; [`RingView`] and [`SlotView`] are the only code that
//! touches raw addresses inside the segment.

use crate::constants::ring::LENGTH_CELL;
use crate::errors::{ServiceError, ServiceResult};
use std::mem::size_of;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicI32, AtomicU32};

/// Write index value meaning "no frame published yet"
pub const WRITE_INDEX_UNSET: i32 = -1;

/// Header at offset 0 of every channel segment.
#[repr(C)]
pub struct RingHeader {
    /// Slot the writer fills next; `-1` until the first publish
    pub write_index: AtomicI32,
    /// Advisory reader bookkeeping, never consulted by the writer
    pub read_index: AtomicI32,
    pub unit_size: u32,
    pub meta_size: u32,
    pub unit_num: u32,
    /// Raw [`ChannelMark`]
    pub mark: AtomicU32,
}

/// Size of [`RingHeader`] in bytes
pub const HEADER_SIZE: usize = size_of::<RingHeader>();

/// Producer state advertised to readers through the header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum ChannelMark {
    #[default]
    Normal = 0,
    /// The producer restarted capture on an existing channel
    Reset = 1,
    /// The producer stopped; no further frames will arrive
    Terminate = 2,
}

impl ChannelMark {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(ChannelMark::Normal),
            1 => Some(ChannelMark::Reset),
            2 => Some(ChannelMark::Terminate),
            _ => None,
        }
    }
}

/// Sizes and offsets of every region inside a channel segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingChannelLayout {
    pub unit_size: u32,
    pub meta_size: u32,
    pub unit_num: u32,
    /// Per-slot auxiliary bytes; 0 when the extra region is absent
    pub extra_size: u32,
    lengths_offset: usize,
    payload_offset: usize,
    meta_lengths_offset: usize,
    meta_offset: usize,
    extra_size_offset: usize,
    extra_offset: usize,
}

impl RingChannelLayout {
    /// Compute the layout for a channel.
    ///
    /// `unit_size` and `unit_num` must be non-zero and the whole segment must
    /// fit in `usize`.
    pub fn new(
        unit_size: u32,
        meta_size: u32,
        unit_num: u32,
        extra_size: u32,
    ) -> ServiceResult<Self> {
        if unit_size == 0 {
            return Err(ServiceError::InvalidParameter(
                "unit_size must be non-zero".to_string(),
            ));
        }
        if unit_num == 0 || unit_num > i32::MAX as u32 {
            return Err(ServiceError::InvalidParameter(format!(
                "unit_num {} out of range",
                unit_num
            )));
        }

        let overflow = || {
            ServiceError::InvalidParameter(format!(
                "ring of {} x {} bytes does not fit in memory",
                unit_num, unit_size
            ))
        };
        let n = unit_num as usize;
        let array = |width: usize| n.checked_mul(width).ok_or_else(overflow);

        let lengths_offset = HEADER_SIZE;
        let payload_offset = lengths_offset + array(LENGTH_CELL)?;
        let meta_lengths_offset = payload_offset
            .checked_add(array(unit_size as usize)?)
            .ok_or_else(overflow)?;
        let meta_offset = meta_lengths_offset
            .checked_add(array(LENGTH_CELL)?)
            .ok_or_else(overflow)?;
        let extra_size_offset = meta_offset
            .checked_add(array(meta_size as usize)?)
            .ok_or_else(overflow)?;
        let extra_offset = extra_size_offset + LENGTH_CELL;
        extra_offset
            .checked_add(array(extra_size as usize)?)
            .ok_or_else(overflow)?;

        Ok(Self {
            unit_size,
            meta_size,
            unit_num,
            extra_size,
            lengths_offset,
            payload_offset,
            meta_lengths_offset,
            meta_offset,
            extra_size_offset,
            extra_offset,
        })
    }

    /// Segment size without the extra-data region (the `extra_size` scalar is included).
    pub fn base_len(&self) -> usize {
        self.extra_offset
    }

    /// Full segment size.
    pub fn total_len(&self) -> usize {
        self.extra_offset + self.unit_num as usize * self.extra_size as usize
    }

    /// Whether slots carry auxiliary data.
    pub fn has_extra(&self) -> bool {
        self.extra_size > 0
    }

    fn length_cell(&self, index: u32) -> usize {
        self.lengths_offset + index as usize * LENGTH_CELL
    }

    fn payload(&self, index: u32) -> usize {
        self.payload_offset + index as usize * self.unit_size as usize
    }

    fn meta_length_cell(&self, index: u32) -> usize {
        self.meta_lengths_offset + index as usize * LENGTH_CELL
    }

    fn meta(&self, index: u32) -> usize {
        self.meta_offset + index as usize * self.meta_size as usize
    }

    fn extra(&self, index: u32) -> usize {
        self.extra_offset + index as usize * self.extra_size as usize
    }
}

/// Typed accessor over a mapped channel segment.
pub(crate) struct RingView {
    base: NonNull<u8>,
    layout: RingChannelLayout,
}

// SAFETY: the view only hands out raw addresses into process-shared memory;
// the single-writer protocol governs concurrent access, not Rust aliasing.
unsafe impl Send for RingView {}

impl RingView {
    /// # Safety
    ///
    /// `base` must point at a live mapping of at least `layout.total_len()`
    /// bytes that outlives the view.
    pub(crate) unsafe fn new(base: NonNull<u8>, layout: RingChannelLayout) -> Self {
        Self { base, layout }
    }

    pub(crate) fn layout(&self) -> &RingChannelLayout {
        &self.layout
    }

    pub(crate) fn header(&self) -> &RingHeader {
        // SAFETY: the segment starts with a header and is page aligned.
        unsafe { &*(self.base.as_ptr() as *const RingHeader) }
    }

    /// Write a fresh header, as done once by the creating process.
    pub(crate) fn init_header(&self, header: RingHeader) {
        // SAFETY: the header region is in bounds and aligned; nobody else has
        // the key yet.
        unsafe { ptr::write(self.base.as_ptr() as *mut RingHeader, header) }
    }

    pub(crate) fn extra_size_cell(&self) -> u32 {
        self.read_cell(self.layout.extra_size_offset)
    }

    pub(crate) fn set_extra_size_cell(&self, value: u32) {
        self.write_cell(self.layout.extra_size_offset, value)
    }

    pub(crate) fn slot(&self, index: u32) -> SlotView<'_> {
        debug_assert!(index < self.layout.unit_num, "slot {index} out of range");
        SlotView { view: self, index }
    }

    fn at(&self, offset: usize) -> *mut u8 {
        // SAFETY: every offset comes from the layout and lies within the mapping.
        unsafe { self.base.as_ptr().add(offset) }
    }

    fn read_cell(&self, offset: usize) -> u32 {
        // SAFETY: cells are 4 bytes inside the mapping; they may be unaligned
        // when unit_size is not a multiple of 4.
        unsafe { ptr::read_unaligned(self.at(offset) as *const u32) }
    }

    fn write_cell(&self, offset: usize, value: u32) {
        // SAFETY: see `read_cell`.
        unsafe { ptr::write_unaligned(self.at(offset) as *mut u32, value) }
    }
}

/// One slot of the ring: length cell, payload, meta and extra data.
pub(crate) struct SlotView<'a> {
    view: &'a RingView,
    index: u32,
}

impl SlotView<'_> {
    pub(crate) fn length(&self) -> u32 {
        self.view
            .read_cell(self.view.layout.length_cell(self.index))
    }

    pub(crate) fn set_length(&self, length: u32) {
        self.view
            .write_cell(self.view.layout.length_cell(self.index), length)
    }

    pub(crate) fn meta_length(&self) -> u32 {
        self.view
            .read_cell(self.view.layout.meta_length_cell(self.index))
    }

    pub(crate) fn set_meta_length(&self, length: u32) {
        self.view
            .write_cell(self.view.layout.meta_length_cell(self.index), length)
    }

    pub(crate) fn payload_ptr(&self) -> *mut u8 {
        self.view.at(self.view.layout.payload(self.index))
    }

    pub(crate) fn meta_ptr(&self) -> *mut u8 {
        self.view.at(self.view.layout.meta(self.index))
    }

    pub(crate) fn extra_ptr(&self) -> Option<*mut u8> {
        self.view
            .layout
            .has_extra()
            .then(|| self.view.at(self.view.layout.extra(self.index)))
    }

    pub(crate) fn write_payload(&self, data: &[u8]) {
        debug_assert!(data.len() <= self.view.layout.unit_size as usize);
        // SAFETY: callers validate `data.len() <= unit_size`.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), self.payload_ptr(), data.len()) }
    }

    pub(crate) fn write_meta(&self, meta: &[u8]) {
        debug_assert!(meta.len() <= self.view.layout.meta_size as usize);
        // SAFETY: callers validate `meta.len() <= meta_size`.
        unsafe { ptr::copy_nonoverlapping(meta.as_ptr(), self.meta_ptr(), meta.len()) }
    }

    pub(crate) fn write_extra(&self, extra: &[u8]) {
        if let Some(dst) = self.extra_ptr() {
            debug_assert_eq!(extra.len(), self.view.layout.extra_size as usize);
            // SAFETY: callers validate `extra.len() == extra_size`.
            unsafe { ptr::copy_nonoverlapping(extra.as_ptr(), dst, extra.len()) }
        }
    }

    pub(crate) fn read_payload(&self, len: usize) -> Vec<u8> {
        copy_out(self.payload_ptr(), len)
    }

    pub(crate) fn read_meta(&self, len: usize) -> Vec<u8> {
        copy_out(self.meta_ptr(), len)
    }

    pub(crate) fn read_extra(&self) -> Option<Vec<u8>> {
        self.extra_ptr()
            .map(|src| copy_out(src, self.view.layout.extra_size as usize))
    }
}

fn copy_out(src: *const u8, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    // SAFETY: `src..src+len` lies within one slot region of the mapping.
    unsafe { ptr::copy_nonoverlapping(src, out.as_mut_ptr(), len) };
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_is_24_bytes() {
        assert_eq!(HEADER_SIZE, 24);
    }

    #[test]
    fn test_layout_matches_create_formula() {
        let layout = RingChannelLayout::new(1024, 64, 4, 16).unwrap();
        let expected = HEADER_SIZE + (1024 + 4) * 4 + (64 + 4) * 4 + 4 + 16 * 4;
        assert_eq!(layout.total_len(), expected);
        assert_eq!(layout.base_len(), expected - 16 * 4);
    }

    #[test]
    fn test_layout_without_extra() {
        let layout = RingChannelLayout::new(100, 0, 3, 0).unwrap();
        assert_eq!(layout.total_len(), layout.base_len());
        assert!(!layout.has_extra());
    }

    #[test]
    fn test_slot_regions_are_disjoint() {
        let layout = RingChannelLayout::new(10, 6, 3, 2).unwrap();
        for i in 0..2 {
            assert_eq!(layout.payload(i) + 10, layout.payload(i + 1));
            assert_eq!(layout.meta(i) + 6, layout.meta(i + 1));
            assert_eq!(layout.extra(i) + 2, layout.extra(i + 1));
        }
        assert!(layout.payload(2) + 10 <= layout.meta_length_cell(0));
        assert!(layout.meta(2) + 6 <= layout.extra_size_offset);
    }

    #[test]
    fn test_rejects_degenerate_sizes() {
        assert!(matches!(
            RingChannelLayout::new(0, 0, 4, 0),
            Err(ServiceError::InvalidParameter(_))
        ));
        assert!(matches!(
            RingChannelLayout::new(16, 0, 0, 0),
            Err(ServiceError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_mark_roundtrip() {
        for mark in [
            ChannelMark::Normal,
            ChannelMark::Reset,
            ChannelMark::Terminate,
        ] {
            assert_eq!(ChannelMark::from_raw(mark as u32), Some(mark));
        }
        assert_eq!(ChannelMark::from_raw(7), None);
    }
}
