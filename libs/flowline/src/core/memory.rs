// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Refcounted memory blocks with zero-copy sharing.
//!
//! A [`MemoryBlock`] is a boundable window `[offset, offset + size)` over a
//! refcounted byte store. Cloning the handle bumps the refcount; the bytes
//! are never copied unless [`MemoryBlock::copy`] is called. `share` produces
//! a second window over the same deepest-parent storage, which is what makes
//! zero-copy packet merging possible (see [`MemoryBlock::is_span`]).
//!
//! Mapping follows a packed atomic state machine (map count + access mode)
//! maintained with a CAS retry loop - never under any port lock:
//!
//! - any number of concurrent READ mappings
//! - a WRITE mapping requires an exclusive handle (refcount 1, no parent)
//!   and no live mapping of any kind
//! - a mapping whose mode conflicts with the active one is rejected

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

use super::allocator::Allocator;
use super::error::MemoryError;

bitflags! {
    /// How a mapping wants to access the bytes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

bitflags! {
    /// Per-block flags fixed at construction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MemoryFlags: u32 {
        /// Write mappings always fail, regardless of refcount.
        const READONLY = 1 << 0;
        /// The packet layer must copy instead of sharing this block.
        const NO_SHARE = 1 << 1;
    }
}

// Packed map state: low 16 bits hold the mapping count, bits 16..18 the
// active access mode. Mode bits are only valid while the count is nonzero.
const STATE_COUNT_MASK: u32 = 0xFFFF;
const STATE_MODE_SHIFT: u32 = 16;

/// Raw backing storage for memory blocks.
///
/// Owns one heap allocation and frees it on drop. Byte access goes through
/// [`MemoryBlock`] map guards only; the map state machine is what makes the
/// `Send + Sync` below sound.
pub struct Storage {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

impl Storage {
    /// Allocate `len` zeroed bytes aligned to `align_mask + 1`.
    ///
    /// `align_mask` follows the allocator contract: it is an alignment
    /// *mask*, so 0 means byte alignment, 15 means 16-byte alignment.
    pub fn zeroed(len: usize, align_mask: usize) -> Result<Self, MemoryError> {
        let align = align_mask
            .checked_add(1)
            .filter(|a| a.is_power_of_two())
            .ok_or(MemoryError::BadAlignment(align_mask))?;
        // Zero-size layouts cannot be passed to the global allocator.
        let layout = Layout::from_size_align(len.max(1), align)
            .map_err(|_| MemoryError::Allocation { size: len, align })?;
        // SAFETY: layout has nonzero size by construction.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(MemoryError::Allocation { size: len, align })?;
        Ok(Self { ptr, len, layout })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn base(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        // SAFETY: ptr/layout come from the matching alloc_zeroed call.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// SAFETY: Storage is a plain allocation; all aliasing access to the bytes is
// serialized by the MemoryBlock map state machine (read maps share, write
// maps are exclusive).
unsafe impl Send for Storage {}
unsafe impl Sync for Storage {}

struct MemoryInner {
    storage: Arc<Storage>,
    /// Deepest parent for shared views. `share` always flattens, so this is
    /// at most one level deep.
    parent: Option<MemoryBlock>,
    allocator: Arc<dyn Allocator>,
    flags: MemoryFlags,
    maxsize: usize,
    /// Window start, absolute into the root storage.
    offset: AtomicUsize,
    size: AtomicUsize,
    /// Packed mapping count + access mode, CAS-maintained.
    state: AtomicU32,
}

/// A refcounted, boundable view over raw storage.
///
/// `Clone` is cheap and bumps the refcount. The block is freed when the last
/// handle drops.
#[derive(Clone)]
pub struct MemoryBlock {
    inner: Arc<MemoryInner>,
}

impl MemoryBlock {
    /// Allocate a fresh block through `allocator`.
    ///
    /// The returned window covers the whole allocation and its address is
    /// aligned to `align_mask + 1`.
    pub fn alloc(
        allocator: Arc<dyn Allocator>,
        maxsize: usize,
        align_mask: usize,
    ) -> Result<MemoryBlock, MemoryError> {
        let storage = allocator.alloc_storage(maxsize, align_mask)?;
        debug_assert_eq!(storage.len(), maxsize);
        Ok(MemoryBlock {
            inner: Arc::new(MemoryInner {
                storage: Arc::new(storage),
                parent: None,
                allocator,
                flags: MemoryFlags::empty(),
                maxsize,
                offset: AtomicUsize::new(0),
                size: AtomicUsize::new(maxsize),
                state: AtomicU32::new(0),
            }),
        })
    }

    /// Wrap existing storage. Used by allocators that build blocks from
    /// their own pools; `flags` let them mark the result READONLY/NO_SHARE.
    pub fn from_storage(
        allocator: Arc<dyn Allocator>,
        storage: Storage,
        flags: MemoryFlags,
    ) -> MemoryBlock {
        let maxsize = storage.len();
        MemoryBlock {
            inner: Arc::new(MemoryInner {
                storage: Arc::new(storage),
                parent: None,
                allocator,
                flags,
                maxsize,
                offset: AtomicUsize::new(0),
                size: AtomicUsize::new(maxsize),
                state: AtomicU32::new(0),
            }),
        }
    }

    pub fn maxsize(&self) -> usize {
        self.inner.maxsize
    }

    /// Window start, absolute into the deepest-parent storage.
    pub fn offset(&self) -> usize {
        self.inner.offset.load(Ordering::Acquire)
    }

    pub fn size(&self) -> usize {
        self.inner.size.load(Ordering::Acquire)
    }

    pub fn flags(&self) -> MemoryFlags {
        self.inner.flags
    }

    /// Number of live handles to this block.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// The deepest parent this block is a view of, if it is a shared view.
    pub fn parent(&self) -> Option<MemoryBlock> {
        self.inner.parent.clone()
    }

    /// True when both blocks sit on the same root storage.
    pub fn same_storage(&self, other: &MemoryBlock) -> bool {
        Arc::ptr_eq(&self.inner.storage, &other.inner.storage)
    }

    fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.inner.allocator
    }

    /// A block is exclusively owned when this is the only handle, it is not
    /// a shared view, and it is not READONLY. Only then may it be written.
    pub fn is_writable(&self) -> bool {
        Arc::strong_count(&self.inner) == 1
            && self.inner.parent.is_none()
            && !self.inner.flags.contains(MemoryFlags::READONLY)
    }

    /// Map the window for reading. Any number of read mappings may coexist;
    /// fails with `MappingConflict` while a write mapping is live.
    pub fn map(&self) -> Result<MappedMemory<'_>, MemoryError> {
        self.lock_state(MapFlags::READ)?;
        let (ptr, len) = self.window_ptr();
        Ok(MappedMemory {
            block: self,
            ptr,
            len,
        })
    }

    /// Map the window for writing.
    ///
    /// Requires exclusive ownership (see [`is_writable`](Self::is_writable))
    /// and no live mapping of any kind.
    pub fn map_mut(&self) -> Result<MappedMemoryMut<'_>, MemoryError> {
        if !self.is_writable() {
            return Err(MemoryError::NotWritable);
        }
        self.lock_state(MapFlags::WRITE)?;
        let (ptr, len) = self.window_ptr();
        Ok(MappedMemoryMut {
            block: self,
            ptr: ptr as *mut u8,
            len,
        })
    }

    fn window_ptr(&self) -> (*const u8, usize) {
        let offset = self.offset();
        let size = self.size();
        debug_assert!(offset + size <= self.inner.maxsize);
        // SAFETY: offset + size <= maxsize is enforced on every window
        // mutation, and maxsize == storage.len().
        let ptr = unsafe { self.inner.storage.base().add(offset) };
        (ptr as *const u8, size)
    }

    /// CAS loop acquiring the packed map state for `mode`.
    fn lock_state(&self, mode: MapFlags) -> Result<(), MemoryError> {
        let state = &self.inner.state;
        let mode_bits = mode.bits() << STATE_MODE_SHIFT;
        let mut current = state.load(Ordering::Acquire);
        loop {
            let count = current & STATE_COUNT_MASK;
            let active = current & !STATE_COUNT_MASK;
            if count > 0 && active != mode_bits {
                return Err(MemoryError::MappingConflict);
            }
            if mode.contains(MapFlags::WRITE) && count > 0 {
                // Second writer, or a write over live readers.
                return Err(MemoryError::MappingConflict);
            }
            let next = (count + 1) | mode_bits;
            match state.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    fn unlock_state(&self) {
        let state = &self.inner.state;
        let mut current = state.load(Ordering::Acquire);
        loop {
            let count = current & STATE_COUNT_MASK;
            debug_assert!(count > 0, "unmap without a live mapping");
            // Mode bits clear together with the last mapping.
            let next = if count == 1 { 0 } else { current - 1 };
            match state.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    fn map_count(&self) -> u32 {
        self.inner.state.load(Ordering::Acquire) & STATE_COUNT_MASK
    }

    /// Adjust the window. `offset` is relative to the current window start.
    ///
    /// Requires an exclusive, unmapped handle; the new window is bounds
    /// checked against `maxsize`.
    pub fn resize(&self, offset: isize, size: usize) -> Result<(), MemoryError> {
        if Arc::strong_count(&self.inner) != 1 || self.map_count() != 0 {
            return Err(MemoryError::NotWritable);
        }
        let new_offset = self
            .offset()
            .checked_add_signed(offset)
            .ok_or(MemoryError::OutOfBounds {
                offset: 0,
                size,
                maxsize: self.inner.maxsize,
            })?;
        if new_offset
            .checked_add(size)
            .is_none_or(|end| end > self.inner.maxsize)
        {
            return Err(MemoryError::OutOfBounds {
                offset: new_offset,
                size,
                maxsize: self.inner.maxsize,
            });
        }
        self.inner.offset.store(new_offset, Ordering::Release);
        self.inner.size.store(size, Ordering::Release);
        Ok(())
    }

    /// Share a sub-window without copying.
    ///
    /// `offset` is relative to this block's window; `size` defaults to the
    /// rest of the window. The result references the same deepest-parent
    /// storage and is never independently writable.
    pub fn share(
        &self,
        offset: isize,
        size: Option<usize>,
    ) -> Result<MemoryBlock, MemoryError> {
        let bounds_err = |off: usize, sz: usize| MemoryError::OutOfBounds {
            offset: off,
            size: sz,
            maxsize: self.inner.maxsize,
        };
        let abs_offset = self
            .offset()
            .checked_add_signed(offset)
            .ok_or_else(|| bounds_err(0, 0))?;
        let window_end = self.offset() + self.size();
        let size = match size {
            Some(s) => s,
            None => window_end.saturating_sub(abs_offset),
        };
        if abs_offset + size > self.inner.maxsize {
            return Err(bounds_err(abs_offset, size));
        }
        // Flatten: a share of a share references the ultimate parent.
        let parent = self
            .inner
            .parent
            .clone()
            .unwrap_or_else(|| self.clone());
        Ok(MemoryBlock {
            inner: Arc::new(MemoryInner {
                storage: Arc::clone(&self.inner.storage),
                parent: Some(parent),
                allocator: Arc::clone(&self.inner.allocator),
                flags: self.inner.flags,
                maxsize: self.inner.maxsize,
                offset: AtomicUsize::new(abs_offset),
                size: AtomicUsize::new(size),
                state: AtomicU32::new(0),
            }),
        })
    }

    /// Copy a sub-window into a new, independent, writable block.
    ///
    /// Routed through the allocator; allocators without a specialized copy
    /// get the generic map-read-then-memcpy fallback.
    pub fn copy(&self, offset: isize, size: Option<usize>) -> Result<MemoryBlock, MemoryError> {
        match self.allocator().copy(self, offset, size) {
            Some(result) => result,
            None => generic_copy(self, offset, size),
        }
    }

    /// True iff both blocks share an ultimate parent and `self`'s window
    /// ends exactly where `other`'s begins. Such blocks merge without
    /// copying (see [`span`](Self::span)).
    pub fn is_span(&self, other: &MemoryBlock) -> bool {
        if !Arc::ptr_eq(
            &self.inner.allocator,
            &other.inner.allocator,
        ) {
            return false;
        }
        self.allocator().is_span(self, other)
    }

    /// Merge two contiguous sibling views into one share over their parent.
    /// Returns `None` when [`is_span`](Self::is_span) does not hold.
    pub fn span(&self, other: &MemoryBlock) -> Option<MemoryBlock> {
        if !self.is_span(other) {
            return None;
        }
        let parent = self.inner.parent.clone()?;
        let rel = self.offset() as isize - parent.offset() as isize;
        parent
            .share(rel, Some(self.size() + other.size()))
            .ok()
    }
}

impl std::fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("maxsize", &self.maxsize())
            .field("offset", &self.offset())
            .field("size", &self.size())
            .field("ref_count", &self.ref_count())
            .field("shared", &self.inner.parent.is_some())
            .finish()
    }
}

/// Generic copy fallback: read-map the source window, allocate a fresh
/// block from the same allocator, memcpy.
pub(crate) fn generic_copy(
    block: &MemoryBlock,
    offset: isize,
    size: Option<usize>,
) -> Result<MemoryBlock, MemoryError> {
    let map = block.map()?;
    let start = usize::try_from(offset.max(0)).unwrap_or(0);
    if offset < 0 || start > map.len() {
        return Err(MemoryError::OutOfBounds {
            offset: start,
            size: size.unwrap_or(0),
            maxsize: block.maxsize(),
        });
    }
    let size = size.unwrap_or(map.len() - start);
    let end = start
        .checked_add(size)
        .filter(|&e| e <= map.len())
        .ok_or(MemoryError::OutOfBounds {
            offset: start,
            size,
            maxsize: block.maxsize(),
        })?;
    let copy = MemoryBlock::alloc(Arc::clone(block.allocator()), size, 0)?;
    {
        let mut dst = copy.map_mut()?;
        dst.copy_from_slice(&map[start..end]);
    }
    Ok(copy)
}

/// RAII read mapping. Unmaps on drop.
pub struct MappedMemory<'a> {
    block: &'a MemoryBlock,
    ptr: *const u8,
    len: usize,
}

impl Deref for MappedMemory<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the map state holds a READ lock, so no writer exists for
        // the lifetime of this guard.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl fmt::Debug for MappedMemory<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedMemory").field("len", &self.len).finish()
    }
}

impl Drop for MappedMemory<'_> {
    fn drop(&mut self) {
        self.block.unlock_state();
    }
}

/// RAII write mapping. Exclusive for its whole lifetime; unmaps on drop.
pub struct MappedMemoryMut<'a> {
    block: &'a MemoryBlock,
    ptr: *mut u8,
    len: usize,
}

impl Deref for MappedMemoryMut<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the map state holds the exclusive WRITE lock.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl DerefMut for MappedMemoryMut<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above; &mut self prevents guard aliasing.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl fmt::Debug for MappedMemoryMut<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedMemoryMut").field("len", &self.len).finish()
    }
}

impl Drop for MappedMemoryMut<'_> {
    fn drop(&mut self) {
        self.block.unlock_state();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::allocator::SystemAllocator;

    fn alloc(size: usize) -> MemoryBlock {
        MemoryBlock::alloc(SystemAllocator::shared(), size, 0).unwrap()
    }

    #[test]
    fn test_alloc_window_covers_allocation() {
        let block = alloc(64);
        assert_eq!(block.maxsize(), 64);
        assert_eq!(block.offset(), 0);
        assert_eq!(block.size(), 64);
        assert_eq!(block.ref_count(), 1);
    }

    #[test]
    fn test_alloc_alignment() {
        for mask in [0usize, 1, 3, 15, 63] {
            let block = MemoryBlock::alloc(SystemAllocator::shared(), 32, mask).unwrap();
            let map = block.map().unwrap();
            assert_eq!(map.as_ptr() as usize % (mask + 1), 0, "mask {mask}");
        }
    }

    #[test]
    fn test_bad_alignment_mask_rejected() {
        // mask + 1 must be a power of two; 2 + 1 = 3 is not.
        let err = MemoryBlock::alloc(SystemAllocator::shared(), 32, 2).unwrap_err();
        assert!(matches!(err, MemoryError::BadAlignment(2)));
    }

    #[test]
    fn test_concurrent_read_maps() {
        let block = alloc(16);
        let a = block.map().unwrap();
        let b = block.map().unwrap();
        assert_eq!(a.len(), 16);
        assert_eq!(b.len(), 16);
    }

    #[test]
    fn test_write_map_requires_exclusive_refcount() {
        let block = alloc(16);
        let extra = block.clone();
        assert!(matches!(
            block.map_mut().unwrap_err(),
            MemoryError::NotWritable
        ));
        drop(extra);
        assert!(block.map_mut().is_ok());
    }

    #[test]
    fn test_write_map_conflicts_with_read_map() {
        let block = alloc(16);
        let read = block.map().unwrap();
        assert!(matches!(
            block.map_mut().unwrap_err(),
            MemoryError::MappingConflict
        ));
        drop(read);
        assert!(block.map_mut().is_ok());
    }

    #[test]
    fn test_read_map_conflicts_with_write_map() {
        let block = alloc(16);
        let write = block.map_mut().unwrap();
        assert!(matches!(
            block.map().unwrap_err(),
            MemoryError::MappingConflict
        ));
        drop(write);
        assert!(block.map().is_ok());
    }

    #[test]
    fn test_map_unmap_leaves_window_unchanged() {
        let block = alloc(32);
        block.resize(4, 8).unwrap();
        {
            let _map = block.map().unwrap();
        }
        assert_eq!(block.offset(), 4);
        assert_eq!(block.size(), 8);
    }

    #[test]
    fn test_resize_bounds_checked() {
        let block = alloc(32);
        assert!(block.resize(0, 32).is_ok());
        assert!(matches!(
            block.resize(0, 33).unwrap_err(),
            MemoryError::OutOfBounds { .. }
        ));
        assert!(block.resize(16, 16).is_ok());
        assert_eq!(block.offset(), 16);
        assert!(matches!(
            block.resize(1, 16).unwrap_err(),
            MemoryError::OutOfBounds { .. }
        ));
    }

    #[test]
    fn test_resize_requires_unmapped_exclusive() {
        let block = alloc(32);
        let map = block.map().unwrap();
        assert!(matches!(
            block.resize(0, 16).unwrap_err(),
            MemoryError::NotWritable
        ));
        drop(map);
        assert!(block.resize(0, 16).is_ok());
    }

    #[test]
    fn test_share_is_not_writable() {
        let block = alloc(64);
        let shared = block.share(0, Some(16)).unwrap();
        assert!(!shared.is_writable());
        assert!(matches!(
            shared.map_mut().unwrap_err(),
            MemoryError::NotWritable
        ));
        assert!(shared.map().is_ok());
    }

    #[test]
    fn test_share_windows_and_spans() {
        let block = alloc(64);
        let a = block.share(4, Some(4)).unwrap();
        let b = block.share(8, Some(4)).unwrap();
        assert_eq!(a.offset(), 4);
        assert_eq!(b.offset(), 8);
        assert!(a.is_span(&b));
        assert!(!b.is_span(&a));

        let gap = block.share(16, Some(4)).unwrap();
        assert!(!a.is_span(&gap));
    }

    #[test]
    fn test_share_of_share_flattens_to_root() {
        let block = alloc(64);
        let mid = block.share(8, Some(32)).unwrap();
        let leaf = mid.share(4, Some(8)).unwrap();
        assert_eq!(leaf.offset(), 12);
        assert!(Arc::ptr_eq(
            &leaf.parent().unwrap().inner,
            &block.inner
        ));
    }

    #[test]
    fn test_span_merge_no_copy() {
        let block = alloc(64);
        let a = block.share(0, Some(32)).unwrap();
        let b = block.share(32, Some(32)).unwrap();
        let merged = a.span(&b).unwrap();
        assert_eq!(merged.offset(), 0);
        assert_eq!(merged.size(), 64);
        assert!(merged.same_storage(&block));
    }

    #[test]
    fn test_copy_is_independent_and_writable() {
        let block = alloc(8);
        {
            let mut map = block.map_mut().unwrap();
            map.copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        }
        let copy = block.copy(2, Some(4)).unwrap();
        assert!(!copy.same_storage(&block));
        assert!(copy.is_writable());
        assert_eq!(&*copy.map().unwrap(), &[3, 4, 5, 6]);
    }

    #[test]
    fn test_share_out_of_bounds() {
        let block = alloc(16);
        assert!(matches!(
            block.share(8, Some(16)).unwrap_err(),
            MemoryError::OutOfBounds { .. }
        ));
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let block = alloc(4);
        {
            let mut map = block.map_mut().unwrap();
            map[0] = 0xAA;
            map[3] = 0x55;
        }
        let map = block.map().unwrap();
        assert_eq!(map[0], 0xAA);
        assert_eq!(map[1], 0);
        assert_eq!(map[3], 0x55);
    }
}
