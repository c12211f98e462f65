// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Packets: the unit of streamed payload.
//!
//! A [`Packet`] is a refcounted, ordered list of [`MemoryBlock`]s plus a
//! little timing metadata. Cloning a packet bumps its refcount and shares
//! the blocks; structural mutation goes copy-on-write on the *list* only -
//! the blocks themselves are never duplicated by a metadata edit.

use std::sync::Arc;

use bitflags::bitflags;

use super::error::MemoryError;
use super::memory::{MemoryBlock, MemoryFlags};

bitflags! {
    /// Packet-level flags carried alongside the payload.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PacketFlags: u32 {
        /// The packet follows a discontinuity (seek, stream switch).
        const DISCONT = 1 << 0;
        /// Codec setup data rather than media payload.
        const HEADER = 1 << 1;
        /// Synthesized filler, safe to drop on a tight schedule.
        const GAP = 1 << 2;
    }
}

#[derive(Debug, Clone, Default)]
struct PacketInner {
    blocks: Vec<MemoryBlock>,
    pts: Option<i64>,
    duration: Option<i64>,
    flags: PacketFlags,
}

/// A refcounted unit of streamed payload backed by one or more memory
/// blocks.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    inner: Arc<PacketInner>,
}

impl Packet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_blocks(blocks: Vec<MemoryBlock>) -> Self {
        Packet {
            inner: Arc::new(PacketInner {
                blocks,
                ..PacketInner::default()
            }),
        }
    }

    /// Number of live handles to this packet.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn n_blocks(&self) -> usize {
        self.inner.blocks.len()
    }

    pub fn block(&self, idx: usize) -> Option<&MemoryBlock> {
        self.inner.blocks.get(idx)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &MemoryBlock> {
        self.inner.blocks.iter()
    }

    /// Total payload size: the sum of all block window sizes.
    pub fn size(&self) -> usize {
        self.inner.blocks.iter().map(MemoryBlock::size).sum()
    }

    pub fn pts(&self) -> Option<i64> {
        self.inner.pts
    }

    pub fn duration(&self) -> Option<i64> {
        self.inner.duration
    }

    pub fn flags(&self) -> PacketFlags {
        self.inner.flags
    }

    /// Copy-on-write access to the inner struct. Clones the block *list*
    /// (cheap handle clones) when other packet handles exist.
    fn make_mut(&mut self) -> &mut PacketInner {
        Arc::make_mut(&mut self.inner)
    }

    pub fn set_pts(&mut self, pts: Option<i64>) {
        self.make_mut().pts = pts;
    }

    pub fn set_duration(&mut self, duration: Option<i64>) {
        self.make_mut().duration = duration;
    }

    pub fn set_flags(&mut self, flags: PacketFlags) {
        self.make_mut().flags = flags;
    }

    /// Append a block. Blocks marked NO_SHARE are copied instead of shared
    /// so the packet never pins such a block's storage.
    pub fn append(&mut self, block: MemoryBlock) -> Result<(), MemoryError> {
        let block = if block.flags().contains(MemoryFlags::NO_SHARE) {
            block.copy(0, None)?
        } else {
            block
        };
        self.make_mut().blocks.push(block);
        Ok(())
    }

    pub fn remove_block(&mut self, idx: usize) -> Option<MemoryBlock> {
        let inner = self.make_mut();
        if idx < inner.blocks.len() {
            Some(inner.blocks.remove(idx))
        } else {
            None
        }
    }

    /// Collapse adjacent blocks that are contiguous views of one parent
    /// into a single share of that parent. No bytes are copied.
    pub fn merge_spans(&mut self) {
        let inner = self.make_mut();
        let mut merged: Vec<MemoryBlock> = Vec::with_capacity(inner.blocks.len());
        for block in inner.blocks.drain(..) {
            match merged.last().and_then(|prev| prev.span(&block)) {
                Some(span) => {
                    *merged.last_mut().expect("last exists when span matched") = span;
                }
                None => merged.push(block),
            }
        }
        inner.blocks = merged;
    }

    /// Read the whole payload into one contiguous vector. Copies; meant for
    /// consumers that need flat bytes (and for tests).
    pub fn to_vec(&self) -> Result<Vec<u8>, MemoryError> {
        let mut out = Vec::with_capacity(self.size());
        for block in &self.inner.blocks {
            let map = block.map()?;
            out.extend_from_slice(&map);
        }
        Ok(out)
    }
}

/// An ordered group of packets, pushed as one unit.
///
/// Sinks without a dedicated list handler receive the packets one by one
/// through their ordinary chain entry.
#[derive(Debug, Clone, Default)]
pub struct PacketList {
    packets: Vec<Packet>,
}

impl PacketList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, packet: Packet) {
        self.packets.push(packet);
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Packet> {
        self.packets.iter()
    }
}

impl IntoIterator for PacketList {
    type Item = Packet;
    type IntoIter = std::vec::IntoIter<Packet>;

    fn into_iter(self) -> Self::IntoIter {
        self.packets.into_iter()
    }
}

impl FromIterator<Packet> for PacketList {
    fn from_iter<T: IntoIterator<Item = Packet>>(iter: T) -> Self {
        PacketList {
            packets: iter.into_iter().collect(),
        }
    }
}
