// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Probe types: per-port observers over data, events and queries.
//!
//! A probe is a callback plus a capability mask. The mask has two axes:
//! what crosses the port (packets, lists, events by direction, queries by
//! direction) and how the probe participates (ordinary pre-flight pass,
//! BLOCKING, or IDLE). Dispatch itself lives in `port.rs`, next to the
//! locks it needs; this module owns the types and the matching rules.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

use super::event::Event;
use super::packet::{Packet, PacketList};
use super::port::Port;
use super::query::Query;

bitflags! {
    /// What a probe observes and how.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProbeMask: u32 {
        // Data axis.
        const PACKET = 1 << 0;
        const PACKET_LIST = 1 << 1;
        const EVENT_DOWNSTREAM = 1 << 2;
        const EVENT_UPSTREAM = 1 << 3;
        const QUERY_DOWNSTREAM = 1 << 4;
        const QUERY_UPSTREAM = 1 << 5;

        // Phase axis.
        /// Participate in the blocking pre-flight pass; an installed
        /// blocking probe holds the data path until removed or passing.
        const BLOCKING = 1 << 8;
        /// Fire when the port has no operation in flight.
        const IDLE = 1 << 9;

        const ALL_DATA = Self::PACKET.bits() | Self::PACKET_LIST.bits();
        const ALL_EVENTS = Self::EVENT_DOWNSTREAM.bits() | Self::EVENT_UPSTREAM.bits();
        const ALL_QUERIES = Self::QUERY_DOWNSTREAM.bits() | Self::QUERY_UPSTREAM.bits();
    }
}

const DATA_AXIS: u32 = 0x3F;

/// What a probe callback tells the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeReturn {
    /// No opinion; for a blocking probe this keeps the port blocked.
    Ok,
    /// Consume the item. The caller sees success. Wins over `Pass`.
    Drop,
    /// Stop blocking for this item and let it continue.
    Pass,
    /// The probe took care of the item itself; report success without
    /// running remaining probes or the peer.
    Handled,
    /// Remove this probe after the callback returns.
    Remove,
}

/// Identifier returned by `add_probe`, used to remove the probe again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProbeId(u64);

impl ProbeId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// The thing currently crossing the port, as seen by a probe.
#[derive(Debug)]
pub enum ProbeData<'a> {
    Packet(&'a Packet),
    PacketList(&'a PacketList),
    Event(&'a Event),
    Query(&'a mut Query),
    /// Pre-pull and idle dispatches carry no payload.
    None,
}

/// Everything handed to a probe callback.
pub struct ProbeInfo<'a, 'b> {
    pub id: ProbeId,
    /// Mask of the dispatch that triggered this callback.
    pub mask: ProbeMask,
    pub data: &'a mut ProbeData<'b>,
}

pub(crate) type ProbeCallback = dyn Fn(&Port, &mut ProbeInfo<'_, '_>) -> ProbeReturn + Send + Sync;

pub(crate) struct ProbeEntry {
    pub id: ProbeId,
    pub mask: ProbeMask,
    /// Last dispatch cookie this entry ran under; guards against double
    /// invocation when the list changes mid-dispatch.
    pub cookie: u64,
    pub callback: Arc<ProbeCallback>,
}

impl ProbeEntry {
    pub fn is_blocking(&self) -> bool {
        self.mask.contains(ProbeMask::BLOCKING)
    }

    /// Whether this entry participates in a dispatch with mask `dispatch`.
    ///
    /// IDLE dispatches match every IDLE entry. Data dispatches need an
    /// overlap on the data axis and agreement on the BLOCKING phase, so a
    /// blocking probe never also runs in the ordinary pass.
    pub fn matches(&self, dispatch: ProbeMask) -> bool {
        if dispatch.contains(ProbeMask::IDLE) {
            return self.mask.contains(ProbeMask::IDLE);
        }
        if self.mask.contains(ProbeMask::IDLE) {
            return false;
        }
        if (self.mask.bits() & dispatch.bits() & DATA_AXIS) == 0 {
            return false;
        }
        self.is_blocking() == dispatch.contains(ProbeMask::BLOCKING)
    }
}

impl std::fmt::Debug for ProbeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeEntry")
            .field("id", &self.id)
            .field("mask", &self.mask)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(mask: ProbeMask) -> ProbeEntry {
        ProbeEntry {
            id: ProbeId::next(),
            mask,
            cookie: 0,
            callback: Arc::new(|_, _| ProbeReturn::Ok),
        }
    }

    #[test]
    fn test_data_axis_overlap() {
        let e = entry(ProbeMask::PACKET);
        assert!(e.matches(ProbeMask::PACKET));
        assert!(!e.matches(ProbeMask::PACKET_LIST));
        assert!(!e.matches(ProbeMask::EVENT_DOWNSTREAM));
    }

    #[test]
    fn test_blocking_phase_must_agree() {
        let blocking = entry(ProbeMask::PACKET | ProbeMask::BLOCKING);
        assert!(blocking.matches(ProbeMask::PACKET | ProbeMask::BLOCKING));
        assert!(!blocking.matches(ProbeMask::PACKET));

        let plain = entry(ProbeMask::PACKET);
        assert!(!plain.matches(ProbeMask::PACKET | ProbeMask::BLOCKING));
    }

    #[test]
    fn test_idle_entries_only_match_idle_dispatch() {
        let idle = entry(ProbeMask::IDLE);
        assert!(idle.matches(ProbeMask::IDLE));
        assert!(!idle.matches(ProbeMask::PACKET));

        let plain = entry(ProbeMask::PACKET);
        assert!(!plain.matches(ProbeMask::IDLE));
    }

    #[test]
    fn test_probe_ids_are_unique() {
        let a = ProbeId::next();
        let b = ProbeId::next();
        assert_ne!(a, b);
    }
}
