// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Per-port sticky event storage.
//!
//! A fixed slot array indexed by [`EventKind::sticky_slot`]. Each slot holds
//! a `pending` and an `active` value. Source ports are authoritative and
//! store straight into `active`; events pushed toward a sink land in
//! `pending` and are promoted to `active` only after the sink's handler
//! accepted them - lazily, right before the next packet is processed.

use super::event::{Event, EventKind, STICKY_SLOT_COUNT};

#[derive(Debug, Default)]
struct StickySlot {
    pending: Option<Event>,
    active: Option<Event>,
}

#[derive(Debug, Default)]
pub(crate) struct StickyStore {
    slots: [StickySlot; STICKY_SLOT_COUNT],
}

impl StickyStore {
    fn slot_of(event: &Event) -> usize {
        event
            .kind()
            .sticky_slot()
            .expect("only sticky events reach the sticky store")
    }

    /// Authoritative store: replaces `active` directly (source side).
    pub fn store_active(&mut self, event: Event) {
        let slot = Self::slot_of(&event);
        self.slots[slot].active = Some(event);
    }

    /// Sink side: park in `pending` until the handler accepts it.
    pub fn store_pending(&mut self, event: Event) {
        let slot = Self::slot_of(&event);
        self.slots[slot].pending = Some(event);
    }

    /// Next pending event in slot (replay) order.
    pub fn next_pending(&self) -> Option<Event> {
        self.slots
            .iter()
            .find_map(|slot| slot.pending.clone())
    }

    /// Move an accepted pending event to `active`.
    pub fn promote(&mut self, kind: EventKind) {
        if let Some(idx) = kind.sticky_slot() {
            let slot = &mut self.slots[idx];
            if let Some(event) = slot.pending.take() {
                slot.active = Some(event);
            }
        }
    }

    pub fn active(&self, kind: EventKind) -> Option<&Event> {
        kind.sticky_slot()
            .and_then(|idx| self.slots[idx].active.as_ref())
    }

    /// Drop both values of a slot (e.g. the terminal marker on flush-stop).
    pub fn clear(&mut self, kind: EventKind) {
        if let Some(idx) = kind.sticky_slot() {
            self.slots[idx] = StickySlot::default();
        }
    }

    pub fn clear_all(&mut self) {
        for slot in &mut self.slots {
            *slot = StickySlot::default();
        }
    }

    /// Active events in slot order. This is the set a fresh link copies
    /// into the sink's pending slots.
    pub fn iter_active(&self) -> impl Iterator<Item = &Event> {
        self.slots.iter().filter_map(|slot| slot.active.as_ref())
    }
}
