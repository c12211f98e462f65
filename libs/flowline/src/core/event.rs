// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Events: notifications that travel through ports alongside packets.
//!
//! Sticky events carry stream state (identity, format, segment, terminal
//! marker). They stay "active" on a port until replaced and are guaranteed
//! to be observed by a consumer before any later packet. Non-sticky events
//! (flushes, reconfigure, custom) cross the link immediately.

use std::sync::atomic::{AtomicU32, Ordering};

use super::format::FormatSet;

/// Fixed number of sticky slots per port; see [`EventKind::sticky_slot`].
pub const STICKY_SLOT_COUNT: usize = 4;

/// Which way an event may travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDirection {
    Downstream,
    Upstream,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    StreamStart,
    Format,
    Segment,
    Eos,
    FlushStart,
    FlushStop,
    Reconfigure,
    Custom,
}

impl EventKind {
    pub fn is_sticky(self) -> bool {
        self.sticky_slot().is_some()
    }

    /// Slot index in a port's sticky store. Slot order is replay order:
    /// stream identity first, terminal marker last.
    pub fn sticky_slot(self) -> Option<usize> {
        match self {
            EventKind::StreamStart => Some(0),
            EventKind::Format => Some(1),
            EventKind::Segment => Some(2),
            EventKind::Eos => Some(3),
            _ => None,
        }
    }
}

/// Event payload.
#[derive(Debug, Clone)]
pub enum EventData {
    StreamStart {
        stream_id: String,
    },
    Format(FormatSet),
    /// The positional event. `base` is shifted by the sum of both ports'
    /// configured offsets when the event crosses a link.
    Segment {
        base: i64,
        start: i64,
        stop: Option<i64>,
    },
    Eos,
    FlushStart,
    FlushStop {
        /// Reset running time; also clears a stored terminal marker.
        reset_time: bool,
    },
    Reconfigure,
    Custom {
        upstream: bool,
        name: String,
    },
}

/// An event plus its sequence number.
///
/// Seqnums come from one process-wide counter and exist for log
/// correlation; the engine never branches on them.
#[derive(Debug, Clone)]
pub struct Event {
    seqnum: u32,
    data: EventData,
}

static NEXT_SEQNUM: AtomicU32 = AtomicU32::new(1);

impl Event {
    pub fn new(data: EventData) -> Self {
        Event {
            seqnum: NEXT_SEQNUM.fetch_add(1, Ordering::Relaxed),
            data,
        }
    }

    pub fn stream_start(stream_id: impl Into<String>) -> Self {
        Event::new(EventData::StreamStart {
            stream_id: stream_id.into(),
        })
    }

    pub fn format(formats: FormatSet) -> Self {
        Event::new(EventData::Format(formats))
    }

    pub fn segment(base: i64, start: i64, stop: Option<i64>) -> Self {
        Event::new(EventData::Segment { base, start, stop })
    }

    pub fn eos() -> Self {
        Event::new(EventData::Eos)
    }

    pub fn flush_start() -> Self {
        Event::new(EventData::FlushStart)
    }

    pub fn flush_stop(reset_time: bool) -> Self {
        Event::new(EventData::FlushStop { reset_time })
    }

    pub fn reconfigure() -> Self {
        Event::new(EventData::Reconfigure)
    }

    pub fn custom(upstream: bool, name: impl Into<String>) -> Self {
        Event::new(EventData::Custom {
            upstream,
            name: name.into(),
        })
    }

    pub fn seqnum(&self) -> u32 {
        self.seqnum
    }

    pub fn data(&self) -> &EventData {
        &self.data
    }

    pub fn kind(&self) -> EventKind {
        match self.data {
            EventData::StreamStart { .. } => EventKind::StreamStart,
            EventData::Format(_) => EventKind::Format,
            EventData::Segment { .. } => EventKind::Segment,
            EventData::Eos => EventKind::Eos,
            EventData::FlushStart => EventKind::FlushStart,
            EventData::FlushStop { .. } => EventKind::FlushStop,
            EventData::Reconfigure => EventKind::Reconfigure,
            EventData::Custom { .. } => EventKind::Custom,
        }
    }

    pub fn is_sticky(&self) -> bool {
        self.kind().is_sticky()
    }

    pub fn direction(&self) -> EventDirection {
        match &self.data {
            EventData::StreamStart { .. }
            | EventData::Format(_)
            | EventData::Segment { .. }
            | EventData::Eos => EventDirection::Downstream,
            EventData::FlushStart | EventData::FlushStop { .. } => EventDirection::Both,
            EventData::Reconfigure => EventDirection::Upstream,
            EventData::Custom { upstream, .. } => {
                if *upstream {
                    EventDirection::Upstream
                } else {
                    EventDirection::Downstream
                }
            }
        }
    }

    /// Shift the positional base by `offset`. No-op for everything else.
    pub(crate) fn shift_base(mut self, offset: i64) -> Event {
        if offset != 0 {
            if let EventData::Segment { base, .. } = &mut self.data {
                *base += offset;
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seqnums_are_monotonic() {
        let a = Event::eos();
        let b = Event::eos();
        assert!(b.seqnum() > a.seqnum());
    }

    #[test]
    fn test_sticky_slot_order() {
        // Replay order: identity, format, segment, terminal marker.
        assert_eq!(EventKind::StreamStart.sticky_slot(), Some(0));
        assert_eq!(EventKind::Format.sticky_slot(), Some(1));
        assert_eq!(EventKind::Segment.sticky_slot(), Some(2));
        assert_eq!(EventKind::Eos.sticky_slot(), Some(3));
        assert_eq!(EventKind::FlushStart.sticky_slot(), None);
        assert_eq!(EventKind::FlushStop.sticky_slot(), None);
    }

    #[test]
    fn test_directions() {
        assert_eq!(Event::eos().direction(), EventDirection::Downstream);
        assert_eq!(Event::flush_start().direction(), EventDirection::Both);
        assert_eq!(Event::reconfigure().direction(), EventDirection::Upstream);
        assert_eq!(
            Event::custom(true, "latency-probe").direction(),
            EventDirection::Upstream
        );
    }

    #[test]
    fn test_shift_base_only_touches_segments() {
        let segment = Event::segment(100, 0, None).shift_base(25);
        match segment.data() {
            EventData::Segment { base, .. } => assert_eq!(*base, 125),
            _ => panic!("expected segment"),
        }

        let eos = Event::eos().shift_base(25);
        assert!(matches!(eos.data(), EventData::Eos));
    }
}
