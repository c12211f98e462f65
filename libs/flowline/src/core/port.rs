// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Stream ports: directional connection endpoints between two processing
//! components.
//!
//! A port moves packets and events to its peer under push or pull
//! scheduling, carries stream state in sticky events, and lets probes
//! observe, block, or drop whatever crosses it.
//!
//! # Locking
//!
//! Every port owns two locks:
//!
//! - the **object lock** (non-reentrant) protects bookkeeping: peer, mode,
//!   flushing flag, sticky slots, probe list, in-flight counter. It is
//!   always released before user code runs or a notification fires.
//! - the **stream lock** (reentrant) serializes all calls into the port's
//!   installed handler, so a handler may call back into its own port. Two
//!   pushes from different upstreams into one sink serialize here; there is
//!   no ordering guarantee between them beyond that.
//!
//! Flushing is the sole cancellation primitive: level-triggered, it fails
//! data operations fast and wakes any thread suspended in a blocking probe.

use std::sync::{Arc, Weak};

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex, ReentrantMutex, RwLock};
use tracing::{debug, trace, warn};

use super::error::{FlowError, FlowResult, FlowSuccess, LinkError, FLOW_PULL_DROPPED};
use super::event::{Event, EventDirection, EventKind};
use super::format::FormatSet;
use super::packet::{Packet, PacketList};
use super::probe::{ProbeData, ProbeEntry, ProbeId, ProbeInfo, ProbeMask, ProbeReturn};
use super::query::Query;
use super::sticky::StickyStore;

/// Fixed at construction; a port never changes direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Source,
    Sink,
}

/// How a port is scheduled. `Push` means upstream drives, `Pull` means
/// downstream drives (usually via a [`Task`](crate::core::Task)).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortMode {
    Inactive,
    Push,
    Pull,
}

bitflags! {
    /// Which optional validations `link_with` performs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LinkCheck: u32 {
        /// Both ports' owners must share an ancestor.
        const HIERARCHY = 1 << 0;
        /// Both ports' format sets must intersect.
        const FORMATS = 1 << 1;

        const DEFAULT = Self::HIERARCHY.bits() | Self::FORMATS.bits();
    }
}

/// The component a port belongs to. Only the ancestor chain is ever
/// consulted, for the hierarchy link check.
pub trait PortOwner: Send + Sync {
    fn name(&self) -> &str;
    fn parent(&self) -> Option<Arc<dyn PortOwner>>;
}

/// The function set a port's owner installs.
///
/// All methods have defaults so an owner only implements what its
/// direction needs: `chain` for sinks, `get_range` for pull sources.
/// Handlers run with no port lock held except the port's own stream lock,
/// so they may call back into the same port. The `link`/`unlink` hooks run
/// outside the object locks as well and must not link/unlink ports
/// themselves.
pub trait PortHandler: Send + Sync {
    /// Activate or shut down the port. The default activates push mode.
    fn activate(&self, port: &Port, active: bool) -> bool {
        port.activate_mode(PortMode::Push, active)
    }

    /// Switch a specific scheduling mode on or off.
    fn activate_mode(&self, _port: &Port, _mode: PortMode, _active: bool) -> bool {
        true
    }

    /// Handle an event; consumes it. The default forwards through
    /// [`internal_links`](Self::internal_links) and accepts when there are
    /// none.
    fn event(&self, port: &Port, event: Event) -> bool {
        let links = self.internal_links(port);
        if links.is_empty() {
            return true;
        }
        let mut ok = true;
        for link in links {
            let forwarded = match (event.direction(), link.direction()) {
                (EventDirection::Downstream | EventDirection::Both, PortDirection::Source) => {
                    link.push_event(event.clone())
                }
                (EventDirection::Upstream | EventDirection::Both, PortDirection::Sink) => {
                    link.send_event(event.clone())
                }
                _ => continue,
            };
            ok &= forwarded;
        }
        ok
    }

    /// Answer a query in place. The default fans out over
    /// [`internal_links`](Self::internal_links); with none, it answers a
    /// formats query with "anything" and refuses the rest.
    fn query(&self, port: &Port, query: &mut Query) -> bool {
        let links = self.internal_links(port);
        if links.is_empty() {
            if let Query::Formats { filter, result } = query {
                *result = Some(filter.clone().unwrap_or(FormatSet::Any));
                return true;
            }
            return false;
        }
        links.iter().any(|link| link.peer_query(query))
    }

    /// Sink data entry point; consumes the packet.
    fn chain(&self, port: &Port, _packet: Packet) -> FlowResult {
        warn!(port = %port.name(), "chain called on a port with no chain handler installed");
        Err(FlowError::NotSupported)
    }

    /// Sink list entry point. The default feeds packets one by one into
    /// [`chain`](Self::chain), stopping at the first failure.
    fn chain_list(&self, port: &Port, list: PacketList) -> FlowResult {
        let mut ret = Ok(FlowSuccess::Ok);
        for packet in list {
            ret = self.chain(port, packet);
            if ret.is_err() {
                return ret;
            }
        }
        ret
    }

    /// Source data entry point for pull scheduling.
    fn get_range(&self, port: &Port, _offset: u64, _size: usize) -> Result<Packet, FlowError> {
        warn!(port = %port.name(), "get_range called on a port with no get_range handler installed");
        Err(FlowError::NotSupported)
    }

    /// Veto hook for linking.
    fn link(&self, _port: &Port, _peer: &Port) -> Result<(), LinkError> {
        Ok(())
    }

    fn unlink(&self, _port: &Port) {}

    /// Ports inside the same component this port forwards to; drives the
    /// default event and query fan-out.
    fn internal_links(&self, _port: &Port) -> Vec<Port> {
        Vec::new()
    }
}

/// Handler installed on freshly created ports.
struct DefaultHandler;

impl PortHandler for DefaultHandler {}

struct PortState {
    peer: Option<Weak<PortInner>>,
    mode: PortMode,
    flushing: bool,
    /// Signed shift applied to positional events crossing this port.
    offset: i64,
    sticky: StickyStore,
    /// Set when a sticky slot holds a pending event; cleared once replay
    /// drains them all.
    events_pending: bool,
    probes: Vec<ProbeEntry>,
    /// Per-dispatch cookie source; each entry records the cookie it last
    /// ran under so it is invoked at most once per dispatch.
    probe_cookie: u64,
    /// Bumped on every probe add/remove; a change mid-dispatch means the
    /// scan must pick up new hooks.
    list_cookie: u64,
    /// Installed blocking probes. Nonzero means the data path may suspend.
    n_blocking: usize,
    in_flight: usize,
    idle_pending: bool,
}

struct PortInner {
    name: String,
    direction: PortDirection,
    state: Mutex<PortState>,
    /// Paired with `state`; wakes threads suspended in blocking probes.
    cond: Condvar,
    /// Serializes all calls into the installed handler. Reentrant so a
    /// handler may call back into its own port.
    stream_lock: ReentrantMutex<()>,
    handler: RwLock<Arc<dyn PortHandler>>,
    owner: RwLock<Option<Weak<dyn PortOwner>>>,
}

impl Drop for PortInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.peer.is_some() {
            warn!(port = %self.name, "port dropped while still linked");
        }
    }
}

/// Outcome of a probe dispatch, aggregated over all matching probes.
enum ProbeVerdict {
    Continue,
    Dropped,
    Handled,
    Abort(FlowError),
}

enum FlowData {
    Packet(Packet),
    List(PacketList),
}

/// A directional stream endpoint. Cheap to clone; clones are handles to
/// the same port.
#[derive(Clone)]
pub struct Port {
    inner: Arc<PortInner>,
}

impl PartialEq for Port {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Port {}

impl Port {
    pub fn new(name: impl Into<String>, direction: PortDirection) -> Self {
        Self::with_handler(name, direction, Arc::new(DefaultHandler))
    }

    pub fn with_handler(
        name: impl Into<String>,
        direction: PortDirection,
        handler: Arc<dyn PortHandler>,
    ) -> Self {
        Port {
            inner: Arc::new(PortInner {
                name: name.into(),
                direction,
                state: Mutex::new(PortState {
                    peer: None,
                    mode: PortMode::Inactive,
                    flushing: false,
                    offset: 0,
                    sticky: StickyStore::default(),
                    events_pending: false,
                    probes: Vec::new(),
                    probe_cookie: 0,
                    list_cookie: 0,
                    n_blocking: 0,
                    in_flight: 0,
                    idle_pending: false,
                }),
                cond: Condvar::new(),
                stream_lock: ReentrantMutex::new(()),
                handler: RwLock::new(handler),
                owner: RwLock::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn direction(&self) -> PortDirection {
        self.inner.direction
    }

    pub fn mode(&self) -> PortMode {
        self.inner.state.lock().mode
    }

    pub fn is_flushing(&self) -> bool {
        self.inner.state.lock().flushing
    }

    /// True while blocking probes are installed.
    pub fn is_blocked(&self) -> bool {
        self.inner.state.lock().n_blocking > 0
    }

    pub fn offset(&self) -> i64 {
        self.inner.state.lock().offset
    }

    pub fn set_offset(&self, offset: i64) {
        self.inner.state.lock().offset = offset;
    }

    /// Hold the stream lock from outside a handler. Task workers take this
    /// around each iteration to serialize with push/pull into the port.
    pub(crate) fn lock_stream(&self) -> parking_lot::ReentrantMutexGuard<'_, ()> {
        self.inner.stream_lock.lock()
    }

    pub fn set_handler(&self, handler: Arc<dyn PortHandler>) {
        *self.inner.handler.write() = handler;
    }

    fn handler(&self) -> Arc<dyn PortHandler> {
        Arc::clone(&self.inner.handler.read())
    }

    pub fn set_owner(&self, owner: &Arc<dyn PortOwner>) {
        *self.inner.owner.write() = Some(Arc::downgrade(owner));
    }

    fn owner(&self) -> Option<Arc<dyn PortOwner>> {
        self.inner.owner.read().as_ref().and_then(Weak::upgrade)
    }

    pub fn peer(&self) -> Option<Port> {
        self.inner
            .state
            .lock()
            .peer
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| Port { inner })
    }

    pub fn is_linked(&self) -> bool {
        self.peer().is_some()
    }

    /// Latest active sticky event of `kind`, if any.
    pub fn sticky_event(&self, kind: EventKind) -> Option<Event> {
        self.inner.state.lock().sticky.active(kind).cloned()
    }

    // ------------------------------------------------------------------
    // Linking
    // ------------------------------------------------------------------

    /// Link this source port to a sink port with the default checks.
    pub fn link(&self, sink: &Port) -> Result<(), LinkError> {
        self.link_with(sink, LinkCheck::DEFAULT)
    }

    /// Link with explicit checks. Validation order: direction, existing
    /// peer, hierarchy, formats, handler veto hooks, then the peer
    /// transition itself. No failure path mutates either port.
    pub fn link_with(&self, sink: &Port, checks: LinkCheck) -> Result<(), LinkError> {
        if self.direction() != PortDirection::Source || sink.direction() != PortDirection::Sink {
            return Err(LinkError::WrongDirection);
        }
        // Refuse a re-link up front: an already-linked pair must never
        // observe the veto hooks below.
        {
            let src_state = self.inner.state.lock();
            if src_state.peer.is_some() {
                return Err(LinkError::WasLinked);
            }
            let sink_state = sink.inner.state.lock();
            if sink_state.peer.is_some() {
                return Err(LinkError::WasLinked);
            }
        }
        if checks.contains(LinkCheck::HIERARCHY) && !self.shares_ancestor(sink) {
            return Err(LinkError::WrongHierarchy);
        }
        if checks.contains(LinkCheck::FORMATS) {
            let src_formats = self.query_formats(None);
            let sink_formats = sink.query_formats(None);
            if !src_formats.intersects(&sink_formats) {
                return Err(LinkError::NoFormat);
            }
        }
        self.handler().link(self, sink)?;
        sink.handler().link(sink, self)?;

        // The transition proper: both object locks, source first. Direction
        // fixes the order globally, so no lock cycle is possible. The peer
        // may have appeared while the hooks ran, so check again.
        let mut src_state = self.inner.state.lock();
        if src_state.peer.is_some() {
            return Err(LinkError::WasLinked);
        }
        let mut sink_state = sink.inner.state.lock();
        if sink_state.peer.is_some() {
            return Err(LinkError::WasLinked);
        }
        src_state.peer = Some(Arc::downgrade(&sink.inner));
        sink_state.peer = Some(Arc::downgrade(&self.inner));

        // The sink needs to observe the source's stream state before any
        // packet: copy active sticky events into its pending slots.
        let shift = src_state.offset + sink_state.offset;
        let mut copied = false;
        for event in src_state.sticky.iter_active() {
            sink_state.sticky.store_pending(event.clone().shift_base(shift));
            copied = true;
        }
        if copied {
            sink_state.events_pending = true;
        }
        drop(sink_state);
        drop(src_state);

        debug!(src = %self.name(), sink = %sink.name(), "ports linked");
        Ok(())
    }

    /// Undo a link. Returns false when the peer relation does not hold.
    pub fn unlink(&self, sink: &Port) -> bool {
        if self.direction() != PortDirection::Source || sink.direction() != PortDirection::Sink {
            return false;
        }
        {
            let mut src_state = self.inner.state.lock();
            let mut sink_state = sink.inner.state.lock();
            let src_peer_ok = src_state
                .peer
                .as_ref()
                .and_then(Weak::upgrade)
                .is_some_and(|p| Arc::ptr_eq(&p, &sink.inner));
            let sink_peer_ok = sink_state
                .peer
                .as_ref()
                .and_then(Weak::upgrade)
                .is_some_and(|p| Arc::ptr_eq(&p, &self.inner));
            if !src_peer_ok || !sink_peer_ok {
                return false;
            }
            src_state.peer = None;
            sink_state.peer = None;
        }
        self.handler().unlink(self);
        sink.handler().unlink(sink);
        debug!(src = %self.name(), sink = %sink.name(), "ports unlinked");
        true
    }

    fn shares_ancestor(&self, other: &Port) -> bool {
        fn ancestors(owner: Arc<dyn PortOwner>) -> Vec<*const ()> {
            let mut chain = Vec::new();
            let mut current = owner.parent();
            while let Some(parent) = current {
                chain.push(Arc::as_ptr(&parent) as *const ());
                current = parent.parent();
            }
            chain
        }

        // Without owners on both sides there is nothing to check.
        let (Some(a), Some(b)) = (self.owner(), other.owner()) else {
            return true;
        };
        let chain_a = ancestors(a);
        ancestors(b).iter().any(|p| chain_a.contains(p))
    }

    /// Ask this port's handler for its format set.
    pub fn query_formats(&self, filter: Option<FormatSet>) -> FormatSet {
        let mut query = Query::formats(filter);
        if self.query(&mut query) {
            if let Query::Formats { result: Some(set), .. } = query {
                return set;
            }
        }
        // An unanswered formats query constrains nothing.
        FormatSet::Any
    }

    // ------------------------------------------------------------------
    // Data flow
    // ------------------------------------------------------------------

    /// Push a packet to the linked peer. Source ports only.
    ///
    /// Consumes the packet on every path; a failing push releases its
    /// ownership exactly once.
    pub fn push(&self, packet: Packet) -> FlowResult {
        assert!(
            self.direction() == PortDirection::Source,
            "push() on sink port {:?} violates the port contract",
            self.name()
        );
        self.push_data(FlowData::Packet(packet))
    }

    /// Push a whole packet list. Sinks without a list handler receive the
    /// packets one by one.
    pub fn push_list(&self, list: PacketList) -> FlowResult {
        assert!(
            self.direction() == PortDirection::Source,
            "push_list() on sink port {:?} violates the port contract",
            self.name()
        );
        self.push_data(FlowData::List(list))
    }

    fn push_data(&self, data: FlowData) -> FlowResult {
        {
            let state = self.inner.state.lock();
            if state.flushing {
                return Err(FlowError::Flushing);
            }
            if state.sticky.active(EventKind::Eos).is_some() {
                return Err(FlowError::Eos);
            }
        }

        let data_mask = match &data {
            FlowData::Packet(_) => ProbeMask::PACKET,
            FlowData::List(_) => ProbeMask::PACKET_LIST,
        };
        {
            let mut probe_data = match &data {
                FlowData::Packet(p) => ProbeData::Packet(p),
                FlowData::List(l) => ProbeData::PacketList(l),
            };
            match self.run_probes(data_mask | ProbeMask::BLOCKING, &mut probe_data) {
                ProbeVerdict::Dropped | ProbeVerdict::Handled => return Ok(FlowSuccess::Ok),
                ProbeVerdict::Abort(err) => return Err(err),
                ProbeVerdict::Continue => {}
            }
            match self.run_probes(data_mask, &mut probe_data) {
                ProbeVerdict::Dropped | ProbeVerdict::Handled => return Ok(FlowSuccess::Ok),
                ProbeVerdict::Abort(err) => return Err(err),
                ProbeVerdict::Continue => {}
            }
        }

        let peer = {
            let mut state = self.inner.state.lock();
            if state.flushing {
                return Err(FlowError::Flushing);
            }
            let Some(peer) = state.peer.as_ref().and_then(Weak::upgrade) else {
                return Err(FlowError::NotLinked);
            };
            state.in_flight += 1;
            Port { inner: peer }
        };

        // User code runs with none of our locks held.
        let ret = match data {
            FlowData::Packet(packet) => peer.chain(packet),
            FlowData::List(list) => peer.chain_list(list),
        };
        self.end_flow();
        ret
    }

    /// Sink data entry point: deliver a packet into this port's handler.
    ///
    /// Callable directly, but normally invoked by the peer's `push`.
    pub fn chain(&self, packet: Packet) -> FlowResult {
        assert!(
            self.direction() == PortDirection::Sink,
            "chain() on source port {:?} violates the port contract",
            self.name()
        );
        self.chain_data(FlowData::Packet(packet))
    }

    pub fn chain_list(&self, list: PacketList) -> FlowResult {
        assert!(
            self.direction() == PortDirection::Sink,
            "chain_list() on source port {:?} violates the port contract",
            self.name()
        );
        self.chain_data(FlowData::List(list))
    }

    fn chain_data(&self, data: FlowData) -> FlowResult {
        // All calls into this port's handler serialize here. Reentrant, so
        // the handler may call back in.
        let _stream = self.inner.stream_lock.lock();

        {
            let state = self.inner.state.lock();
            if state.flushing {
                return Err(FlowError::Flushing);
            }
        }

        // Pending stream state must reach the handler before the packet.
        self.replay_pending_sticky()?;

        {
            let state = self.inner.state.lock();
            if state.sticky.active(EventKind::Eos).is_some() {
                return Err(FlowError::Eos);
            }
        }

        let data_mask = match &data {
            FlowData::Packet(_) => ProbeMask::PACKET,
            FlowData::List(_) => ProbeMask::PACKET_LIST,
        };
        {
            let mut probe_data = match &data {
                FlowData::Packet(p) => ProbeData::Packet(p),
                FlowData::List(l) => ProbeData::PacketList(l),
            };
            match self.run_probes(data_mask | ProbeMask::BLOCKING, &mut probe_data) {
                ProbeVerdict::Dropped | ProbeVerdict::Handled => return Ok(FlowSuccess::Ok),
                ProbeVerdict::Abort(err) => return Err(err),
                ProbeVerdict::Continue => {}
            }
            match self.run_probes(data_mask, &mut probe_data) {
                ProbeVerdict::Dropped | ProbeVerdict::Handled => return Ok(FlowSuccess::Ok),
                ProbeVerdict::Abort(err) => return Err(err),
                ProbeVerdict::Continue => {}
            }
        }

        let handler = self.handler();
        self.begin_flow();
        let ret = match data {
            FlowData::Packet(packet) => handler.chain(self, packet),
            FlowData::List(list) => handler.chain_list(self, list),
        };
        self.end_flow();
        ret
    }

    /// Pull `size` bytes at `offset` from the linked peer. Sink ports only.
    pub fn pull_range(&self, offset: u64, size: usize) -> Result<Packet, FlowError> {
        assert!(
            self.direction() == PortDirection::Sink,
            "pull_range() on source port {:?} violates the port contract",
            self.name()
        );
        let _stream = self.inner.stream_lock.lock();

        {
            let state = self.inner.state.lock();
            if state.flushing {
                return Err(FlowError::Flushing);
            }
            if state.sticky.active(EventKind::Eos).is_some() {
                return Err(FlowError::Eos);
            }
        }

        // Pre-pull pass carries no payload yet; blocking probes can hold
        // the pull here.
        {
            let mut probe_data = ProbeData::None;
            match self.run_probes(ProbeMask::PACKET | ProbeMask::BLOCKING, &mut probe_data) {
                ProbeVerdict::Dropped | ProbeVerdict::Handled => {
                    return Err(FlowError::Custom(FLOW_PULL_DROPPED));
                }
                ProbeVerdict::Abort(err) => return Err(err),
                ProbeVerdict::Continue => {}
            }
        }

        let peer = {
            let mut state = self.inner.state.lock();
            if state.flushing {
                return Err(FlowError::Flushing);
            }
            let Some(peer) = state.peer.as_ref().and_then(Weak::upgrade) else {
                return Err(FlowError::NotLinked);
            };
            state.in_flight += 1;
            Port { inner: peer }
        };

        let ret = peer.get_range(offset, size);
        self.end_flow();
        let packet = ret?;

        // Post-pull pass: probes see the packet that actually arrived. A
        // pull cannot report plain success without a packet, so Drop maps
        // to the reserved custom code.
        {
            let mut probe_data = ProbeData::Packet(&packet);
            match self.run_probes(ProbeMask::PACKET, &mut probe_data) {
                ProbeVerdict::Dropped => return Err(FlowError::Custom(FLOW_PULL_DROPPED)),
                ProbeVerdict::Abort(err) => return Err(err),
                ProbeVerdict::Handled | ProbeVerdict::Continue => {}
            }
        }
        Ok(packet)
    }

    /// Produce a range from this source port's handler. Normally invoked
    /// by the peer's `pull_range`.
    pub fn get_range(&self, offset: u64, size: usize) -> Result<Packet, FlowError> {
        assert!(
            self.direction() == PortDirection::Source,
            "get_range() on sink port {:?} violates the port contract",
            self.name()
        );
        let _stream = self.inner.stream_lock.lock();

        {
            let state = self.inner.state.lock();
            if state.flushing {
                return Err(FlowError::Flushing);
            }
        }
        {
            let mut probe_data = ProbeData::None;
            match self.run_probes(ProbeMask::PACKET | ProbeMask::BLOCKING, &mut probe_data) {
                ProbeVerdict::Dropped | ProbeVerdict::Handled => {
                    return Err(FlowError::Custom(FLOW_PULL_DROPPED));
                }
                ProbeVerdict::Abort(err) => return Err(err),
                ProbeVerdict::Continue => {}
            }
        }

        let handler = self.handler();
        self.begin_flow();
        let ret = handler.get_range(self, offset, size);
        self.end_flow();
        ret
    }

    fn begin_flow(&self) {
        self.inner.state.lock().in_flight += 1;
    }

    fn end_flow(&self) {
        let fire_idle = {
            let mut state = self.inner.state.lock();
            debug_assert!(state.in_flight > 0);
            state.in_flight -= 1;
            let fire = state.in_flight == 0 && state.idle_pending;
            if fire {
                state.idle_pending = false;
            }
            fire
        };
        if fire_idle {
            let mut probe_data = ProbeData::None;
            let _ = self.run_probes(ProbeMask::IDLE, &mut probe_data);
        }
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Send an event downstream. Source ports only; pushing an
    /// upstream-only event here is a contract violation.
    ///
    /// Sticky events are stored on this port as `active` (the source is
    /// authoritative) and parked in the peer's `pending` slots; the peer's
    /// handler observes them right before the next packet. A sticky push
    /// succeeds even while unlinked. Flush events cross immediately.
    pub fn push_event(&self, event: Event) -> bool {
        assert!(
            self.direction() == PortDirection::Source,
            "push_event() on sink port {:?} violates the port contract",
            self.name()
        );
        assert!(
            event.direction() != EventDirection::Upstream,
            "event {:?} pushed against its direction",
            event.kind()
        );

        // Flushes skip the blocking pass: they are the unblock mechanism.
        let is_flush = matches!(
            event.kind(),
            EventKind::FlushStart | EventKind::FlushStop
        );
        {
            let mut probe_data = ProbeData::Event(&event);
            if !is_flush {
                match self.run_probes(
                    ProbeMask::EVENT_DOWNSTREAM | ProbeMask::BLOCKING,
                    &mut probe_data,
                ) {
                    ProbeVerdict::Dropped | ProbeVerdict::Handled => return true,
                    ProbeVerdict::Abort(_) => return false,
                    ProbeVerdict::Continue => {}
                }
            }
            match self.run_probes(ProbeMask::EVENT_DOWNSTREAM, &mut probe_data) {
                ProbeVerdict::Dropped | ProbeVerdict::Handled => return true,
                ProbeVerdict::Abort(_) => return false,
                ProbeVerdict::Continue => {}
            }
        }

        if event.is_sticky() {
            trace!(port = %self.name(), kind = ?event.kind(), seqnum = event.seqnum(),
                "storing sticky event");
            let (peer, src_offset) = {
                let mut state = self.inner.state.lock();
                state.sticky.store_active(event.clone());
                (
                    state.peer.as_ref().and_then(Weak::upgrade),
                    state.offset,
                )
            };
            if let Some(peer) = peer {
                let peer = Port { inner: peer };
                let shift = src_offset + peer.offset();
                peer.receive_event(event.shift_base(shift));
            }
            return true;
        }

        match self.peer() {
            Some(peer) => peer.receive_event(event),
            None => false,
        }
    }

    /// Send an event upstream. Sink ports only.
    pub fn send_event(&self, event: Event) -> bool {
        assert!(
            self.direction() == PortDirection::Sink,
            "send_event() on source port {:?} violates the port contract",
            self.name()
        );
        assert!(
            event.direction() != EventDirection::Downstream,
            "event {:?} sent against its direction",
            event.kind()
        );

        let is_flush = matches!(
            event.kind(),
            EventKind::FlushStart | EventKind::FlushStop
        );
        {
            let mut probe_data = ProbeData::Event(&event);
            if !is_flush {
                match self.run_probes(
                    ProbeMask::EVENT_UPSTREAM | ProbeMask::BLOCKING,
                    &mut probe_data,
                ) {
                    ProbeVerdict::Dropped | ProbeVerdict::Handled => return true,
                    ProbeVerdict::Abort(_) => return false,
                    ProbeVerdict::Continue => {}
                }
            }
            match self.run_probes(ProbeMask::EVENT_UPSTREAM, &mut probe_data) {
                ProbeVerdict::Dropped | ProbeVerdict::Handled => return true,
                ProbeVerdict::Abort(_) => return false,
                ProbeVerdict::Continue => {}
            }
        }

        match self.peer() {
            Some(peer) => peer.receive_event(event),
            None => false,
        }
    }

    /// Event arriving at this port from its peer.
    fn receive_event(&self, event: Event) -> bool {
        match event.kind() {
            EventKind::FlushStart => {
                // Level-triggered: fail-fast for new operations, wake any
                // thread suspended in a blocking probe.
                {
                    let mut state = self.inner.state.lock();
                    state.flushing = true;
                }
                self.inner.cond.notify_all();
                debug!(port = %self.name(), "flush start");
                self.handler().event(self, event)
            }
            EventKind::FlushStop => {
                {
                    let mut state = self.inner.state.lock();
                    state.flushing = false;
                    // A reset clears the stored terminal marker.
                    state.sticky.clear(EventKind::Eos);
                }
                debug!(port = %self.name(), "flush stop");
                // Delivery waits for any in-progress chain/pull; the
                // flush-start above already unblocked it.
                let _stream = self.inner.stream_lock.lock();
                self.handler().event(self, event)
            }
            kind if kind.is_sticky() => {
                let mut state = self.inner.state.lock();
                state.sticky.store_pending(event);
                state.events_pending = true;
                true
            }
            _ => {
                // Serialized events: the handler must never run
                // concurrently with its own chain/pull. Only flush-start
                // may overtake, as the unblock path.
                let _stream = self.inner.stream_lock.lock();
                self.handler().event(self, event)
            }
        }
    }

    /// Deliver pending sticky events to the handler in slot order,
    /// promoting each only after the handler accepted it. Ran right before
    /// packet processing so state changes are always observed first.
    fn replay_pending_sticky(&self) -> Result<(), FlowError> {
        loop {
            let event = {
                let mut state = self.inner.state.lock();
                if !state.events_pending {
                    return Ok(());
                }
                match state.sticky.next_pending() {
                    Some(event) => event,
                    None => {
                        state.events_pending = false;
                        return Ok(());
                    }
                }
            };
            let kind = event.kind();
            trace!(port = %self.name(), ?kind, seqnum = event.seqnum(), "replaying sticky event");
            if self.handler().event(self, event) {
                self.inner.state.lock().sticky.promote(kind);
            } else {
                // The slot stays pending; the next packet retries.
                warn!(port = %self.name(), ?kind, "sticky event rejected by handler");
                return Err(FlowError::Error);
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Ask this port's handler a question.
    pub fn query(&self, query: &mut Query) -> bool {
        let mask = match self.direction() {
            // A query answered by a source travels upstream to get there.
            PortDirection::Source => ProbeMask::QUERY_UPSTREAM,
            PortDirection::Sink => ProbeMask::QUERY_DOWNSTREAM,
        };
        let verdict = {
            let mut probe_data = ProbeData::Query(query);
            self.run_probes(mask, &mut probe_data)
        };
        match verdict {
            ProbeVerdict::Dropped | ProbeVerdict::Abort(_) => false,
            ProbeVerdict::Handled => true,
            ProbeVerdict::Continue => self.handler().query(self, query),
        }
    }

    /// Forward a question to the linked peer.
    pub fn peer_query(&self, query: &mut Query) -> bool {
        match self.peer() {
            Some(peer) => peer.query(query),
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Activation & flushing
    // ------------------------------------------------------------------

    /// Activate (push mode by default, via the handler) or fully shut the
    /// port down.
    pub fn set_active(&self, active: bool) -> bool {
        if active {
            self.handler().activate(self, true)
        } else {
            match self.mode() {
                PortMode::Inactive => true,
                mode => self.activate_mode(mode, false),
            }
        }
    }

    /// Drive the scheduling-mode state machine.
    ///
    /// Deactivation sets flushing before the handler runs so blocked
    /// threads exit; activation clears it. Switching between push and pull
    /// deactivates the old mode first. A failed activation leaves the port
    /// flushing.
    pub fn activate_mode(&self, mode: PortMode, active: bool) -> bool {
        debug_assert!(mode != PortMode::Inactive, "Inactive is not an activatable mode");
        let current = self.mode();
        if active && current == mode {
            return true;
        }
        if !active && current != mode {
            return current == PortMode::Inactive;
        }
        if active && current != PortMode::Inactive {
            // Mode switch: tear the old mode down first.
            if !self.activate_mode(current, false) {
                return false;
            }
        }

        self.set_flushing(!active);
        let ok = self.handler().activate_mode(self, mode, active);
        if ok {
            let mut state = self.inner.state.lock();
            if active {
                state.mode = mode;
            } else {
                state.mode = PortMode::Inactive;
                // Stream state does not survive deactivation.
                state.sticky.clear_all();
                state.events_pending = false;
            }
            drop(state);
            debug!(port = %self.name(), ?mode, active, "activation changed");
        } else {
            if active {
                self.set_flushing(true);
            }
            warn!(port = %self.name(), ?mode, active, "activation failed");
        }
        ok
    }

    /// Level-triggered cancellation. Setting it fails data operations fast
    /// and wakes every thread suspended in a blocking probe; clearing it
    /// resumes normal operation.
    pub fn set_flushing(&self, flushing: bool) {
        {
            let mut state = self.inner.state.lock();
            if state.flushing == flushing {
                return;
            }
            state.flushing = flushing;
        }
        if flushing {
            self.inner.cond.notify_all();
        }
        debug!(port = %self.name(), flushing, "flushing changed");
    }

    // ------------------------------------------------------------------
    // Probes
    // ------------------------------------------------------------------

    /// Install a probe. An IDLE probe on an idle port fires immediately
    /// from this call.
    pub fn add_probe<F>(&self, mask: ProbeMask, callback: F) -> ProbeId
    where
        F: Fn(&Port, &mut ProbeInfo<'_, '_>) -> ProbeReturn + Send + Sync + 'static,
    {
        let id = ProbeId::next();
        let callback: Arc<super::probe::ProbeCallback> = Arc::new(callback);
        let fire_idle_now = {
            let mut state = self.inner.state.lock();
            state.probes.push(ProbeEntry {
                id,
                mask,
                cookie: 0,
                callback: Arc::clone(&callback),
            });
            state.list_cookie += 1;
            if mask.contains(ProbeMask::BLOCKING) {
                state.n_blocking += 1;
            }
            if mask.contains(ProbeMask::IDLE) {
                if state.in_flight == 0 {
                    true
                } else {
                    state.idle_pending = true;
                    false
                }
            } else {
                false
            }
        };
        debug!(port = %self.name(), ?id, ?mask, "probe added");

        if fire_idle_now {
            let mut probe_data = ProbeData::None;
            let ret = callback(
                self,
                &mut ProbeInfo {
                    id,
                    mask: ProbeMask::IDLE,
                    data: &mut probe_data,
                },
            );
            if ret == ProbeReturn::Remove {
                self.remove_probe(id);
            }
        }
        id
    }

    /// Remove a probe. Wakes threads a blocking probe was holding.
    pub fn remove_probe(&self, id: ProbeId) -> bool {
        let removed = {
            let mut state = self.inner.state.lock();
            Self::remove_entry_locked(&mut state, id)
        };
        if removed {
            self.inner.cond.notify_all();
            debug!(port = %self.name(), ?id, "probe removed");
        }
        removed
    }

    fn remove_entry_locked(state: &mut PortState, id: ProbeId) -> bool {
        let Some(pos) = state.probes.iter().position(|e| e.id == id) else {
            return false;
        };
        let entry = state.probes.remove(pos);
        state.list_cookie += 1;
        if entry.is_blocking() {
            debug_assert!(state.n_blocking > 0);
            state.n_blocking -= 1;
        }
        true
    }

    /// Dispatch all probes matching `dispatch` over `data`.
    ///
    /// Each entry runs at most once per dispatch (per-entry cookie), with
    /// the object lock released around the callback. A list change during
    /// a callback restarts the scan so newly added hooks are picked up.
    /// On a blocking dispatch the caller suspends here while a matching
    /// blocking probe stays installed, until a `Pass`, a removal, or
    /// flushing.
    fn run_probes(&self, dispatch: ProbeMask, data: &mut ProbeData<'_>) -> ProbeVerdict {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.probes.is_empty() {
            return ProbeVerdict::Continue;
        }
        state.probe_cookie = state.probe_cookie.wrapping_add(1);
        let mut cookie = state.probe_cookie;
        let mut passed = false;
        let is_blocking_pass = dispatch.contains(ProbeMask::BLOCKING);
        loop {
            let list_cookie = state.list_cookie;
            let next = state
                .probes
                .iter_mut()
                .find(|e| e.cookie != cookie && e.matches(dispatch))
                .map(|e| {
                    e.cookie = cookie;
                    (e.id, Arc::clone(&e.callback))
                });
            match next {
                Some((id, callback)) => {
                    drop(state);
                    let ret = callback(
                        self,
                        &mut ProbeInfo {
                            id,
                            mask: dispatch,
                            data: &mut *data,
                        },
                    );
                    state = inner.state.lock();
                    match ret {
                        ProbeReturn::Ok => {}
                        // Drop wins over Pass, even when Pass fired first.
                        ProbeReturn::Drop => return ProbeVerdict::Dropped,
                        ProbeReturn::Pass => passed = true,
                        ProbeReturn::Handled => return ProbeVerdict::Handled,
                        ProbeReturn::Remove => {
                            Self::remove_entry_locked(&mut state, id);
                            inner.cond.notify_all();
                        }
                    }
                    if state.list_cookie != list_cookie {
                        trace!(port = %inner.name, "probe list changed mid-dispatch, rescanning");
                    }
                }
                None => {
                    if !is_blocking_pass || passed {
                        return ProbeVerdict::Continue;
                    }
                    if !state.probes.iter().any(|e| e.matches(dispatch)) {
                        // No blocking probe fired: pass by default.
                        return ProbeVerdict::Continue;
                    }
                    if state.flushing {
                        return ProbeVerdict::Abort(FlowError::Flushing);
                    }
                    trace!(port = %inner.name, "suspended in blocking probe");
                    inner.cond.wait(&mut state);
                    if state.flushing {
                        return ProbeVerdict::Abort(FlowError::Flushing);
                    }
                    // Woken: dispatch again so a probe can Pass us through.
                    state.probe_cookie = state.probe_cookie.wrapping_add(1);
                    cookie = state.probe_cookie;
                    passed = false;
                }
            }
        }
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Port")
            .field("name", &self.inner.name)
            .field("direction", &self.inner.direction)
            .field("mode", &state.mode)
            .field("flushing", &state.flushing)
            .field("linked", &state.peer.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Sink that counts and keeps everything it receives.
    #[derive(Default)]
    struct CollectSink {
        packets: Mutex<Vec<Packet>>,
        events: Mutex<Vec<EventKind>>,
        chained: AtomicUsize,
    }

    impl PortHandler for CollectSink {
        fn chain(&self, _port: &Port, packet: Packet) -> FlowResult {
            self.chained.fetch_add(1, Ordering::SeqCst);
            self.packets.lock().push(packet);
            Ok(FlowSuccess::Ok)
        }

        fn event(&self, _port: &Port, event: Event) -> bool {
            self.events.lock().push(event.kind());
            true
        }
    }

    fn pair() -> (Port, Port, Arc<CollectSink>) {
        let handler = Arc::new(CollectSink::default());
        let src = Port::new("src", PortDirection::Source);
        let sink = Port::with_handler("sink", PortDirection::Sink, handler.clone());
        (src, sink, handler)
    }

    #[test]
    fn test_link_sets_peers_symmetrically() {
        let (src, sink, _) = pair();
        src.link(&sink).unwrap();
        assert_eq!(src.peer().unwrap(), sink);
        assert_eq!(sink.peer().unwrap(), src);

        assert!(src.unlink(&sink));
        assert!(src.peer().is_none());
        assert!(sink.peer().is_none());
    }

    #[test]
    fn test_link_twice_fails_without_mutation() {
        let (src, sink, _) = pair();
        src.link(&sink).unwrap();
        let other = Port::new("other-sink", PortDirection::Sink);
        assert_eq!(src.link(&other), Err(LinkError::WasLinked));
        // The failed attempt left the original link intact and the other
        // sink untouched.
        assert_eq!(src.peer().unwrap(), sink);
        assert!(other.peer().is_none());
    }

    #[test]
    fn test_link_wrong_direction() {
        let (src, sink, _) = pair();
        assert_eq!(sink.link(&sink), Err(LinkError::WrongDirection));
        assert_eq!(src.link_with(&src, LinkCheck::empty()), Err(LinkError::WrongDirection));
    }

    #[test]
    fn test_unlink_requires_peer_relation() {
        let (src, sink, _) = pair();
        assert!(!src.unlink(&sink));
        src.link(&sink).unwrap();
        let stranger = Port::new("stranger", PortDirection::Sink);
        assert!(!src.unlink(&stranger));
        assert!(src.is_linked());
    }

    #[test]
    fn test_push_unlinked_returns_not_linked_and_releases() {
        let (src, _, _) = pair();
        let packet = Packet::new();
        let observer = packet.clone();
        assert_eq!(observer.ref_count(), 2);
        assert_eq!(src.push(packet), Err(FlowError::NotLinked));
        // The pushed handle was released exactly once.
        assert_eq!(observer.ref_count(), 1);
    }

    #[test]
    fn test_push_reaches_chain_exactly_once() {
        let (src, sink, handler) = pair();
        src.link(&sink).unwrap();
        assert_eq!(src.push(Packet::new()), Ok(FlowSuccess::Ok));
        assert_eq!(handler.chained.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_push_while_flushing() {
        let (src, sink, handler) = pair();
        src.link(&sink).unwrap();
        src.set_flushing(true);
        assert_eq!(src.push(Packet::new()), Err(FlowError::Flushing));
        src.set_flushing(false);
        assert_eq!(src.push(Packet::new()), Ok(FlowSuccess::Ok));
        assert_eq!(handler.chained.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_push_list_falls_back_to_chain() {
        let (src, sink, handler) = pair();
        src.link(&sink).unwrap();
        let list: PacketList = (0..3).map(|_| Packet::new()).collect();
        assert_eq!(src.push_list(list), Ok(FlowSuccess::Ok));
        assert_eq!(handler.chained.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_push_after_eos() {
        let (src, sink, _) = pair();
        src.link(&sink).unwrap();
        assert!(src.push_event(Event::eos()));
        assert_eq!(src.push(Packet::new()), Err(FlowError::Eos));
    }

    #[test]
    fn test_sticky_events_replay_before_first_packet() {
        let (src, sink, handler) = pair();
        assert!(src.push_event(Event::stream_start("s0")));
        assert!(src.push_event(Event::segment(0, 0, None)));
        src.link(&sink).unwrap();
        // Nothing delivered yet: replay is lazy.
        assert!(handler.events.lock().is_empty());
        src.push(Packet::new()).unwrap();
        assert_eq!(
            *handler.events.lock(),
            vec![EventKind::StreamStart, EventKind::Segment]
        );
        assert_eq!(handler.chained.load(Ordering::SeqCst), 1);
        // Replayed events are promoted to active on the sink.
        assert!(sink.sticky_event(EventKind::StreamStart).is_some());
    }

    #[test]
    fn test_segment_base_shifted_by_offset_sum() {
        let (src, sink, _) = pair();
        src.set_offset(30);
        sink.set_offset(12);
        src.link(&sink).unwrap();
        assert!(src.push_event(Event::segment(100, 0, None)));
        src.push(Packet::new()).unwrap();
        match sink.sticky_event(EventKind::Segment).unwrap().data() {
            crate::core::event::EventData::Segment { base, .. } => assert_eq!(*base, 142),
            _ => panic!("expected segment"),
        }
        // The source keeps the unshifted original.
        match src.sticky_event(EventKind::Segment).unwrap().data() {
            crate::core::event::EventData::Segment { base, .. } => assert_eq!(*base, 100),
            _ => panic!("expected segment"),
        }
    }

    #[test]
    fn test_flush_stop_clears_terminal_marker() {
        let (src, sink, _) = pair();
        src.link(&sink).unwrap();
        src.push_event(Event::eos());
        src.push_event(Event::flush_start());
        assert!(sink.is_flushing());
        src.push_event(Event::flush_stop(true));
        assert!(!sink.is_flushing());
        assert!(sink.sticky_event(EventKind::Eos).is_none());
    }

    #[test]
    fn test_drop_probe_consumes_and_reports_success() {
        let (src, sink, handler) = pair();
        src.link(&sink).unwrap();
        src.add_probe(ProbeMask::PACKET, |_, _| ProbeReturn::Drop);
        assert_eq!(src.push(Packet::new()), Ok(FlowSuccess::Ok));
        assert_eq!(handler.chained.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_probe_runs_once_per_dispatch_even_when_list_changes() {
        let (src, sink, _) = pair();
        src.link(&sink).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_probe = calls.clone();
        src.add_probe(ProbeMask::PACKET, move |port, info| {
            calls_probe.fetch_add(1, Ordering::SeqCst);
            // Mutating the list mid-dispatch forces a rescan; the cookie
            // must keep this probe from running twice.
            let id = port.add_probe(ProbeMask::EVENT_UPSTREAM, |_, _| ProbeReturn::Ok);
            port.remove_probe(id);
            let _ = info;
            ProbeReturn::Ok
        });
        src.push(Packet::new()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_return_uninstalls_probe() {
        let (src, sink, handler) = pair();
        src.link(&sink).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_probe = calls.clone();
        src.add_probe(ProbeMask::PACKET, move |_, _| {
            calls_probe.fetch_add(1, Ordering::SeqCst);
            ProbeReturn::Remove
        });
        src.push(Packet::new()).unwrap();
        src.push(Packet::new()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(handler.chained.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_handled_skips_peer() {
        let (src, sink, handler) = pair();
        src.link(&sink).unwrap();
        src.add_probe(ProbeMask::PACKET, |_, _| ProbeReturn::Handled);
        assert_eq!(src.push(Packet::new()), Ok(FlowSuccess::Ok));
        assert_eq!(handler.chained.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_idle_probe_fires_immediately_when_idle() {
        let (src, _, _) = pair();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_probe = fired.clone();
        src.add_probe(ProbeMask::IDLE, move |_, _| {
            fired_probe.fetch_add(1, Ordering::SeqCst);
            ProbeReturn::Remove
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!src.is_blocked());
    }

    #[test]
    fn test_event_probe_drop_swallows_event() {
        let (src, sink, handler) = pair();
        src.link(&sink).unwrap();
        src.add_probe(ProbeMask::EVENT_DOWNSTREAM, |_, info| {
            if matches!(info.data, ProbeData::Event(e) if e.kind() == EventKind::Eos) {
                ProbeReturn::Drop
            } else {
                ProbeReturn::Ok
            }
        });
        assert!(src.push_event(Event::eos()));
        // The event never reached the source's sticky store or the sink.
        assert!(src.sticky_event(EventKind::Eos).is_none());
        src.push(Packet::new()).unwrap();
        assert_eq!(handler.chained.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_default_query_answers_formats_with_any() {
        let (src, _, _) = pair();
        let formats = src.query_formats(None);
        assert!(matches!(formats, FormatSet::Any));
    }

    #[test]
    fn test_link_respects_format_intersection() {
        struct FixedFormats(FormatSet);
        impl PortHandler for FixedFormats {
            fn query(&self, _port: &Port, query: &mut Query) -> bool {
                if let Query::Formats { result, .. } = query {
                    *result = Some(self.0.clone());
                    return true;
                }
                false
            }
        }

        use crate::core::format::Format;
        let src = Port::with_handler(
            "src",
            PortDirection::Source,
            Arc::new(FixedFormats(FormatSet::single(
                Format::new("audio/raw").with_field("rate", "48000"),
            ))),
        );
        let sink = Port::with_handler(
            "sink",
            PortDirection::Sink,
            Arc::new(FixedFormats(FormatSet::single(
                Format::new("audio/raw").with_field("rate", "44100"),
            ))),
        );
        assert_eq!(src.link(&sink), Err(LinkError::NoFormat));
        assert!(src.peer().is_none());
        // Without the format check the link goes through.
        assert!(src.link_with(&sink, LinkCheck::empty()).is_ok());
    }

    #[test]
    fn test_link_refused_by_handler() {
        struct Refuser;
        impl PortHandler for Refuser {
            fn link(&self, _port: &Port, _peer: &Port) -> Result<(), LinkError> {
                Err(LinkError::Refused)
            }
        }
        let src = Port::new("src", PortDirection::Source);
        let sink = Port::with_handler("sink", PortDirection::Sink, Arc::new(Refuser));
        assert_eq!(src.link(&sink), Err(LinkError::Refused));
        assert!(src.peer().is_none());
        assert!(sink.peer().is_none());
    }

    #[test]
    fn test_relink_fails_before_link_hooks_run() {
        struct CountingLink {
            calls: AtomicUsize,
        }
        impl PortHandler for CountingLink {
            fn link(&self, _port: &Port, _peer: &Port) -> Result<(), LinkError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
        let handler = Arc::new(CountingLink {
            calls: AtomicUsize::new(0),
        });
        let src = Port::with_handler("src", PortDirection::Source, handler.clone());
        let sink = Port::new("sink", PortDirection::Sink);
        src.link(&sink).unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        // A second attempt must be refused before any hook fires.
        let other = Port::new("other", PortDirection::Sink);
        assert_eq!(src.link(&other), Err(LinkError::WasLinked));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hierarchy_check() {
        struct Component {
            name: String,
            parent: Option<Arc<dyn PortOwner>>,
        }
        impl PortOwner for Component {
            fn name(&self) -> &str {
                &self.name
            }
            fn parent(&self) -> Option<Arc<dyn PortOwner>> {
                self.parent.clone()
            }
        }
        fn component(name: &str, parent: Option<Arc<dyn PortOwner>>) -> Arc<dyn PortOwner> {
            Arc::new(Component {
                name: name.to_string(),
                parent,
            })
        }

        let shared_parent = component("bin", None);
        let a = component("a", Some(shared_parent.clone()));
        let b = component("b", Some(shared_parent.clone()));
        let orphan = component("orphan", None);

        let (src, sink, _) = pair();
        src.set_owner(&a);
        sink.set_owner(&b);
        assert!(src.link(&sink).is_ok());
        src.unlink(&sink);

        sink.set_owner(&orphan);
        assert_eq!(src.link(&sink), Err(LinkError::WrongHierarchy));
    }

    #[test]
    fn test_activation_state_machine() {
        let (src, _, _) = pair();
        assert_eq!(src.mode(), PortMode::Inactive);
        assert!(src.set_active(true));
        assert_eq!(src.mode(), PortMode::Push);
        assert!(!src.is_flushing());

        // Switching modes deactivates the old one first.
        assert!(src.activate_mode(PortMode::Pull, true));
        assert_eq!(src.mode(), PortMode::Pull);

        assert!(src.set_active(false));
        assert_eq!(src.mode(), PortMode::Inactive);
        assert!(src.is_flushing());
    }

    #[test]
    fn test_deactivation_clears_sticky_state() {
        let (src, _, _) = pair();
        src.set_active(true);
        src.push_event(Event::stream_start("s0"));
        assert!(src.sticky_event(EventKind::StreamStart).is_some());
        src.set_active(false);
        assert!(src.sticky_event(EventKind::StreamStart).is_none());
    }

    #[test]
    fn test_pull_range_roundtrip() {
        struct ByteSource;
        impl PortHandler for ByteSource {
            fn get_range(
                &self,
                _port: &Port,
                offset: u64,
                size: usize,
            ) -> Result<Packet, FlowError> {
                use crate::core::allocator::SystemAllocator;
                use crate::core::memory::MemoryBlock;
                let block = MemoryBlock::alloc(SystemAllocator::shared(), size, 0)
                    .map_err(|_| FlowError::Error)?;
                {
                    let mut map = block.map_mut().map_err(|_| FlowError::Error)?;
                    for (i, byte) in map.iter_mut().enumerate() {
                        *byte = (offset as usize + i) as u8;
                    }
                }
                Ok(Packet::from_blocks(vec![block]))
            }
        }

        let src = Port::with_handler("src", PortDirection::Source, Arc::new(ByteSource));
        let sink = Port::new("sink", PortDirection::Sink);
        src.link(&sink).unwrap();

        let packet = sink.pull_range(4, 4).unwrap();
        assert_eq!(packet.to_vec().unwrap(), vec![4, 5, 6, 7]);
    }

    #[test]
    fn test_pull_range_unlinked() {
        let sink = Port::new("sink", PortDirection::Sink);
        assert!(matches!(sink.pull_range(0, 16), Err(FlowError::NotLinked)));
    }

    #[test]
    fn test_reentrant_handler_may_call_back() {
        // A chain handler that re-enters its own port must not deadlock on
        // the stream lock.
        struct Reenter {
            depth: AtomicUsize,
        }
        impl PortHandler for Reenter {
            fn chain(&self, port: &Port, _packet: Packet) -> FlowResult {
                if self.depth.fetch_add(1, Ordering::SeqCst) == 0 {
                    return port.chain(Packet::new());
                }
                Ok(FlowSuccess::Ok)
            }
        }
        let handler = Arc::new(Reenter {
            depth: AtomicUsize::new(0),
        });
        let sink = Port::with_handler("sink", PortDirection::Sink, handler.clone());
        assert_eq!(sink.chain(Packet::new()), Ok(FlowSuccess::Ok));
        assert_eq!(handler.depth.load(Ordering::SeqCst), 2);
    }
}
