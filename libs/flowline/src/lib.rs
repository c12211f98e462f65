// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Data-flow plumbing for streaming pipelines.
//!
//! The crate's unit of composition is the [`Port`](core::Port): a
//! directional endpoint that moves refcounted [`Packet`](core::Packet)s
//! and [`Event`](core::Event)s to a linked peer under push or pull
//! scheduling. Packets are lists of [`MemoryBlock`](core::MemoryBlock)s,
//! refcounted views into shared storage. Probes hook into everything that
//! crosses a port; a [`Task`](core::Task) supplies the worker thread for
//! self-driving sources.
//!
//! What components look like, how pipelines are assembled, and what the
//! payloads mean is left to the caller: the contract surface is the
//! [`PortHandler`](core::PortHandler) and [`PortOwner`](core::PortOwner)
//! traits.

// Suppress pedantic clippy warnings that are intentional design choices
#![allow(clippy::type_complexity)] // Complex types are clear in context
#![allow(clippy::collapsible_match)] // Nested matches are clearer in some cases

pub mod core;

pub use core::{
    Allocator, AllocatorRegistry, Event, EventData, EventKind, FlowError, FlowResult,
    FlowSuccess, Format, FormatSet, LinkCheck, LinkError, MemoryBlock, MemoryFlags, Packet,
    PacketFlags, PacketList, Port, PortDirection, PortHandler, PortMode, PortOwner, ProbeData,
    ProbeId, ProbeInfo, ProbeMask, ProbeReturn, Query, SystemAllocator, Task, TaskState,
};
