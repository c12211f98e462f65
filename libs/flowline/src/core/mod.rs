// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

pub mod allocator;
pub mod error;
pub mod event;
pub mod format;
pub mod memory;
pub mod packet;
pub mod port;
pub mod probe;
pub mod query;
pub mod task;

mod sticky;

pub use allocator::{Allocator, AllocatorRegistry, SystemAllocator, SYSTEM_ALLOCATOR_NAME};
pub use error::{
    CoreError, FlowError, FlowResult, FlowSuccess, LinkError, MemoryError, Result,
    FLOW_PULL_DROPPED,
};
pub use event::{Event, EventData, EventDirection, EventKind, STICKY_SLOT_COUNT};
pub use format::{Format, FormatSet};
pub use memory::{MapFlags, MappedMemory, MappedMemoryMut, MemoryBlock, MemoryFlags, Storage};
pub use packet::{Packet, PacketFlags, PacketList};
pub use port::{LinkCheck, Port, PortDirection, PortHandler, PortMode, PortOwner};
pub use probe::{ProbeData, ProbeId, ProbeInfo, ProbeMask, ProbeReturn};
pub use query::Query;
pub use task::{Task, TaskState};
