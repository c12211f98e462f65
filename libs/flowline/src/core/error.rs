// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use thiserror::Error;

/// Success codes a data-flow operation can report.
///
/// `Custom` is a band reserved for collaborator-defined success codes that
/// the engine forwards unchanged (a sink may report "dropped but fine",
/// an aggregator "consumed, waiting for more", and so on).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSuccess {
    Ok,
    Custom(u32),
}

/// Error codes a data-flow operation can report.
///
/// `Custom` mirrors the success band: codes in it are collaborator-defined
/// and forwarded unchanged. [`FLOW_PULL_DROPPED`] is the one code the
/// engine itself reserves in that band.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowError {
    #[error("port is not linked")]
    NotLinked,

    #[error("port is flushing")]
    Flushing,

    #[error("format has not been negotiated")]
    NotNegotiated,

    #[error("end of stream")]
    Eos,

    #[error("operation not supported")]
    NotSupported,

    #[error("internal data flow error")]
    Error,

    #[error("custom flow error {0}")]
    Custom(u32),
}

/// Custom-band code reported by [`Port::pull_range`](crate::core::Port::pull_range)
/// when a probe dropped the pulled packet. The pull cannot report plain
/// success without a packet, so the drop surfaces here instead.
pub const FLOW_PULL_DROPPED: u32 = 1;

/// Result of a data-flow operation (push/chain and friends).
pub type FlowResult = std::result::Result<FlowSuccess, FlowError>;

/// Why a `link` attempt failed. Disjoint from [`FlowError`]; a failed link
/// never partially mutates either port.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    #[error("port was already linked")]
    WasLinked,

    #[error("port owners do not share an ancestor")]
    WrongHierarchy,

    #[error("port formats do not intersect")]
    NoFormat,

    #[error("wrong port direction for link")]
    WrongDirection,

    #[error("link refused by port handler")]
    Refused,
}

/// Memory-block level failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("window [{offset}, {offset}+{size}) out of bounds (maxsize {maxsize})")]
    OutOfBounds {
        offset: usize,
        size: usize,
        maxsize: usize,
    },

    #[error("memory block is not writable")]
    NotWritable,

    #[error("mapping conflicts with an existing mapping")]
    MappingConflict,

    #[error("allocation of {size} bytes (alignment {align}) failed")]
    Allocation { size: usize, align: usize },

    #[error("invalid alignment mask {0:#x} (mask + 1 must be a power of two)")]
    BadAlignment(usize),

    #[error("no such allocator: {0}")]
    UnknownAllocator(String),
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("flow error: {0}")]
    Flow(#[from] FlowError),

    #[error("link failed: {0}")]
    Link(#[from] LinkError),

    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_error_display() {
        assert_eq!(FlowError::NotLinked.to_string(), "port is not linked");
        assert_eq!(FlowError::Flushing.to_string(), "port is flushing");
        assert_eq!(FlowError::Custom(7).to_string(), "custom flow error 7");
    }

    #[test]
    fn test_link_error_is_disjoint_from_flow() {
        // LinkError and FlowError are separate enums on purpose; a link
        // failure must never be confused with a data-flow failure.
        let link: LinkError = LinkError::WasLinked;
        let flow: FlowError = FlowError::NotLinked;
        assert_eq!(link.to_string(), "port was already linked");
        assert_eq!(flow.to_string(), "port is not linked");
    }

    #[test]
    fn test_core_error_from_conversions() {
        let err: CoreError = FlowError::Eos.into();
        assert!(matches!(err, CoreError::Flow(FlowError::Eos)));

        let err: CoreError = LinkError::Refused.into();
        assert!(matches!(err, CoreError::Link(LinkError::Refused)));

        let err: CoreError = MemoryError::NotWritable.into();
        assert!(matches!(err, CoreError::Memory(MemoryError::NotWritable)));
    }
}
