// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Allocators and the allocator registry.
//!
//! The registry is an explicit service: construct one at startup and pass
//! the handle to whoever allocates. It is deliberately not a process-wide
//! global. `new()` seeds it with the system (heap) allocator, which is also
//! the initial default; the default is swappable at runtime.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::error::MemoryError;
use super::memory::{MemoryBlock, Storage};

/// Name under which the seeded heap allocator registers itself.
pub const SYSTEM_ALLOCATOR_NAME: &str = "system";

/// A source of backing storage for memory blocks.
///
/// `alloc_storage` is the one required operation. `copy` and `is_span` are
/// optional capabilities: returning `None` / `false` routes callers to the
/// generic fallbacks (map-read-then-memcpy, "never a span").
pub trait Allocator: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Allocate `maxsize` bytes whose address is aligned to `align_mask + 1`.
    fn alloc_storage(&self, maxsize: usize, align_mask: usize) -> Result<Storage, MemoryError>;

    /// Specialized copy, or `None` to use the generic fallback.
    fn copy(
        &self,
        _block: &MemoryBlock,
        _offset: isize,
        _size: Option<usize>,
    ) -> Option<Result<MemoryBlock, MemoryError>> {
        None
    }

    /// Whether `a`'s window ends exactly where `b`'s begins on shared
    /// parent storage. Allocators that cannot tell report `false`.
    fn is_span(&self, _a: &MemoryBlock, _b: &MemoryBlock) -> bool {
        false
    }
}

/// Plain heap allocator. The seeded default.
#[derive(Debug, Default)]
pub struct SystemAllocator;

impl SystemAllocator {
    /// One shared instance per process is plenty; blocks keep the Arc alive.
    pub fn shared() -> Arc<dyn Allocator> {
        Arc::new(SystemAllocator)
    }
}

impl Allocator for SystemAllocator {
    fn name(&self) -> &str {
        SYSTEM_ALLOCATOR_NAME
    }

    fn alloc_storage(&self, maxsize: usize, align_mask: usize) -> Result<Storage, MemoryError> {
        Storage::zeroed(maxsize, align_mask)
    }

    fn is_span(&self, a: &MemoryBlock, b: &MemoryBlock) -> bool {
        let (Some(pa), Some(pb)) = (a.parent(), b.parent()) else {
            return false;
        };
        if !pa.same_storage(&pb) {
            return false;
        }
        a.offset() + a.size() == b.offset()
    }
}

struct RegistryInner {
    allocators: HashMap<String, Arc<dyn Allocator>>,
    default_name: String,
}

/// Name -> allocator map, seeded with [`SystemAllocator`].
pub struct AllocatorRegistry {
    inner: Mutex<RegistryInner>,
}

impl AllocatorRegistry {
    pub fn new() -> Self {
        let system = SystemAllocator::shared();
        let mut allocators: HashMap<String, Arc<dyn Allocator>> = HashMap::new();
        allocators.insert(SYSTEM_ALLOCATOR_NAME.to_string(), system);
        Self {
            inner: Mutex::new(RegistryInner {
                allocators,
                default_name: SYSTEM_ALLOCATOR_NAME.to_string(),
            }),
        }
    }

    /// Register under the allocator's own name, replacing any previous
    /// entry with that name.
    pub fn register(&self, allocator: Arc<dyn Allocator>) {
        let name = allocator.name().to_string();
        debug!(allocator = %name, "registering allocator");
        self.inner.lock().allocators.insert(name, allocator);
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Allocator>> {
        self.inner.lock().allocators.get(name).cloned()
    }

    pub fn default_allocator(&self) -> Arc<dyn Allocator> {
        let inner = self.inner.lock();
        Arc::clone(
            inner
                .allocators
                .get(&inner.default_name)
                .expect("default allocator always registered"),
        )
    }

    /// Swap the default. Returns false (and changes nothing) when no
    /// allocator with that name is registered.
    pub fn set_default(&self, name: &str) -> bool {
        let mut inner = self.inner.lock();
        if !inner.allocators.contains_key(name) {
            return false;
        }
        debug!(allocator = %name, "default allocator changed");
        inner.default_name = name.to_string();
        true
    }

    /// Allocate through a named allocator, or the default when `name` is
    /// `None`.
    pub fn alloc(
        &self,
        name: Option<&str>,
        maxsize: usize,
        align_mask: usize,
    ) -> Result<MemoryBlock, MemoryError> {
        let allocator = match name {
            Some(n) => self
                .find(n)
                .ok_or_else(|| MemoryError::UnknownAllocator(n.to_string()))?,
            None => self.default_allocator(),
        };
        MemoryBlock::alloc(allocator, maxsize, align_mask)
    }
}

impl Default for AllocatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
