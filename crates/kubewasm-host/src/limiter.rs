//! Memory and table caps for guest instances.
//!
//! Implements `wasmtime::ResourceLimiter` so a single guest cannot grow
//! its linear memory or tables past the configured caps.

use wasmtime::ResourceLimiter;

/// Default table element cap per instance.
pub const DEFAULT_TABLE_LIMIT: usize = 10_000;

/// Per-instance resource limiter.
pub struct GuestLimiter {
    memory_limit: usize,
    table_limit: usize,
    /// High-water mark of linear memory, in bytes.
    memory_used: usize,
}

impl GuestLimiter {
    pub fn new(memory_limit: usize, table_limit: usize) -> Self {
        Self {
            memory_limit,
            table_limit,
            memory_used: 0,
        }
    }

    pub fn memory_used(&self) -> usize {
        self.memory_used
    }
}

impl ResourceLimiter for GuestLimiter {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        if desired > self.memory_limit {
            tracing::warn!(
                current,
                desired,
                limit = self.memory_limit,
                "guest memory growth denied"
            );
            return Ok(false);
        }
        self.memory_used = desired;
        Ok(true)
    }

    fn table_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        if desired > self.table_limit {
            tracing::warn!(
                current,
                desired,
                limit = self.table_limit,
                "guest table growth denied"
            );
            Ok(false)
        } else {
            Ok(true)
        }
    }
}
