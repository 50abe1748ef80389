//! Device memory ownership and the budget ledger.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::driver::{DevicePtr, Driver, WorkspaceArg};
use crate::error::{fatal, HarnessResult};

/// Bytes currently allocated through the harness, and the configured limit.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    allocated: AtomicUsize,
    limit: AtomicUsize,
}

impl MemoryLedger {
    pub fn new(limit: usize) -> Self {
        Self {
            allocated: AtomicUsize::new(0),
            limit: AtomicUsize::new(limit),
        }
    }

    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    pub fn set_limit(&self, limit: usize) {
        self.limit.store(limit, Ordering::Release);
    }

    /// Bytes left under the limit. Never negative, even when allocations
    /// exceed a limit that was lowered after the fact.
    pub fn available(&self) -> usize {
        let allocated = self.allocated();
        self.limit().max(allocated) - allocated
    }

    fn record_alloc(&self, bytes: usize) {
        self.allocated.fetch_add(bytes, Ordering::AcqRel);
    }

    fn record_free(&self, bytes: usize) {
        self.allocated.fetch_sub(bytes, Ordering::AcqRel);
    }
}

/// An exclusively owned device allocation.
///
/// The element kind is not stored; callers carry it alongside the descriptor
/// that describes the buffer.
pub struct DeviceBuffer {
    ptr: DevicePtr,
    len: usize,
    driver: Arc<dyn Driver>,
    ledger: Arc<MemoryLedger>,
}

impl DeviceBuffer {
    pub(crate) fn allocate(
        driver: &Arc<dyn Driver>,
        ledger: &Arc<MemoryLedger>,
        bytes: usize,
    ) -> HarnessResult<Self> {
        let ptr = driver.malloc(bytes)?;
        ledger.record_alloc(bytes);
        log::debug!("allocated {} bytes at {}", bytes, ptr);
        Ok(Self {
            ptr,
            len: bytes,
            driver: Arc::clone(driver),
            ledger: Arc::clone(ledger),
        })
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_workspace(&self) -> WorkspaceArg {
        WorkspaceArg { data: self.ptr, size: self.len }
    }

    /// Copy `src` into the start of the buffer.
    pub fn copy_from_host(&mut self, src: &[u8]) -> HarnessResult<()> {
        self.driver.memcpy_htod(self.ptr, src)?;
        Ok(())
    }

    /// Wait for the device, then copy the whole buffer to host.
    pub fn copy_to_host(&self) -> HarnessResult<Vec<u8>> {
        self.driver.synchronize()?;
        let mut host = vec![0u8; self.len];
        self.driver.memcpy_dtoh(&mut host, self.ptr)?;
        Ok(host)
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if let Err(status) = self.driver.free(self.ptr) {
            fatal!("failed to free device memory at {}: engine error '{}'", self.ptr, status);
        }
        self.ledger.record_free(self.len);
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}
