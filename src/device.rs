//! Device context: driver, capabilities and the memory budget.
//!
//! A [`Device`] is opened once per process (or per test) against a
//! [`Driver`]. Opening performs the environment sanity check: the ordinal must
//! exist, free/total memory is queried, and the configured memory limit is
//! resolved against the free memory at that point.

use std::sync::{Arc, OnceLock};

use crate::config::{ConvolutionConfig, Tunables};
use crate::driver::{Driver, EngineVersion};
use crate::error::{HarnessError, HarnessResult};
use crate::handle::{create_engine_handle, EngineHandle};
use crate::memory::{DeviceBuffer, MemoryLedger};

/// Engine features that older versions lack, resolved once from the version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Group count on convolution descriptors.
    pub grouped_convolution: bool,
    /// Math type (tensor-op accumulation) on convolution descriptors.
    pub math_type: bool,
}

impl Capabilities {
    pub fn for_version(version: EngineVersion) -> Self {
        let v7 = version.major >= 7;
        Self { grouped_convolution: v7, math_type: v7 }
    }
}

/// Banner logged the first time any device is opened.
static BANNER: OnceLock<()> = OnceLock::new();

pub struct Device {
    driver: Arc<dyn Driver>,
    ordinal: i32,
    name: String,
    capabilities: Capabilities,
    ledger: Arc<MemoryLedger>,
}

impl Device {
    /// Open device `tunables.device` on `driver` and resolve the memory limit.
    pub fn open(driver: Arc<dyn Driver>, tunables: &Tunables) -> HarnessResult<Self> {
        let count = driver.device_count()?;
        if tunables.device < 0 || tunables.device >= count {
            return Err(HarnessError::Device(format!(
                "Invalid device {} ({} available)",
                tunables.device, count
            )));
        }
        driver.set_device(tunables.device)?;
        let name = driver.device_name()?;
        let capabilities = Capabilities::for_version(driver.version());

        let device = Self {
            driver,
            ordinal: tunables.device,
            name,
            capabilities,
            ledger: Arc::new(MemoryLedger::default()),
        };
        device.set_memory_limit_mb(tunables.device_memory_limit_mb)?;

        BANNER.get_or_init(|| {
            log::info!(
                "Running {} v{} for runtime {} on {}",
                device.driver.name(),
                device.driver.version(),
                device.driver.runtime_version(),
                device.name
            );
        });
        log::debug!(
            "device {} capabilities: {:?}, memory limit {} bytes",
            device.ordinal,
            device.capabilities,
            device.ledger.limit()
        );
        Ok(device)
    }

    /// Resolve `limit_mb` against the memory free right now and install it.
    ///
    /// A negative value means "free memory minus this many megabytes".
    pub fn set_memory_limit_mb(&self, limit_mb: i64) -> HarnessResult<usize> {
        let (free, _total) = self.driver.mem_get_info()?;
        let limit_bytes = limit_mb.saturating_mul(1 << 20);
        let magnitude = usize::try_from(limit_bytes.unsigned_abs()).unwrap_or(usize::MAX);
        if free < magnitude {
            return Err(HarnessError::Device(format!(
                "Available device memory ({free} bytes) is smaller than specified limit ({limit_mb} MB)."
            )));
        }
        let limit = if limit_bytes < 0 { free - magnitude } else { magnitude };
        self.ledger.set_limit(limit);
        Ok(limit)
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn ordinal(&self) -> i32 {
        self.ordinal
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn create_engine_handle(&self) -> HarnessResult<EngineHandle> {
        Ok(create_engine_handle(&self.driver)?)
    }

    // ── Memory budget ────────────────────────────────────────────

    pub fn allocate(&self, bytes: usize) -> HarnessResult<DeviceBuffer> {
        DeviceBuffer::allocate(&self.driver, &self.ledger, bytes)
    }

    pub fn bytes_allocated(&self) -> usize {
        self.ledger.allocated()
    }

    pub fn memory_limit(&self) -> usize {
        self.ledger.limit()
    }

    /// Bytes available for workspace: the limit minus current allocations,
    /// clamped at zero.
    pub fn available_bytes(&self) -> usize {
        self.ledger.available()
    }

    /// Workspace budget for `config`: its explicit cap if it fits, otherwise
    /// everything available.
    pub fn workspace_limit(&self, config: &ConvolutionConfig) -> HarnessResult<usize> {
        let available = self.available_bytes();
        match config.workspace_limit {
            None => Ok(available),
            Some(limit) if limit > available => {
                Err(HarnessError::WorkspaceLimit { limit, available })
            }
            Some(limit) => Ok(limit),
        }
    }

    pub fn synchronize(&self) -> HarnessResult<()> {
        Ok(self.driver.synchronize()?)
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("ordinal", &self.ordinal)
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .field("limit", &self.ledger.limit())
            .field("allocated", &self.ledger.allocated())
            .finish()
    }
}
