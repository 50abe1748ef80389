//! CUDA environment probe.
//!
//! Reports what a vendor engine would run on: device count, the selected
//! device's name and its free/total memory. The driver library is loaded at
//! runtime, so the probe fails cleanly on machines without CUDA.

use cudarc::driver::{result, CudaContext, DriverError};

use crate::error::{HarnessError, HarnessResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CudaEnvironment {
    pub device_count: i32,
    pub ordinal: usize,
    pub name: String,
    pub free_memory: usize,
    pub total_memory: usize,
}

fn device_error(err: DriverError) -> HarnessError {
    HarnessError::Device(format!("CUDA driver error: {err}"))
}

/// Initialise the CUDA driver and describe device `ordinal`.
pub fn probe(ordinal: usize) -> HarnessResult<CudaEnvironment> {
    result::init().map_err(device_error)?;
    let device_count = CudaContext::device_count().map_err(device_error)?;
    if ordinal >= device_count.max(0) as usize {
        return Err(HarnessError::Device(format!(
            "Invalid device {} ({} available)",
            ordinal, device_count
        )));
    }
    let ctx = CudaContext::new(ordinal).map_err(device_error)?;
    let name = ctx.name().map_err(device_error)?;
    let (free_memory, total_memory) = ctx.mem_get_info().map_err(device_error)?;
    log::info!(
        "CUDA device {} of {}: {} ({} of {} bytes free)",
        ordinal,
        device_count,
        name,
        free_memory,
        total_memory
    );
    Ok(CudaEnvironment { device_count, ordinal, name, free_memory, total_memory })
}
