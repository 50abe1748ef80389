//! Shared fixtures for unit tests.

use std::sync::Arc;

use crate::config::{ConvolutionConfig, ConvolutionParams, FilterConfig, TensorConfig, Tunables};
use crate::device::Device;
use crate::host_driver::{HostDriver, HostDriverConfig};
use crate::types::{DataType, Direction, TensorFormat};

pub(crate) const LIMIT_MB: i64 = 64;

/// A device on a default host engine with a 64 MB limit.
pub(crate) fn host_device() -> (Arc<HostDriver>, Device) {
    host_device_with(HostDriverConfig::default())
}

pub(crate) fn host_device_with(config: HostDriverConfig) -> (Arc<HostDriver>, Device) {
    let _ = env_logger::builder().is_test(true).try_init();
    let host = Arc::new(HostDriver::with_config(config));
    let tunables = Tunables { device: 0, device_memory_limit_mb: LIMIT_MB };
    let device = Device::open(host.clone(), &tunables).unwrap();
    (host, device)
}

/// `[1,1,4,4]` input convolved with a `[1,1,3,3]` filter, all FLOAT.
pub(crate) fn small_config(direction: Direction) -> ConvolutionConfig {
    ConvolutionConfig::new(
        TensorConfig::packed(DataType::Float, &[1, 1, 4, 4], TensorFormat::Nchw),
        FilterConfig::new(DataType::Float, TensorFormat::Nchw, &[1, 1, 3, 3]),
        ConvolutionParams::new(&[0, 0], &[1, 1], &[1, 1], DataType::Float),
        direction,
    )
}
