//! convcheck: conformance harness for accelerator convolution engines.
//!
//! The crate drives a convolution engine through the [`Driver`] trait:
//! - **Descriptor lifecycle**: tensor, filter and convolution descriptors are
//!   built from declarative configs and released exactly once on drop
//! - **Budgeted algorithm selection**: candidates are filtered by the
//!   workspace they need against a device memory limit
//! - **Precision dispatch**: scaling factors follow the element kind of the
//!   tensor each direction writes
//! - **Host reference engine**: [`HostDriver`] implements the full interface
//!   on host memory, so everything runs without accelerator hardware
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use convcheck::{
//!     create_convolution, find_algorithm, run_convolution, ConvolutionConfig,
//!     ConvolutionParams, DataType, Device, Direction, FilterConfig, HostDriver,
//!     workspace_size, RandomGenerator, TensorConfig, TensorFormat, Tunables,
//! };
//!
//! let tunables = Tunables { device: 0, device_memory_limit_mb: 256 };
//! let device = Device::open(Arc::new(HostDriver::new()), &tunables)?;
//! let handle = device.create_engine_handle()?;
//! let config = ConvolutionConfig::new(
//!     TensorConfig::packed(DataType::Float, &[1, 1, 4, 4], TensorFormat::Nchw),
//!     FilterConfig::new(DataType::Float, TensorFormat::Nchw, &[1, 1, 3, 3]),
//!     ConvolutionParams::new(&[0, 0], &[1, 1], &[1, 1], DataType::Float),
//!     Direction::Forward,
//! );
//! let mut rng = RandomGenerator::new(0);
//! let conv = create_convolution(&device, &config, -1.0, 1.0, &mut rng)?;
//! let limit = device.workspace_limit(&config)?;
//! let algo = find_algorithm(&device, &handle, config.direction, &conv, limit)?;
//! let workspace = device.allocate(workspace_size(&handle, conv.descriptors(), algo)?)?;
//! run_convolution(&handle, algo, 1.0, 0.0, &conv.args(), Some(&workspace))?;
//! # Ok::<(), convcheck::HarnessError>(())
//! ```

pub mod algorithm;
pub mod config;
pub mod error;
pub mod types;

// Engine boundary and the host implementation of it
pub mod driver;
pub mod host_driver;

// Resource ownership
pub mod descriptor;
pub mod device;
pub mod handle;
pub mod memory;

// Selection, execution and result handling
pub mod compare;
pub mod convert;
pub mod convolution;
pub mod execute;
pub mod introspect;
pub mod random;
pub mod selector;

// CUDA environment probe (runtime-loaded driver library)
#[cfg(feature = "cuda")]
pub mod cuda_probe;

#[cfg(test)]
mod testing;

pub use algorithm::{BwdDataAlgo, BwdFilterAlgo, ConvolutionAlgo, FwdAlgo};
pub use config::{
    load_configs, ConvolutionConfig, ConvolutionParams, FilterConfig, TensorConfig, Tunables,
};
pub use error::{EngineResult, EngineStatus, HarnessError, HarnessResult};
pub use types::{ConvolutionMode, DataType, Direction, MathType, TensorFormat, DIM_MAX};

pub use driver::{Driver, EngineVersion, ScalingFactor};
pub use host_driver::{HostDriver, HostDriverConfig};

pub use descriptor::{
    build_convolution, build_filter, build_output, build_output_for, build_tensor,
    fully_packed_strides, ConvolutionDescriptor, FilterDescriptor, TensorDescriptor,
};
pub use device::{Capabilities, Device};
pub use handle::{EngineHandle, Owned};
pub use memory::DeviceBuffer;

pub use compare::{compare_tensors, download_values, Comparison, Tolerance};
pub use convert::{convert_and_transform_tensor, convert_device_data, transform_tensor};
pub use convolution::{create_convolution, Convolution};
pub use execute::{run_convolution, ConvolutionArgs};
pub use introspect::{convolution_debug_string, filter_debug_string, tensor_debug_string};
pub use random::{create_device_data, create_filter_data, create_tensor_data, RandomGenerator};
pub use selector::{
    find_algorithm, supported_algorithms, supported_candidates, workspace_size,
    AlgorithmCandidate, ConvDescriptors,
};
