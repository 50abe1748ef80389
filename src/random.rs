//! Seeded random fills for device buffers.

use half::f16;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::descriptor::{FilterDescriptor, TensorDescriptor};
use crate::device::Device;
use crate::error::{fatal, HarnessError, HarnessResult};
use crate::memory::DeviceBuffer;
use crate::types::DataType;

/// Deterministic source of uniform test data.
#[derive(Debug, Clone)]
pub struct RandomGenerator {
    rng: StdRng,
}

impl RandomGenerator {
    pub fn new(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }

    /// `count` values drawn uniformly from `[lower, upper]`.
    pub fn uniform(&mut self, lower: f64, upper: f64, count: usize) -> HarnessResult<Vec<f64>> {
        if !(lower.is_finite() && upper.is_finite()) || lower > upper {
            return Err(HarnessError::InvalidConfig(format!(
                "invalid random range [{lower}, {upper}]"
            )));
        }
        let range = Uniform::new_inclusive(lower, upper);
        Ok(range.sample_iter(&mut self.rng).take(count).collect())
    }
}

/// Allocate `count` elements of `data_type` and fill them with uniform values
/// in `[lower, upper]`.
///
/// # Panics
///
/// For integer element kinds, which are not generated.
pub fn create_device_data(
    device: &Device,
    data_type: DataType,
    count: usize,
    lower: f64,
    upper: f64,
    rng: &mut RandomGenerator,
) -> HarnessResult<DeviceBuffer> {
    let values = rng.uniform(lower, upper, count)?;
    let bytes: Vec<u8> = match data_type {
        DataType::Float => {
            let narrowed: Vec<f32> = values.iter().map(|&v| v as f32).collect();
            bytemuck::cast_slice(&narrowed).to_vec()
        }
        DataType::Double => bytemuck::cast_slice(&values).to_vec(),
        DataType::Half => {
            let narrowed: Vec<f16> = values.iter().map(|&v| f16::from_f64(v)).collect();
            bytemuck::cast_slice(&narrowed).to_vec()
        }
        DataType::Int8 | DataType::Int32 | DataType::Int8x4 => {
            fatal!("Not yet supported: random {} data", data_type)
        }
    };
    let mut buffer = device.allocate(bytes.len())?;
    buffer.copy_from_host(&bytes)?;
    Ok(buffer)
}

/// Random data covering the whole address span of `desc`.
pub fn create_tensor_data(
    device: &Device,
    desc: &TensorDescriptor,
    lower: f64,
    upper: f64,
    rng: &mut RandomGenerator,
) -> HarnessResult<DeviceBuffer> {
    create_device_data(device, desc.data_type(), desc.num_elements(), lower, upper, rng)
}

pub fn create_filter_data(
    device: &Device,
    desc: &FilterDescriptor,
    lower: f64,
    upper: f64,
    rng: &mut RandomGenerator,
) -> HarnessResult<DeviceBuffer> {
    create_device_data(device, desc.data_type(), desc.num_elements(), lower, upper, rng)
}
