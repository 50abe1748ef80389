//! Human-readable dumps of descriptors and their data.

use std::fmt::{Display, Write as _};

use crate::convert::convert_device_data;
use crate::descriptor::{ConvolutionDescriptor, FilterDescriptor, TensorDescriptor};
use crate::device::Device;
use crate::error::HarnessResult;
use crate::memory::DeviceBuffer;
use crate::types::DataType;

fn join<T: Display>(values: impl IntoIterator<Item = T>) -> String {
    values.into_iter().fold(String::new(), |mut out, v| {
        let _ = write!(out, " {v}");
        out
    })
}

fn decode<T: bytemuck::Pod + Display>(bytes: &[u8]) -> String {
    join(
        bytes
            .chunks_exact(std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned::<T>),
    )
}

/// Space-prefixed values of the first `size_in_bytes` bytes of `data`.
/// HALF values are converted to FLOAT on the device before download.
fn values_string(
    device: &Device,
    data_type: DataType,
    data: &DeviceBuffer,
    size_in_bytes: usize,
) -> HarnessResult<String> {
    let bytes = if data_type == DataType::Half {
        let count = size_in_bytes / DataType::Half.size_in_bytes();
        let mut widened = device.allocate(count * DataType::Float.size_in_bytes())?;
        convert_device_data(device, &mut widened, DataType::Float, data, DataType::Half, 1.0)?;
        widened.copy_to_host()?
    } else {
        let mut bytes = data.copy_to_host()?;
        bytes.truncate(size_in_bytes);
        bytes
    };
    Ok(match data_type {
        DataType::Float | DataType::Half => decode::<f32>(&bytes),
        DataType::Double => decode::<f64>(&bytes),
        DataType::Int32 => decode::<i32>(&bytes),
        DataType::Int8 | DataType::Int8x4 => decode::<i8>(&bytes),
    })
}

/// Data type, dimensions and strides of `desc`, followed by the values of
/// `data` if `print_values` is set.
pub fn tensor_debug_string(
    device: &Device,
    desc: &TensorDescriptor,
    data: &DeviceBuffer,
    print_values: bool,
) -> HarnessResult<String> {
    let mut out = format!(
        "data_type: {}\ndimensions:{}\nstrides:{}",
        desc.data_type(),
        join(desc.dimensions()),
        join(desc.strides())
    );
    if print_values {
        let values = values_string(device, desc.data_type(), data, desc.size_in_bytes()?)?;
        out.push_str("\nvalues:");
        out.push_str(&values);
    }
    Ok(out)
}

pub fn filter_debug_string(
    device: &Device,
    desc: &FilterDescriptor,
    data: &DeviceBuffer,
    print_values: bool,
) -> HarnessResult<String> {
    let mut out = format!(
        "data_type: {}\nformat: {}\ndimensions:{}",
        desc.data_type(),
        desc.format(),
        join(desc.dimensions())
    );
    if print_values {
        let values = values_string(device, desc.data_type(), data, desc.size_in_bytes())?;
        out.push_str("\nvalues:");
        out.push_str(&values);
    }
    Ok(out)
}

pub fn convolution_debug_string(desc: &ConvolutionDescriptor) -> String {
    format!(
        "pad:{}\nstride:{}\ndilation:{}\nmode: {}\ncompute_type: {}\nmath_type: {}\ngroup_count: {}",
        join(desc.pad()),
        join(desc.stride()),
        join(desc.dilation()),
        desc.mode().name(),
        desc.compute_type(),
        desc.math_type().name(),
        desc.group_count()
    )
}
