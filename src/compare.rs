//! Element-wise comparison of device tensors.
//!
//! Values are downloaded in logical (row-major over the dimensions) order so
//! that tensors with different strides or formats compare element for
//! element.

use half::f16;

use crate::descriptor::TensorDescriptor;
use crate::device::Device;
use crate::error::{HarnessError, HarnessResult};
use crate::memory::DeviceBuffer;
use crate::types::DataType;

/// Buffer offsets of every element of `dims` in logical order.
fn logical_offsets(dims: &[i32], strides: &[i32]) -> Vec<usize> {
    dims.iter().zip(strides).fold(vec![0usize], |offsets, (&dim, &stride)| {
        offsets
            .iter()
            .flat_map(|&base| (0..dim as usize).map(move |i| base + i * stride as usize))
            .collect()
    })
}

fn element(bytes: &[u8], data_type: DataType, offset: usize) -> f64 {
    let at = offset * data_type.size_in_bytes();
    match data_type {
        DataType::Double => bytemuck::pod_read_unaligned::<f64>(&bytes[at..at + 8]),
        DataType::Half => f16::from_le_bytes([bytes[at], bytes[at + 1]]).to_f64(),
        _ => f64::from(bytemuck::pod_read_unaligned::<f32>(&bytes[at..at + 4])),
    }
}

/// Wait for the device and read every element of `desc` from `data`.
pub fn download_values(
    device: &Device,
    desc: &TensorDescriptor,
    data: &DeviceBuffer,
) -> HarnessResult<Vec<f64>> {
    let data_type = desc.data_type();
    if !data_type.is_floating() {
        return Err(HarnessError::Unsupported(format!("cannot download {data_type} values")));
    }
    let needed = desc.num_elements() * data_type.size_in_bytes();
    if data.len() < needed {
        return Err(HarnessError::InvalidConfig(format!(
            "buffer of {} bytes is smaller than the {} bytes the tensor spans",
            data.len(),
            needed
        )));
    }
    device.synchronize()?;
    let bytes = data.copy_to_host()?;
    Ok(logical_offsets(desc.dimensions(), desc.strides())
        .into_iter()
        .map(|offset| element(&bytes, data_type, offset))
        .collect())
}

/// Accepted deviation: `|actual - expected| <= atol + rtol * |expected|`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    pub rtol: f64,
    pub atol: f64,
}

impl Tolerance {
    pub const fn new(rtol: f64, atol: f64) -> Self {
        Self { rtol, atol }
    }

    pub fn for_data_type(data_type: DataType) -> Self {
        match data_type {
            DataType::Double => Self::new(1e-10, 1e-12),
            DataType::Half => Self::new(1e-3, 1e-4),
            _ => Self::new(1e-5, 1e-6),
        }
    }

    /// Both bounds multiplied by `factor`.
    pub fn scaled(self, factor: f64) -> Self {
        Self::new(self.rtol * factor, self.atol * factor)
    }

    pub fn accepts(&self, expected: f64, actual: f64) -> bool {
        (actual - expected).abs() <= self.atol + self.rtol * expected.abs()
    }
}

/// Raise `max` to `value`; NaN is sticky.
fn raise(max: &mut f64, value: f64) {
    if value.is_nan() || value > *max {
        *max = value;
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Comparison {
    pub len: usize,
    pub max_abs_error: f64,
    pub max_rel_error: f64,
    pub mismatches: usize,
    /// Logical index of the first rejected element.
    pub first_mismatch: Option<usize>,
}

impl Comparison {
    pub fn is_match(&self) -> bool {
        self.mismatches == 0
    }

    /// Compare two host value sequences of equal length.
    pub fn of(expected: &[f64], actual: &[f64], tolerance: Tolerance) -> Self {
        let mut report = Comparison { len: expected.len(), ..Default::default() };
        for (index, (&e, &a)) in expected.iter().zip(actual).enumerate() {
            let abs = (a - e).abs();
            raise(&mut report.max_abs_error, abs);
            if e != 0.0 {
                raise(&mut report.max_rel_error, abs / e.abs());
            }
            if !tolerance.accepts(e, a) {
                report.mismatches += 1;
                report.first_mismatch.get_or_insert(index);
            }
        }
        report
    }
}

/// Compare `actual` against `expected` element by element. The two tensors
/// must have the same dimensions; strides and element kinds may differ.
pub fn compare_tensors(
    device: &Device,
    expected: (&TensorDescriptor, &DeviceBuffer),
    actual: (&TensorDescriptor, &DeviceBuffer),
    tolerance: Tolerance,
) -> HarnessResult<Comparison> {
    if expected.0.dimensions() != actual.0.dimensions() {
        return Err(HarnessError::InvalidConfig(format!(
            "cannot compare dimensions {:?} with {:?}",
            expected.0.dimensions(),
            actual.0.dimensions()
        )));
    }
    let e = download_values(device, expected.0, expected.1)?;
    let a = download_values(device, actual.0, actual.1)?;
    let report = Comparison::of(&e, &a, tolerance);
    if !report.is_match() {
        log::warn!(
            "{} of {} elements differ, max abs error {:e}, max rel error {:e}",
            report.mismatches,
            report.len,
            report.max_abs_error,
            report.max_rel_error
        );
    }
    Ok(report)
}
