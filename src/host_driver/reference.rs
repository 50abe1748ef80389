//! Reference convolution on host memory.
//!
//! Tensors are gathered from their strided storage into dense row-major `f64`
//! arrays, convolved with f64 accumulation, and blended back into storage.

use half::f16;

use crate::driver::{ConvolutionLayout, FilterLayout, TensorLayout};
use crate::error::{EngineResult, EngineStatus};
use crate::types::{ConvolutionMode, DataType, TensorFormat};

// ── Element codec ────────────────────────────────────────────────────

/// Read element `index` of a `data_type` array.
pub(super) fn load(bytes: &[u8], data_type: DataType, index: usize) -> EngineResult<f64> {
    let size = data_type.size_in_bytes();
    let raw = bytes
        .get(index * size..(index + 1) * size)
        .ok_or(EngineStatus::InvalidValue)?;
    Ok(match data_type {
        DataType::Float => bytemuck::pod_read_unaligned::<f32>(raw) as f64,
        DataType::Double => bytemuck::pod_read_unaligned::<f64>(raw),
        DataType::Half => f16::from_bits(bytemuck::pod_read_unaligned::<u16>(raw)).to_f64(),
        DataType::Int8 => raw[0] as i8 as f64,
        DataType::Int32 => bytemuck::pod_read_unaligned::<i32>(raw) as f64,
        DataType::Int8x4 => return Err(EngineStatus::NotSupported),
    })
}

/// Write element `index` of a `data_type` array. Integer kinds round and
/// saturate.
pub(super) fn store(
    bytes: &mut [u8],
    data_type: DataType,
    index: usize,
    value: f64,
) -> EngineResult<()> {
    let size = data_type.size_in_bytes();
    let raw = bytes
        .get_mut(index * size..(index + 1) * size)
        .ok_or(EngineStatus::InvalidValue)?;
    match data_type {
        DataType::Float => raw.copy_from_slice(bytemuck::bytes_of(&(value as f32))),
        DataType::Double => raw.copy_from_slice(bytemuck::bytes_of(&value)),
        DataType::Half => raw.copy_from_slice(bytemuck::bytes_of(&f16::from_f64(value).to_bits())),
        DataType::Int8 => raw[0] = value.round().clamp(-128.0, 127.0) as i8 as u8,
        DataType::Int32 => raw.copy_from_slice(bytemuck::bytes_of(&(value.round() as i32))),
        DataType::Int8x4 => return Err(EngineStatus::NotSupported),
    }
    Ok(())
}

/// Read the elements at `offsets`.
pub(super) fn gather(bytes: &[u8], data_type: DataType, offsets: &[usize]) -> EngineResult<Vec<f64>> {
    offsets.iter().map(|&offset| load(bytes, data_type, offset)).collect()
}

/// `dst[offset] = alpha * value + beta * dst[offset]`; the prior value is not
/// read when `beta` is zero.
pub(super) fn blend(
    bytes: &mut [u8],
    data_type: DataType,
    offsets: &[usize],
    values: &[f64],
    alpha: f64,
    beta: f64,
) -> EngineResult<()> {
    for (&offset, &value) in offsets.iter().zip(values) {
        let prior = if beta == 0.0 { 0.0 } else { beta * load(bytes, data_type, offset)? };
        store(bytes, data_type, offset, alpha * value + prior)?;
    }
    Ok(())
}

// ── Layouts ──────────────────────────────────────────────────────────

pub(super) fn packed_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; dims.len()];
    for axis in (0..dims.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * dims[axis + 1];
    }
    strides
}

/// Storage strides of a filter. Dimensions are always given as
/// `[k, c, spatial..]`; NHWC stores channels innermost.
pub(super) fn filter_strides(layout: &FilterLayout) -> Vec<usize> {
    let dims = to_usize(&layout.dimensions);
    match layout.format {
        TensorFormat::Nhwc => {
            let mut strides = vec![0; dims.len()];
            strides[1] = 1;
            let mut acc = dims[1];
            for axis in (2..dims.len()).rev() {
                strides[axis] = acc;
                acc *= dims[axis];
            }
            strides[0] = acc;
            strides
        }
        _ => packed_strides(&dims),
    }
}

/// Storage offset, in elements, of every logical index in row-major order.
pub(super) fn element_offsets(dims: &[usize], strides: &[usize]) -> Vec<usize> {
    let mut offsets = vec![0usize];
    for (&dim, &stride) in dims.iter().zip(strides) {
        offsets = offsets
            .iter()
            .flat_map(|&base| (0..dim).map(move |i| base + i * stride))
            .collect();
    }
    offsets
}

pub(super) fn tensor_offsets(layout: &TensorLayout) -> Vec<usize> {
    element_offsets(&to_usize(&layout.dimensions), &to_usize(&layout.strides))
}

pub(super) fn filter_offsets(layout: &FilterLayout) -> Vec<usize> {
    element_offsets(&to_usize(&layout.dimensions), &filter_strides(layout))
}

pub(super) fn to_usize(values: &[i32]) -> Vec<usize> {
    values.iter().map(|&v| v.max(0) as usize).collect()
}

/// Every multi-index of a box with extents `dims`, row-major.
fn box_indices(dims: &[usize]) -> Vec<Vec<usize>> {
    let mut indices = vec![Vec::with_capacity(dims.len())];
    for &dim in dims {
        indices = indices
            .into_iter()
            .flat_map(|prefix| {
                (0..dim).map(move |i| {
                    let mut index = prefix.clone();
                    index.push(i);
                    index
                })
            })
            .collect();
    }
    indices
}

/// Spatial output extent of one axis.
pub(super) fn output_dim(
    input: i32,
    pad: i32,
    filter: i32,
    stride: i32,
    dilation: i32,
) -> EngineResult<i32> {
    let effective = (filter - 1)
        .checked_mul(dilation)
        .and_then(|v| v.checked_add(1))
        .ok_or(EngineStatus::BadParam)?;
    let span = pad
        .checked_mul(2)
        .and_then(|v| v.checked_add(input))
        .and_then(|v| v.checked_sub(effective))
        .ok_or(EngineStatus::BadParam)?;
    if span < 0 || stride < 1 {
        return Err(EngineStatus::BadParam);
    }
    Ok(span / stride + 1)
}

// ── Geometry ─────────────────────────────────────────────────────────

/// Shape of one convolution problem, validated across its four descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Geometry {
    pub batch: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub groups: usize,
    pub input: Vec<usize>,
    pub filter: Vec<usize>,
    pub output: Vec<usize>,
    pub pad: Vec<usize>,
    pub stride: Vec<usize>,
    pub dilation: Vec<usize>,
    pub flip: bool,
    pub data_type: DataType,
}

impl Geometry {
    pub fn new(
        x: &TensorLayout,
        w: &FilterLayout,
        conv: &ConvolutionLayout,
        y: &TensorLayout,
    ) -> EngineResult<Self> {
        let spatial = conv.rank();
        if x.rank() != spatial + 2 || w.rank() != spatial + 2 || y.rank() != spatial + 2 {
            return Err(EngineStatus::BadParam);
        }
        if x.data_type != w.data_type || x.data_type != y.data_type {
            return Err(EngineStatus::BadParam);
        }
        if !x.data_type.is_floating() {
            return Err(EngineStatus::NotSupported);
        }
        let groups = conv.group_count.max(1);
        let (n, c) = (x.dimensions[0], x.dimensions[1]);
        let k = w.dimensions[0];
        if c != w.dimensions[1] * groups || k % groups != 0 {
            return Err(EngineStatus::BadParam);
        }
        if y.dimensions[0] != n || y.dimensions[1] != k {
            return Err(EngineStatus::BadParam);
        }
        for axis in 0..spatial {
            let expected = output_dim(
                x.dimensions[axis + 2],
                conv.pad[axis],
                w.dimensions[axis + 2],
                conv.stride[axis],
                conv.dilation[axis],
            )?;
            if y.dimensions[axis + 2] != expected {
                return Err(EngineStatus::BadParam);
            }
        }
        Ok(Self {
            batch: n as usize,
            in_channels: c as usize,
            out_channels: k as usize,
            groups: groups as usize,
            input: to_usize(&x.dimensions[2..]),
            filter: to_usize(&w.dimensions[2..]),
            output: to_usize(&y.dimensions[2..]),
            pad: to_usize(&conv.pad),
            stride: to_usize(&conv.stride),
            dilation: to_usize(&conv.dilation),
            flip: conv.mode == ConvolutionMode::Convolution,
            data_type: x.data_type,
        })
    }

    pub fn spatial_rank(&self) -> usize {
        self.input.len()
    }

    pub fn input_spatial(&self) -> usize {
        self.input.iter().product()
    }

    pub fn filter_spatial(&self) -> usize {
        self.filter.iter().product()
    }

    pub fn output_spatial(&self) -> usize {
        self.output.iter().product()
    }

    pub fn channels_per_group(&self) -> usize {
        self.in_channels / self.groups
    }

    pub fn input_len(&self) -> usize {
        self.batch * self.in_channels * self.input_spatial()
    }

    pub fn filter_len(&self) -> usize {
        self.out_channels * self.channels_per_group() * self.filter_spatial()
    }

    pub fn output_len(&self) -> usize {
        self.batch * self.out_channels * self.output_spatial()
    }

    pub fn unit_stride_and_dilation(&self) -> bool {
        self.stride.iter().chain(&self.dilation).all(|&v| v == 1)
    }

    /// Dense row-major input position read by output `out` through filter
    /// tap `tap`, or `None` if it falls into padding.
    fn input_position(&self, out: &[usize], tap: &[usize]) -> Option<usize> {
        let mut linear = 0usize;
        for axis in 0..self.spatial_rank() {
            let pos = (out[axis] * self.stride[axis] + tap[axis] * self.dilation[axis]) as isize
                - self.pad[axis] as isize;
            if pos < 0 || pos as usize >= self.input[axis] {
                return None;
            }
            linear = linear * self.input[axis] + pos as usize;
        }
        Some(linear)
    }

    /// Call `visit(x, w, y)` with the dense indices of every input, filter and
    /// output element triple that contributes to the convolution.
    pub fn for_each_tap(&self, mut visit: impl FnMut(usize, usize, usize)) {
        let outputs = box_indices(&self.output);
        let taps = box_indices(&self.filter);
        let (in_size, tap_count, out_size) = (self.input_spatial(), taps.len(), outputs.len());
        let per_group_in = self.channels_per_group();
        let per_group_out = self.out_channels / self.groups;

        for n in 0..self.batch {
            for k in 0..self.out_channels {
                let group = k / per_group_out;
                for (oi, out) in outputs.iter().enumerate() {
                    let yi = (n * self.out_channels + k) * out_size + oi;
                    for c in 0..per_group_in {
                        let x_base = (n * self.in_channels + group * per_group_in + c) * in_size;
                        let w_base = (k * per_group_in + c) * tap_count;
                        for (ti, tap) in taps.iter().enumerate() {
                            let Some(pos) = self.input_position(out, tap) else {
                                continue;
                            };
                            // Convolution mode reverses every spatial axis of the filter.
                            let wi = if self.flip { tap_count - 1 - ti } else { ti };
                            visit(x_base + pos, w_base + wi, yi);
                        }
                    }
                }
            }
        }
    }
}

// ── Directions ───────────────────────────────────────────────────────

pub(super) fn forward(geometry: &Geometry, x: &[f64], w: &[f64]) -> Vec<f64> {
    let mut y = vec![0.0; geometry.output_len()];
    geometry.for_each_tap(|xi, wi, yi| y[yi] += x[xi] * w[wi]);
    y
}

pub(super) fn backward_data(geometry: &Geometry, w: &[f64], dy: &[f64]) -> Vec<f64> {
    let mut dx = vec![0.0; geometry.input_len()];
    geometry.for_each_tap(|xi, wi, yi| dx[xi] += w[wi] * dy[yi]);
    dx
}

pub(super) fn backward_filter(geometry: &Geometry, x: &[f64], dy: &[f64]) -> Vec<f64> {
    let mut dw = vec![0.0; geometry.filter_len()];
    geometry.for_each_tap(|xi, wi, yi| dw[wi] += x[xi] * dy[yi]);
    dw
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(dims: &[i32]) -> TensorLayout {
        let strides = packed_strides(&to_usize(dims)).into_iter().map(|s| s as i32).collect();
        TensorLayout { data_type: DataType::Double, dimensions: dims.to_vec(), strides }
    }

    fn filter(dims: &[i32]) -> FilterLayout {
        FilterLayout {
            data_type: DataType::Double,
            format: TensorFormat::Nchw,
            dimensions: dims.to_vec(),
        }
    }

    fn conv(pad: &[i32], mode: ConvolutionMode) -> ConvolutionLayout {
        ConvolutionLayout {
            pad: pad.to_vec(),
            stride: vec![1; pad.len()],
            dilation: vec![1; pad.len()],
            mode,
            compute_type: DataType::Double,
            math_type: Default::default(),
            group_count: 1,
        }
    }

    #[test]
    fn test_codec_round_trip_half() {
        let mut bytes = vec![0u8; 4];
        store(&mut bytes, DataType::Half, 1, 1.5).unwrap();
        assert_eq!(load(&bytes, DataType::Half, 1).unwrap(), 1.5);
        assert_eq!(load(&bytes, DataType::Half, 2), Err(EngineStatus::InvalidValue));
    }

    #[test]
    fn test_integer_store_saturates() {
        let mut bytes = vec![0u8; 1];
        store(&mut bytes, DataType::Int8, 0, 300.0).unwrap();
        assert_eq!(load(&bytes, DataType::Int8, 0).unwrap(), 127.0);
    }

    #[test]
    fn test_element_offsets_follow_strides() {
        assert_eq!(element_offsets(&[2, 3], &[3, 1]), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(element_offsets(&[2, 3], &[1, 2]), vec![0, 2, 4, 1, 3, 5]);
        assert_eq!(element_offsets(&[2, 2], &[0, 1]), vec![0, 1, 0, 1]);
    }

    #[test]
    fn test_nhwc_filter_strides() {
        let layout = FilterLayout {
            data_type: DataType::Float,
            format: TensorFormat::Nhwc,
            dimensions: vec![4, 3, 2, 5],
        };
        assert_eq!(filter_strides(&layout), vec![30, 1, 15, 3]);
    }

    #[test]
    fn test_output_dim() {
        assert_eq!(output_dim(4, 0, 3, 1, 1), Ok(2));
        assert_eq!(output_dim(7, 1, 3, 2, 1), Ok(4));
        assert_eq!(output_dim(7, 0, 3, 1, 2), Ok(3));
        assert_eq!(output_dim(2, 0, 3, 1, 1), Err(EngineStatus::BadParam));
        assert_eq!(output_dim(4, i32::MAX / 2, 3, 1, 1), Err(EngineStatus::BadParam));
        assert_eq!(output_dim(4, 0, i32::MAX, 1, 2), Err(EngineStatus::BadParam));
    }

    #[test]
    fn test_forward_cross_correlation_1d() {
        let geometry = Geometry::new(
            &tensor(&[1, 1, 4]),
            &filter(&[1, 1, 2]),
            &conv(&[0], ConvolutionMode::CrossCorrelation),
            &tensor(&[1, 1, 3]),
        )
        .unwrap();
        let y = forward(&geometry, &[1.0, 2.0, 3.0, 4.0], &[1.0, 10.0]);
        assert_eq!(y, vec![21.0, 32.0, 43.0]);
    }

    #[test]
    fn test_convolution_mode_flips_filter() {
        let geometry = Geometry::new(
            &tensor(&[1, 1, 4]),
            &filter(&[1, 1, 2]),
            &conv(&[0], ConvolutionMode::Convolution),
            &tensor(&[1, 1, 3]),
        )
        .unwrap();
        let y = forward(&geometry, &[1.0, 2.0, 3.0, 4.0], &[1.0, 10.0]);
        assert_eq!(y, vec![12.0, 23.0, 34.0]);
    }

    #[test]
    fn test_padding_reads_zero() {
        let geometry = Geometry::new(
            &tensor(&[1, 1, 2]),
            &filter(&[1, 1, 3]),
            &conv(&[1], ConvolutionMode::CrossCorrelation),
            &tensor(&[1, 1, 2]),
        )
        .unwrap();
        let y = forward(&geometry, &[1.0, 2.0], &[1.0, 1.0, 1.0]);
        assert_eq!(y, vec![3.0, 3.0]);
    }

    #[test]
    fn test_adjoint_identities() {
        // <conv(x, w), dy> == <x, bwd_data(w, dy)> == <w, bwd_filter(x, dy)>
        let geometry = Geometry::new(
            &tensor(&[2, 2, 3, 3]),
            &filter(&[3, 2, 2, 2]),
            &conv(&[1, 0], ConvolutionMode::Convolution),
            &tensor(&[2, 3, 4, 2]),
        )
        .unwrap();
        let x: Vec<f64> = (0..geometry.input_len()).map(|i| (i % 7) as f64 - 3.0).collect();
        let w: Vec<f64> = (0..geometry.filter_len()).map(|i| (i % 5) as f64 * 0.5).collect();
        let dy: Vec<f64> = (0..geometry.output_len()).map(|i| (i % 3) as f64 + 1.0).collect();
        let dot = |a: &[f64], b: &[f64]| a.iter().zip(b).map(|(p, q)| p * q).sum::<f64>();

        let lhs = dot(&forward(&geometry, &x, &w), &dy);
        assert!((lhs - dot(&x, &backward_data(&geometry, &w, &dy))).abs() < 1e-9);
        assert!((lhs - dot(&w, &backward_filter(&geometry, &x, &dy))).abs() < 1e-9);
    }

    #[test]
    fn test_geometry_rejects_mismatched_output() {
        let err = Geometry::new(
            &tensor(&[1, 1, 4, 4]),
            &filter(&[1, 1, 3, 3]),
            &conv(&[0, 0], ConvolutionMode::Convolution),
            &tensor(&[1, 1, 3, 3]),
        )
        .unwrap_err();
        assert_eq!(err, EngineStatus::BadParam);
    }
}
