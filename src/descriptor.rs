//! Descriptor builder.
//!
//! Turns configuration records into fully set engine descriptors. Each
//! descriptor owns its handle and caches the structural summary the engine
//! reports for it; equality compares those summaries, never handles.

use std::sync::Arc;

use crate::config::{ConvolutionConfig, ConvolutionParams, FilterConfig, TensorConfig};
use crate::device::Device;
use crate::driver::{
    ConvolutionLayout, Driver, FilterLayout, RawConvolution, RawFilter, RawTensor, TensorLayout,
};
use crate::error::{fatal, HarnessError, HarnessResult};
use crate::handle::{ConvolutionKind, FilterKind, Owned, TensorKind};
use crate::types::{ConvolutionMode, DataType, MathType, TensorFormat, DIM_MAX};

// ── Descriptors ──────────────────────────────────────────────────────

#[derive(Debug)]
pub struct TensorDescriptor {
    handle: Owned<TensorKind>,
    layout: TensorLayout,
}

impl TensorDescriptor {
    fn new(handle: Owned<TensorKind>) -> HarnessResult<Self> {
        let layout = handle.driver().get_tensor_nd(handle.get())?;
        Ok(Self { handle, layout })
    }

    pub fn raw(&self) -> RawTensor {
        self.handle.get()
    }

    pub fn layout(&self) -> &TensorLayout {
        &self.layout
    }

    pub fn data_type(&self) -> DataType {
        self.layout.data_type
    }

    pub fn rank(&self) -> usize {
        self.layout.rank()
    }

    pub fn dimensions(&self) -> &[i32] {
        &self.layout.dimensions
    }

    pub fn strides(&self) -> &[i32] {
        &self.layout.strides
    }

    /// Address span in elements, see [`TensorLayout::num_elements`].
    pub fn num_elements(&self) -> usize {
        self.layout.num_elements()
    }

    /// Size the engine reports for the tensor's storage.
    pub fn size_in_bytes(&self) -> HarnessResult<usize> {
        Ok(self.handle.driver().tensor_size_in_bytes(self.raw())?)
    }
}

impl PartialEq for TensorDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.layout == other.layout
    }
}

#[derive(Debug)]
pub struct FilterDescriptor {
    handle: Owned<FilterKind>,
    layout: FilterLayout,
}

impl FilterDescriptor {
    fn new(handle: Owned<FilterKind>) -> HarnessResult<Self> {
        let layout = handle.driver().get_filter_nd(handle.get())?;
        Ok(Self { handle, layout })
    }

    pub fn raw(&self) -> RawFilter {
        self.handle.get()
    }

    pub fn layout(&self) -> &FilterLayout {
        &self.layout
    }

    pub fn data_type(&self) -> DataType {
        self.layout.data_type
    }

    pub fn format(&self) -> TensorFormat {
        self.layout.format
    }

    pub fn rank(&self) -> usize {
        self.layout.rank()
    }

    pub fn dimensions(&self) -> &[i32] {
        &self.layout.dimensions
    }

    /// Product of the dimensions; filters are always packed.
    pub fn num_elements(&self) -> usize {
        self.layout.num_elements()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.num_elements() * self.data_type().size_in_bytes()
    }
}

impl PartialEq for FilterDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.layout == other.layout
    }
}

#[derive(Debug)]
pub struct ConvolutionDescriptor {
    handle: Owned<ConvolutionKind>,
    layout: ConvolutionLayout,
}

impl ConvolutionDescriptor {
    fn new(handle: Owned<ConvolutionKind>) -> HarnessResult<Self> {
        let layout = handle.driver().get_convolution_nd(handle.get())?;
        Ok(Self { handle, layout })
    }

    pub fn raw(&self) -> RawConvolution {
        self.handle.get()
    }

    pub fn layout(&self) -> &ConvolutionLayout {
        &self.layout
    }

    /// Number of spatial axes.
    pub fn rank(&self) -> usize {
        self.layout.rank()
    }

    pub fn pad(&self) -> &[i32] {
        &self.layout.pad
    }

    pub fn stride(&self) -> &[i32] {
        &self.layout.stride
    }

    pub fn dilation(&self) -> &[i32] {
        &self.layout.dilation
    }

    pub fn mode(&self) -> ConvolutionMode {
        self.layout.mode
    }

    pub fn compute_type(&self) -> DataType {
        self.layout.compute_type
    }

    pub fn math_type(&self) -> MathType {
        self.layout.math_type
    }

    pub fn group_count(&self) -> i32 {
        self.layout.group_count
    }
}

/// Math type and group count do not take part.
impl PartialEq for ConvolutionDescriptor {
    fn eq(&self, other: &Self) -> bool {
        let (a, b) = (&self.layout, &other.layout);
        a.pad == b.pad
            && a.stride == b.stride
            && a.dilation == b.dilation
            && a.mode == b.mode
            && a.compute_type == b.compute_type
    }
}

// ── Builders ─────────────────────────────────────────────────────────

/// Row-major strides of a contiguous tensor: each axis strides over the
/// product of all more-minor dimensions. The full element count must fit an
/// `i32`.
pub fn fully_packed_strides(dimensions: &[i32]) -> HarnessResult<Vec<i32>> {
    let mut strides = vec![0; dimensions.len()];
    let mut stride: i32 = 1;
    for axis in (0..dimensions.len()).rev() {
        strides[axis] = stride;
        stride = stride.checked_mul(dimensions[axis]).ok_or_else(|| {
            HarnessError::InvalidConfig(format!(
                "element count of dimensions {dimensions:?} overflows i32"
            ))
        })?;
    }
    Ok(strides)
}

fn new_tensor(driver: &Arc<dyn Driver>) -> HarnessResult<Owned<TensorKind>> {
    let raw = driver.create_tensor_descriptor()?;
    Ok(Owned::acquire(Arc::clone(driver), raw))
}

pub fn build_tensor(device: &Device, config: &TensorConfig) -> HarnessResult<TensorDescriptor> {
    let data_type = config
        .data_type
        .ok_or_else(|| HarnessError::InvalidConfig("tensor data type is required".into()))?;
    let rank = config.dimensions.len();
    if rank > DIM_MAX {
        return Err(HarnessError::InvalidConfig(format!(
            "tensor rank {rank} exceeds the maximum of {DIM_MAX}"
        )));
    }
    let driver = device.driver();
    let handle = new_tensor(driver)?;
    match (config.strides.is_empty(), config.format) {
        (false, None) => {
            if config.strides.len() != rank {
                return Err(HarnessError::InvalidConfig(format!(
                    "expected {} strides, got {}",
                    rank,
                    config.strides.len()
                )));
            }
            driver.set_tensor_nd(handle.get(), data_type, &config.dimensions, &config.strides)?;
        }
        (true, Some(format)) if rank == 4 => {
            let dims = [
                config.dimensions[0],
                config.dimensions[1],
                config.dimensions[2],
                config.dimensions[3],
            ];
            driver.set_tensor_4d(handle.get(), format, data_type, dims)?;
        }
        (true, Some(format)) => {
            if format != TensorFormat::Nchw {
                fatal!("Can only create {} for non-4D packed tensors, got {}", TensorFormat::Nchw, format);
            }
            let strides = fully_packed_strides(&config.dimensions)?;
            driver.set_tensor_nd(handle.get(), data_type, &config.dimensions, &strides)?;
        }
        _ => {
            return Err(HarnessError::InvalidConfig(
                "expected exactly one of strides and format".into(),
            ))
        }
    }
    TensorDescriptor::new(handle)
}

pub fn build_filter(device: &Device, config: &FilterConfig) -> HarnessResult<FilterDescriptor> {
    let data_type = config
        .data_type
        .ok_or_else(|| HarnessError::InvalidConfig("filter data type is required".into()))?;
    let format = config
        .format
        .ok_or_else(|| HarnessError::InvalidConfig("filter format is required".into()))?;
    let driver = device.driver();
    let raw = driver.create_filter_descriptor()?;
    let handle = Owned::<FilterKind>::acquire(Arc::clone(driver), raw);
    driver.set_filter_nd(handle.get(), data_type, format, &config.dimensions)?;
    FilterDescriptor::new(handle)
}

/// `values` extended to `rank` entries with `fill`.
fn padded(values: &[i32], rank: usize, fill: i32) -> Vec<i32> {
    let mut result = values.to_vec();
    result.resize(rank, fill);
    result
}

pub fn build_convolution(
    device: &Device,
    params: &ConvolutionParams,
) -> HarnessResult<ConvolutionDescriptor> {
    let compute_type = params
        .compute_type
        .ok_or_else(|| HarnessError::InvalidConfig("convolution compute type is required".into()))?;
    let rank = params.pad.len().max(params.stride.len()).max(params.dilation.len());
    let pad = padded(&params.pad, rank, 0);
    let stride = padded(&params.stride, rank, 1);
    let dilation = padded(&params.dilation, rank, 1);

    let driver = device.driver();
    let capabilities = device.capabilities();
    let raw = driver.create_convolution_descriptor()?;
    let handle = Owned::<ConvolutionKind>::acquire(Arc::clone(driver), raw);
    driver.set_convolution_nd(handle.get(), &pad, &stride, &dilation, params.mode, compute_type)?;

    if let Some(groups) = params.group_count.filter(|&g| g > 0) {
        if capabilities.grouped_convolution {
            driver.set_convolution_group_count(handle.get(), groups)?;
        } else if groups > 1 {
            return Err(HarnessError::Unsupported(format!(
                "Grouped convolution requires engine version 7, running {}",
                driver.version()
            )));
        }
    }
    if capabilities.math_type {
        driver.set_convolution_math_type(handle.get(), params.math_type)?;
    } else if params.math_type != MathType::Default {
        log::warn!(
            "Math type {} requires engine version 7, ignored on {}",
            params.math_type.name(),
            driver.version()
        );
    }
    ConvolutionDescriptor::new(handle)
}

/// Output tensor of a forward convolution of `input` with `filter`.
///
/// Rank-4 inputs use the engine's closed form. Other ranks only support
/// packed NCHW outputs of unit-stride, undilated, ungrouped convolutions.
pub fn build_output(
    device: &Device,
    format: TensorFormat,
    input: &TensorDescriptor,
    filter: &FilterDescriptor,
    convolution: &ConvolutionDescriptor,
) -> HarnessResult<TensorDescriptor> {
    let driver = device.driver();
    if input.rank() == 4 {
        let dims = driver.convolution_2d_forward_output_dim(
            convolution.raw(),
            input.raw(),
            filter.raw(),
        )?;
        let handle = new_tensor(driver)?;
        driver.set_tensor_4d(handle.get(), format, input.data_type(), dims)?;
        return TensorDescriptor::new(handle);
    }

    if format != TensorFormat::Nchw {
        return Err(HarnessError::Unsupported(
            "Can only create NCHW for non-4D output descriptor.".into(),
        ));
    }
    if filter.rank() != input.rank() || convolution.rank() + 2 != input.rank() {
        return Err(HarnessError::InvalidConfig(format!(
            "rank mismatch: input {}, filter {}, convolution {} spatial",
            input.rank(),
            filter.rank(),
            convolution.rank()
        )));
    }
    if filter.format() != TensorFormat::Nchw {
        fatal!("non-4D output requires an NCHW filter, got {}", filter.format());
    }
    let all_ones = |values: &[i32]| values.iter().all(|&v| v == 1);
    if !all_ones(convolution.stride()) || !all_ones(convolution.dilation()) {
        fatal!(
            "non-4D output requires unit stride and dilation, got {:?} and {:?}",
            convolution.stride(),
            convolution.dilation()
        );
    }
    if convolution.group_count() != 1 {
        fatal!("non-4D output requires a group count of 1, got {}", convolution.group_count());
    }

    let mut dims = vec![input.dimensions()[0], filter.dimensions()[0]];
    for axis in 2..input.rank() {
        let extent = convolution.pad()[axis - 2]
            .checked_mul(2)
            .and_then(|pad| pad.checked_add(input.dimensions()[axis]))
            .and_then(|padded| padded.checked_sub(filter.dimensions()[axis] - 1))
            .ok_or_else(|| {
                HarnessError::InvalidConfig(format!("padded extent overflows i32 along axis {axis}"))
            })?;
        if extent < 1 {
            return Err(HarnessError::InvalidConfig(format!(
                "filter does not fit the padded input along axis {axis}"
            )));
        }
        dims.push(extent);
    }
    let strides = fully_packed_strides(&dims)?;
    let handle = new_tensor(driver)?;
    driver.set_tensor_nd(handle.get(), input.data_type(), &dims, &strides)?;
    TensorDescriptor::new(handle)
}

/// The config's explicit output if present, otherwise the derived one in the
/// input's format.
pub fn build_output_for(
    device: &Device,
    config: &ConvolutionConfig,
    input: &TensorDescriptor,
    filter: &FilterDescriptor,
    convolution: &ConvolutionDescriptor,
) -> HarnessResult<TensorDescriptor> {
    match &config.output {
        Some(output) => build_tensor(device, output),
        None => {
            let format = config.input.format.unwrap_or_default();
            build_output(device, format, input, filter, convolution)
        }
    }
}
