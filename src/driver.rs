//! Convolution engine interface.
//!
//! [`Driver`] is the accelerator boundary: every descriptor, memory and
//! convolution call of the harness goes through it. Handles are opaque
//! integers owned by the engine; the harness wraps them in
//! [`Owned`](crate::handle::Owned) so that each is released exactly once.

use std::fmt;
use std::time::Duration;

use crate::algorithm::{BwdDataAlgo, BwdFilterAlgo, FwdAlgo};
use crate::error::EngineResult;
use crate::types::{ConvolutionMode, DataType, MathType, TensorFormat};

// ── Raw handles ──────────────────────────────────────────────────────

macro_rules! raw_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub u64);
    };
}

raw_handle!(
    /// Engine context handle.
    RawEngine
);
raw_handle!(
    /// Tensor descriptor handle.
    RawTensor
);
raw_handle!(
    /// Filter descriptor handle.
    RawFilter
);
raw_handle!(
    /// Convolution descriptor handle.
    RawConvolution
);

/// Address of a device allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// ── Structural summaries ─────────────────────────────────────────────

/// Everything the engine reports about a tensor descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorLayout {
    pub data_type: DataType,
    pub dimensions: Vec<i32>,
    pub strides: Vec<i32>,
}

impl TensorLayout {
    pub fn rank(&self) -> usize {
        self.dimensions.len()
    }

    /// Address span of the tensor in elements: one past the offset of the last
    /// addressable element. Equals the dimension product for packed layouts and
    /// differs for overlapping or padded strides.
    pub fn num_elements(&self) -> usize {
        self.dimensions
            .iter()
            .zip(&self.strides)
            .fold(1usize, |acc, (&dim, &stride)| {
                acc + (dim as usize - 1) * stride as usize
            })
    }

    pub fn size_in_bytes(&self) -> usize {
        self.num_elements() * self.data_type.size_in_bytes()
    }
}

/// Everything the engine reports about a filter descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterLayout {
    pub data_type: DataType,
    pub format: TensorFormat,
    pub dimensions: Vec<i32>,
}

impl FilterLayout {
    pub fn rank(&self) -> usize {
        self.dimensions.len()
    }

    pub fn num_elements(&self) -> usize {
        self.dimensions.iter().map(|&d| d as usize).product()
    }
}

/// Everything the engine reports about a convolution descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvolutionLayout {
    pub pad: Vec<i32>,
    pub stride: Vec<i32>,
    pub dilation: Vec<i32>,
    pub mode: ConvolutionMode,
    pub compute_type: DataType,
    pub math_type: MathType,
    pub group_count: i32,
}

impl ConvolutionLayout {
    /// Number of spatial axes.
    pub fn rank(&self) -> usize {
        self.pad.len()
    }
}

// ── Call arguments ───────────────────────────────────────────────────

/// Scaling factor storage for `alpha`/`beta`.
///
/// The engine reads the factors as `f64` for double-precision descriptors and
/// as `f32` otherwise; the tag records which storage a call was given.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalingFactor {
    Float(f32),
    Double(f64),
}

impl ScalingFactor {
    /// The storage the engine expects for a descriptor of kind `data_type`.
    pub fn for_data_type(value: f64, data_type: DataType) -> Self {
        match data_type {
            DataType::Double => Self::Double(value),
            _ => Self::Float(value as f32),
        }
    }

    pub fn value(self) -> f64 {
        match self {
            Self::Float(v) => v as f64,
            Self::Double(v) => v,
        }
    }

    /// Whether this factor has the storage the engine expects for `data_type`.
    pub fn matches(self, data_type: DataType) -> bool {
        match self {
            Self::Double(_) => data_type == DataType::Double,
            Self::Float(_) => data_type != DataType::Double,
        }
    }
}

/// A tensor descriptor together with its data.
#[derive(Debug, Clone, Copy)]
pub struct TensorArg {
    pub desc: RawTensor,
    pub data: DevicePtr,
}

/// A filter descriptor together with its data.
#[derive(Debug, Clone, Copy)]
pub struct FilterArg {
    pub desc: RawFilter,
    pub data: DevicePtr,
}

/// Scratch memory handed to an algorithm.
#[derive(Debug, Clone, Copy)]
pub struct WorkspaceArg {
    pub data: DevicePtr,
    pub size: usize,
}

/// One benchmark record returned by the engine's find calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlgoPerf<A> {
    pub algo: A,
    /// Status of running `algo`; `Err` entries are still reported.
    pub status: EngineResult<()>,
    pub time: Duration,
    pub memory: usize,
}

/// Version of the engine library, e.g. `7.6.5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EngineVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl EngineVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Decode the engine's packed `major*1000 + minor*100 + patch` form.
    pub fn from_packed(version: usize) -> Self {
        Self {
            major: (version / 1000) as u32,
            minor: (version % 1000 / 100) as u32,
            patch: (version % 100) as u32,
        }
    }
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

// ── Driver ───────────────────────────────────────────────────────────

/// The accelerator-side convolution engine.
///
/// Argument order mirrors the data flow of each direction: forward reads
/// `(x, w)` and writes `y`; backward-data reads `(w, dy)` and writes `dx`;
/// backward-filter reads `(x, dy)` and writes `dw`.
pub trait Driver: Send + Sync {
    // ── Environment ──────────────────────────────────────────────

    /// Name of the engine implementation, for logs.
    fn name(&self) -> &str;

    fn version(&self) -> EngineVersion;

    /// Version of the accelerator runtime the engine was built against.
    fn runtime_version(&self) -> EngineVersion;

    fn device_count(&self) -> EngineResult<i32>;

    fn set_device(&self, ordinal: i32) -> EngineResult<()>;

    fn device_name(&self) -> EngineResult<String>;

    /// `(free, total)` device memory in bytes.
    fn mem_get_info(&self) -> EngineResult<(usize, usize)>;

    /// Block until all enqueued device work has completed.
    fn synchronize(&self) -> EngineResult<()>;

    // ── Memory ───────────────────────────────────────────────────

    fn malloc(&self, bytes: usize) -> EngineResult<DevicePtr>;

    fn free(&self, ptr: DevicePtr) -> EngineResult<()>;

    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> EngineResult<()>;

    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> EngineResult<()>;

    /// Element-wise `dst[i] = scale * src[i]` with a numeric cast, for
    /// `count` elements.
    fn convert_device_data(
        &self,
        scale: f64,
        dst: DevicePtr,
        dst_type: DataType,
        src: DevicePtr,
        src_type: DataType,
        count: usize,
    ) -> EngineResult<()>;

    // ── Engine handle ────────────────────────────────────────────

    fn create_engine(&self) -> EngineResult<RawEngine>;

    fn destroy_engine(&self, handle: RawEngine) -> EngineResult<()>;

    // ── Tensor descriptors ───────────────────────────────────────

    fn create_tensor_descriptor(&self) -> EngineResult<RawTensor>;

    fn destroy_tensor_descriptor(&self, desc: RawTensor) -> EngineResult<()>;

    fn set_tensor_nd(
        &self,
        desc: RawTensor,
        data_type: DataType,
        dimensions: &[i32],
        strides: &[i32],
    ) -> EngineResult<()>;

    fn set_tensor_4d(
        &self,
        desc: RawTensor,
        format: TensorFormat,
        data_type: DataType,
        dimensions: [i32; 4],
    ) -> EngineResult<()>;

    fn get_tensor_nd(&self, desc: RawTensor) -> EngineResult<TensorLayout>;

    fn tensor_size_in_bytes(&self, desc: RawTensor) -> EngineResult<usize>;

    // ── Filter descriptors ───────────────────────────────────────

    fn create_filter_descriptor(&self) -> EngineResult<RawFilter>;

    fn destroy_filter_descriptor(&self, desc: RawFilter) -> EngineResult<()>;

    fn set_filter_nd(
        &self,
        desc: RawFilter,
        data_type: DataType,
        format: TensorFormat,
        dimensions: &[i32],
    ) -> EngineResult<()>;

    fn get_filter_nd(&self, desc: RawFilter) -> EngineResult<FilterLayout>;

    // ── Convolution descriptors ──────────────────────────────────

    fn create_convolution_descriptor(&self) -> EngineResult<RawConvolution>;

    fn destroy_convolution_descriptor(&self, desc: RawConvolution) -> EngineResult<()>;

    #[allow(clippy::too_many_arguments)]
    fn set_convolution_nd(
        &self,
        desc: RawConvolution,
        pad: &[i32],
        stride: &[i32],
        dilation: &[i32],
        mode: ConvolutionMode,
        compute_type: DataType,
    ) -> EngineResult<()>;

    fn set_convolution_group_count(&self, desc: RawConvolution, groups: i32) -> EngineResult<()>;

    fn set_convolution_math_type(&self, desc: RawConvolution, math: MathType) -> EngineResult<()>;

    fn get_convolution_nd(&self, desc: RawConvolution) -> EngineResult<ConvolutionLayout>;

    /// Closed-form output shape `[n, c, h, w]` of a 2-d forward convolution.
    fn convolution_2d_forward_output_dim(
        &self,
        conv: RawConvolution,
        input: RawTensor,
        filter: RawFilter,
    ) -> EngineResult<[i32; 4]>;

    // ── Workspace queries ────────────────────────────────────────

    fn forward_workspace_size(
        &self,
        handle: RawEngine,
        x: RawTensor,
        w: RawFilter,
        conv: RawConvolution,
        y: RawTensor,
        algo: FwdAlgo,
    ) -> EngineResult<usize>;

    fn backward_data_workspace_size(
        &self,
        handle: RawEngine,
        w: RawFilter,
        dy: RawTensor,
        conv: RawConvolution,
        dx: RawTensor,
        algo: BwdDataAlgo,
    ) -> EngineResult<usize>;

    fn backward_filter_workspace_size(
        &self,
        handle: RawEngine,
        x: RawTensor,
        dy: RawTensor,
        conv: RawConvolution,
        dw: RawFilter,
        algo: BwdFilterAlgo,
    ) -> EngineResult<usize>;

    // ── Benchmarking ─────────────────────────────────────────────

    /// Run candidates within `workspace` and return at most `requested`
    /// records, fastest first.
    #[allow(clippy::too_many_arguments)]
    fn find_forward_algorithm(
        &self,
        handle: RawEngine,
        x: TensorArg,
        w: FilterArg,
        conv: RawConvolution,
        y: TensorArg,
        requested: usize,
        workspace: WorkspaceArg,
    ) -> EngineResult<Vec<AlgoPerf<FwdAlgo>>>;

    #[allow(clippy::too_many_arguments)]
    fn find_backward_data_algorithm(
        &self,
        handle: RawEngine,
        w: FilterArg,
        dy: TensorArg,
        conv: RawConvolution,
        dx: TensorArg,
        requested: usize,
        workspace: WorkspaceArg,
    ) -> EngineResult<Vec<AlgoPerf<BwdDataAlgo>>>;

    #[allow(clippy::too_many_arguments)]
    fn find_backward_filter_algorithm(
        &self,
        handle: RawEngine,
        x: TensorArg,
        dy: TensorArg,
        conv: RawConvolution,
        dw: FilterArg,
        requested: usize,
        workspace: WorkspaceArg,
    ) -> EngineResult<Vec<AlgoPerf<BwdFilterAlgo>>>;

    // ── Execution ────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn convolution_forward(
        &self,
        handle: RawEngine,
        alpha: ScalingFactor,
        x: TensorArg,
        w: FilterArg,
        conv: RawConvolution,
        algo: FwdAlgo,
        workspace: WorkspaceArg,
        beta: ScalingFactor,
        y: TensorArg,
    ) -> EngineResult<()>;

    #[allow(clippy::too_many_arguments)]
    fn convolution_backward_data(
        &self,
        handle: RawEngine,
        alpha: ScalingFactor,
        w: FilterArg,
        dy: TensorArg,
        conv: RawConvolution,
        algo: BwdDataAlgo,
        workspace: WorkspaceArg,
        beta: ScalingFactor,
        dx: TensorArg,
    ) -> EngineResult<()>;

    #[allow(clippy::too_many_arguments)]
    fn convolution_backward_filter(
        &self,
        handle: RawEngine,
        alpha: ScalingFactor,
        x: TensorArg,
        dy: TensorArg,
        conv: RawConvolution,
        algo: BwdFilterAlgo,
        workspace: WorkspaceArg,
        beta: ScalingFactor,
        dw: FilterArg,
    ) -> EngineResult<()>;

    /// `dst = alpha * src + beta * dst` between two layouts of the same shape
    /// and element kind.
    fn transform_tensor(
        &self,
        handle: RawEngine,
        alpha: ScalingFactor,
        src: TensorArg,
        beta: ScalingFactor,
        dst: TensorArg,
    ) -> EngineResult<()>;
}
