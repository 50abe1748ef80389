//! Host reference engine.
//!
//! [`HostDriver`] implements [`Driver`] on host memory: descriptor tables,
//! a device-memory model with a fixed capacity, per-algorithm support and
//! workspace cost, and a reference convolution for all three directions. It
//! stands in for the accelerator library wherever no device is present.

mod cost;
mod reference;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::algorithm::{BwdDataAlgo, BwdFilterAlgo, ConvolutionAlgo, FwdAlgo};
use crate::driver::{
    AlgoPerf, ConvolutionLayout, DevicePtr, Driver, EngineVersion, FilterArg, FilterLayout,
    RawConvolution, RawEngine, RawFilter, RawTensor, ScalingFactor, TensorArg, TensorLayout,
    WorkspaceArg,
};
use crate::error::{EngineResult, EngineStatus};
use crate::types::{ConvolutionMode, DataType, MathType, TensorFormat, DIM_MAX};

use reference::Geometry;

/// First address handed out by the allocator.
const BASE_ADDRESS: u64 = 0x7f00_0000_0000;
/// Allocation granularity.
const ALIGNMENT: u64 = 256;
/// Fill pattern of fresh allocations: unwritten floats read back as NaN.
const UNINITIALIZED: u8 = 0xff;

#[derive(Debug, Clone)]
pub struct HostDriverConfig {
    pub name: String,
    pub version: EngineVersion,
    pub runtime_version: EngineVersion,
    pub device_count: i32,
    pub device_name: String,
    /// Device memory capacity in bytes.
    pub total_memory: usize,
    /// Algorithms reported as unsupported regardless of the problem.
    pub unsupported: Vec<ConvolutionAlgo>,
}

impl Default for HostDriverConfig {
    fn default() -> Self {
        Self {
            name: "host-reference".to_string(),
            version: EngineVersion::new(7, 6, 5),
            runtime_version: EngineVersion::new(10, 2, 0),
            device_count: 1,
            device_name: "Host reference device".to_string(),
            total_memory: 1 << 30,
            unsupported: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct ConvolutionState {
    layout: Option<ConvolutionLayout>,
    group_count: i32,
    math_type: MathType,
}

impl ConvolutionState {
    fn layout(&self) -> EngineResult<ConvolutionLayout> {
        let mut layout = self.layout.clone().ok_or(EngineStatus::BadParam)?;
        layout.group_count = self.group_count;
        layout.math_type = self.math_type;
        Ok(layout)
    }
}

/// Layouts of one convolution problem, read out of the tables.
struct Problem {
    x: TensorLayout,
    w: FilterLayout,
    y: TensorLayout,
    geometry: Geometry,
}

#[derive(Debug)]
struct HostState {
    next_handle: u64,
    engines: HashSet<u64>,
    tensors: HashMap<u64, Option<TensorLayout>>,
    filters: HashMap<u64, Option<FilterLayout>>,
    convolutions: HashMap<u64, ConvolutionState>,
    memory: BTreeMap<u64, Vec<u8>>,
    next_address: u64,
    allocated: usize,
    device: i32,
}

impl HostState {
    fn new() -> Self {
        Self {
            next_handle: 0,
            engines: HashSet::new(),
            tensors: HashMap::new(),
            filters: HashMap::new(),
            convolutions: HashMap::new(),
            memory: BTreeMap::new(),
            next_address: BASE_ADDRESS,
            allocated: 0,
            device: 0,
        }
    }

    fn issue(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn check_engine(&self, handle: RawEngine) -> EngineResult<()> {
        if self.engines.contains(&handle.0) {
            Ok(())
        } else {
            Err(EngineStatus::BadParam)
        }
    }

    fn tensor(&self, desc: RawTensor) -> EngineResult<&TensorLayout> {
        self.tensors
            .get(&desc.0)
            .and_then(Option::as_ref)
            .ok_or(EngineStatus::BadParam)
    }

    fn filter(&self, desc: RawFilter) -> EngineResult<&FilterLayout> {
        self.filters
            .get(&desc.0)
            .and_then(Option::as_ref)
            .ok_or(EngineStatus::BadParam)
    }

    fn convolution(&self, desc: RawConvolution) -> EngineResult<ConvolutionLayout> {
        self.convolutions.get(&desc.0).ok_or(EngineStatus::BadParam)?.layout()
    }

    fn problem(
        &self,
        x: RawTensor,
        w: RawFilter,
        conv: RawConvolution,
        y: RawTensor,
    ) -> EngineResult<Problem> {
        let (x, w, y) = (self.tensor(x)?.clone(), self.filter(w)?.clone(), self.tensor(y)?.clone());
        let geometry = Geometry::new(&x, &w, &self.convolution(conv)?, &y)?;
        Ok(Problem { x, w, y, geometry })
    }

    // ── Memory ───────────────────────────────────────────────────

    /// Base address and offset of `len` bytes at `ptr` inside one allocation.
    fn locate(&self, ptr: DevicePtr, len: usize) -> EngineResult<(u64, usize)> {
        let (&base, block) = self
            .memory
            .range(..=ptr.0)
            .next_back()
            .ok_or(EngineStatus::InvalidValue)?;
        let offset = (ptr.0 - base) as usize;
        if offset + len > block.len() {
            return Err(EngineStatus::InvalidValue);
        }
        Ok((base, offset))
    }

    fn bytes(&self, ptr: DevicePtr, len: usize) -> EngineResult<&[u8]> {
        let (base, offset) = self.locate(ptr, len)?;
        Ok(&self.memory[&base][offset..offset + len])
    }

    fn bytes_mut(&mut self, ptr: DevicePtr, len: usize) -> EngineResult<&mut [u8]> {
        let (base, offset) = self.locate(ptr, len)?;
        let block = self.memory.get_mut(&base).ok_or(EngineStatus::InvalidValue)?;
        Ok(&mut block[offset..offset + len])
    }

    fn read_tensor(&self, ptr: DevicePtr, layout: &TensorLayout) -> EngineResult<Vec<f64>> {
        let bytes = self.bytes(ptr, layout.size_in_bytes())?;
        reference::gather(bytes, layout.data_type, &reference::tensor_offsets(layout))
    }

    fn read_filter(&self, ptr: DevicePtr, layout: &FilterLayout) -> EngineResult<Vec<f64>> {
        let bytes = self.bytes(ptr, layout.num_elements() * layout.data_type.size_in_bytes())?;
        reference::gather(bytes, layout.data_type, &reference::filter_offsets(layout))
    }

    fn write_tensor(
        &mut self,
        ptr: DevicePtr,
        layout: &TensorLayout,
        values: &[f64],
        alpha: ScalingFactor,
        beta: ScalingFactor,
    ) -> EngineResult<()> {
        let offsets = reference::tensor_offsets(layout);
        let bytes = self.bytes_mut(ptr, layout.size_in_bytes())?;
        reference::blend(bytes, layout.data_type, &offsets, values, alpha.value(), beta.value())
    }

    fn write_filter(
        &mut self,
        ptr: DevicePtr,
        layout: &FilterLayout,
        values: &[f64],
        alpha: ScalingFactor,
        beta: ScalingFactor,
    ) -> EngineResult<()> {
        let offsets = reference::filter_offsets(layout);
        let bytes = self.bytes_mut(ptr, layout.num_elements() * layout.data_type.size_in_bytes())?;
        reference::blend(bytes, layout.data_type, &offsets, values, alpha.value(), beta.value())
    }
}

/// Convolution engine running on the host.
#[derive(Debug)]
pub struct HostDriver {
    config: HostDriverConfig,
    state: Mutex<HostState>,
    synchronizations: AtomicUsize,
}

impl Default for HostDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDriver {
    pub fn new() -> Self {
        Self::with_config(HostDriverConfig::default())
    }

    pub fn with_config(config: HostDriverConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HostState::new()),
            synchronizations: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &HostDriverConfig {
        &self.config
    }

    /// Tensor, filter and convolution descriptors not yet destroyed.
    pub fn live_descriptors(&self) -> usize {
        let state = self.state();
        state.tensors.len() + state.filters.len() + state.convolutions.len()
    }

    pub fn live_engines(&self) -> usize {
        self.state().engines.len()
    }

    pub fn live_allocations(&self) -> usize {
        self.state().memory.len()
    }

    /// Device-wide barriers requested so far.
    pub fn synchronizations(&self) -> usize {
        self.synchronizations.load(Ordering::Relaxed)
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn supports_v7(&self) -> bool {
        self.config.version.major >= 7
    }

    fn workspace_query(
        &self,
        handle: RawEngine,
        x: RawTensor,
        w: RawFilter,
        conv: RawConvolution,
        y: RawTensor,
        algo: ConvolutionAlgo,
    ) -> EngineResult<usize> {
        let geometry = {
            let state = self.state();
            state.check_engine(handle)?;
            state.problem(x, w, conv, y)?.geometry
        };
        if self.config.unsupported.contains(&algo) {
            return Err(EngineStatus::NotSupported);
        }
        cost::workspace_size(algo, &geometry)
    }

    /// Reject a call whose workspace is smaller than `required` or not backed
    /// by memory.
    fn check_workspace(&self, workspace: WorkspaceArg, required: usize) -> EngineResult<()> {
        if workspace.size < required {
            return Err(EngineStatus::BadParam);
        }
        if required > 0 {
            self.state().locate(workspace.data, workspace.size)?;
        }
        Ok(())
    }

    /// Run every candidate within `workspace`, successful ones first ordered
    /// by time, and keep the first `requested`.
    fn find<A: Copy>(
        &self,
        candidates: &[A],
        requested: usize,
        workspace: WorkspaceArg,
        cost: impl Fn(A) -> EngineResult<usize>,
        run: impl Fn(A) -> EngineResult<()>,
    ) -> Vec<AlgoPerf<A>> {
        let mut results: Vec<AlgoPerf<A>> = candidates
            .iter()
            .map(|&algo| {
                let start = Instant::now();
                let outcome = cost(algo).and_then(|memory| {
                    if memory > workspace.size {
                        return Err(EngineStatus::AllocFailed);
                    }
                    run(algo).map(|()| memory)
                });
                match outcome {
                    Ok(memory) => AlgoPerf { algo, status: Ok(()), time: start.elapsed(), memory },
                    Err(status) => {
                        AlgoPerf { algo, status: Err(status), time: Duration::ZERO, memory: 0 }
                    }
                }
            })
            .collect();
        results.sort_by_key(|perf| (perf.status.is_err(), perf.time));
        results.truncate(requested);
        results
    }
}

fn check_scaling(data_type: DataType, factors: [ScalingFactor; 2]) -> EngineResult<()> {
    if factors.iter().all(|f| f.matches(data_type)) {
        Ok(())
    } else {
        Err(EngineStatus::BadParam)
    }
}

fn all_positive(values: &[i32]) -> bool {
    values.iter().all(|&v| v > 0)
}

impl Driver for HostDriver {
    // ── Environment ──────────────────────────────────────────────

    fn name(&self) -> &str {
        &self.config.name
    }

    fn version(&self) -> EngineVersion {
        self.config.version
    }

    fn runtime_version(&self) -> EngineVersion {
        self.config.runtime_version
    }

    fn device_count(&self) -> EngineResult<i32> {
        Ok(self.config.device_count)
    }

    fn set_device(&self, ordinal: i32) -> EngineResult<()> {
        if ordinal < 0 || ordinal >= self.config.device_count {
            return Err(EngineStatus::InvalidValue);
        }
        self.state().device = ordinal;
        Ok(())
    }

    fn device_name(&self) -> EngineResult<String> {
        Ok(format!("{} #{}", self.config.device_name, self.state().device))
    }

    fn mem_get_info(&self) -> EngineResult<(usize, usize)> {
        let allocated = self.state().allocated;
        Ok((self.config.total_memory.saturating_sub(allocated), self.config.total_memory))
    }

    fn synchronize(&self) -> EngineResult<()> {
        self.synchronizations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // ── Memory ───────────────────────────────────────────────────

    fn malloc(&self, bytes: usize) -> EngineResult<DevicePtr> {
        let mut state = self.state();
        if bytes > self.config.total_memory.saturating_sub(state.allocated) {
            return Err(EngineStatus::AllocFailed);
        }
        let address = state.next_address;
        let span = (bytes as u64).max(1).div_ceil(ALIGNMENT) * ALIGNMENT;
        state.next_address += span;
        state.allocated += bytes;
        state.memory.insert(address, vec![UNINITIALIZED; bytes]);
        Ok(DevicePtr(address))
    }

    fn free(&self, ptr: DevicePtr) -> EngineResult<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let mut state = self.state();
        let block = state.memory.remove(&ptr.0).ok_or(EngineStatus::InvalidValue)?;
        state.allocated -= block.len();
        Ok(())
    }

    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> EngineResult<()> {
        self.state().bytes_mut(dst, src.len())?.copy_from_slice(src);
        Ok(())
    }

    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> EngineResult<()> {
        dst.copy_from_slice(self.state().bytes(src, dst.len())?);
        Ok(())
    }

    fn convert_device_data(
        &self,
        scale: f64,
        dst: DevicePtr,
        dst_type: DataType,
        src: DevicePtr,
        src_type: DataType,
        count: usize,
    ) -> EngineResult<()> {
        let mut state = self.state();
        let offsets: Vec<usize> = (0..count).collect();
        let src_bytes = state.bytes(src, count * src_type.size_in_bytes())?;
        let values = reference::gather(src_bytes, src_type, &offsets)?;
        let bytes = state.bytes_mut(dst, count * dst_type.size_in_bytes())?;
        reference::blend(bytes, dst_type, &offsets, &values, scale, 0.0)
    }

    // ── Engine handle ────────────────────────────────────────────

    fn create_engine(&self) -> EngineResult<RawEngine> {
        let mut state = self.state();
        let handle = state.issue();
        state.engines.insert(handle);
        Ok(RawEngine(handle))
    }

    fn destroy_engine(&self, handle: RawEngine) -> EngineResult<()> {
        if self.state().engines.remove(&handle.0) {
            Ok(())
        } else {
            Err(EngineStatus::BadParam)
        }
    }

    // ── Tensor descriptors ───────────────────────────────────────

    fn create_tensor_descriptor(&self) -> EngineResult<RawTensor> {
        let mut state = self.state();
        let handle = state.issue();
        state.tensors.insert(handle, None);
        Ok(RawTensor(handle))
    }

    fn destroy_tensor_descriptor(&self, desc: RawTensor) -> EngineResult<()> {
        self.state()
            .tensors
            .remove(&desc.0)
            .map(|_| ())
            .ok_or(EngineStatus::BadParam)
    }

    fn set_tensor_nd(
        &self,
        desc: RawTensor,
        data_type: DataType,
        dimensions: &[i32],
        strides: &[i32],
    ) -> EngineResult<()> {
        let rank = dimensions.len();
        if rank == 0 || rank > DIM_MAX || strides.len() != rank {
            return Err(EngineStatus::BadParam);
        }
        if !all_positive(dimensions) || !all_positive(strides) {
            return Err(EngineStatus::BadParam);
        }
        let mut state = self.state();
        let slot = state.tensors.get_mut(&desc.0).ok_or(EngineStatus::BadParam)?;
        *slot = Some(TensorLayout {
            data_type,
            dimensions: dimensions.to_vec(),
            strides: strides.to_vec(),
        });
        Ok(())
    }

    fn set_tensor_4d(
        &self,
        desc: RawTensor,
        format: TensorFormat,
        data_type: DataType,
        dimensions: [i32; 4],
    ) -> EngineResult<()> {
        if !all_positive(&dimensions) {
            return Err(EngineStatus::BadParam);
        }
        let [n, c, h, w] = dimensions;
        // Every stride and the whole element count must fit an i32.
        let mul = |a: i32, b: i32| a.checked_mul(b).ok_or(EngineStatus::BadParam);
        let strides = match format {
            TensorFormat::Nchw if data_type != DataType::Int8x4 => {
                let hw = mul(h, w)?;
                let chw = mul(c, hw)?;
                mul(n, chw)?;
                vec![chw, hw, w, 1]
            }
            TensorFormat::Nhwc if data_type != DataType::Int8x4 => {
                let wc = mul(w, c)?;
                let hwc = mul(h, wc)?;
                mul(n, hwc)?;
                vec![hwc, 1, wc, c]
            }
            // One element packs four channels.
            TensorFormat::NchwVectC if data_type == DataType::Int8x4 && c % 4 == 0 => {
                let hw = mul(h, w)?;
                let chw = mul(c / 4, hw)?;
                mul(n, chw)?;
                vec![chw, hw, w, 1]
            }
            _ => return Err(EngineStatus::BadParam),
        };
        let mut state = self.state();
        let slot = state.tensors.get_mut(&desc.0).ok_or(EngineStatus::BadParam)?;
        *slot = Some(TensorLayout { data_type, dimensions: dimensions.to_vec(), strides });
        Ok(())
    }

    fn get_tensor_nd(&self, desc: RawTensor) -> EngineResult<TensorLayout> {
        self.state().tensor(desc).cloned()
    }

    fn tensor_size_in_bytes(&self, desc: RawTensor) -> EngineResult<usize> {
        Ok(self.state().tensor(desc)?.size_in_bytes())
    }

    // ── Filter descriptors ───────────────────────────────────────

    fn create_filter_descriptor(&self) -> EngineResult<RawFilter> {
        let mut state = self.state();
        let handle = state.issue();
        state.filters.insert(handle, None);
        Ok(RawFilter(handle))
    }

    fn destroy_filter_descriptor(&self, desc: RawFilter) -> EngineResult<()> {
        self.state()
            .filters
            .remove(&desc.0)
            .map(|_| ())
            .ok_or(EngineStatus::BadParam)
    }

    fn set_filter_nd(
        &self,
        desc: RawFilter,
        data_type: DataType,
        format: TensorFormat,
        dimensions: &[i32],
    ) -> EngineResult<()> {
        if dimensions.len() < 3 || dimensions.len() > DIM_MAX || !all_positive(dimensions) {
            return Err(EngineStatus::BadParam);
        }
        if format == TensorFormat::NchwVectC {
            return Err(EngineStatus::NotSupported);
        }
        let mut state = self.state();
        let slot = state.filters.get_mut(&desc.0).ok_or(EngineStatus::BadParam)?;
        *slot = Some(FilterLayout { data_type, format, dimensions: dimensions.to_vec() });
        Ok(())
    }

    fn get_filter_nd(&self, desc: RawFilter) -> EngineResult<FilterLayout> {
        self.state().filter(desc).cloned()
    }

    // ── Convolution descriptors ──────────────────────────────────

    fn create_convolution_descriptor(&self) -> EngineResult<RawConvolution> {
        let mut state = self.state();
        let handle = state.issue();
        state.convolutions.insert(
            handle,
            ConvolutionState { layout: None, group_count: 1, math_type: MathType::Default },
        );
        Ok(RawConvolution(handle))
    }

    fn destroy_convolution_descriptor(&self, desc: RawConvolution) -> EngineResult<()> {
        self.state()
            .convolutions
            .remove(&desc.0)
            .map(|_| ())
            .ok_or(EngineStatus::BadParam)
    }

    fn set_convolution_nd(
        &self,
        desc: RawConvolution,
        pad: &[i32],
        stride: &[i32],
        dilation: &[i32],
        mode: ConvolutionMode,
        compute_type: DataType,
    ) -> EngineResult<()> {
        let rank = pad.len();
        if rank == 0 || rank > DIM_MAX - 2 || stride.len() != rank || dilation.len() != rank {
            return Err(EngineStatus::BadParam);
        }
        if pad.iter().any(|&p| p < 0) || !all_positive(stride) || !all_positive(dilation) {
            return Err(EngineStatus::BadParam);
        }
        let mut state = self.state();
        let slot = state.convolutions.get_mut(&desc.0).ok_or(EngineStatus::BadParam)?;
        slot.layout = Some(ConvolutionLayout {
            pad: pad.to_vec(),
            stride: stride.to_vec(),
            dilation: dilation.to_vec(),
            mode,
            compute_type,
            math_type: MathType::Default,
            group_count: 1,
        });
        Ok(())
    }

    fn set_convolution_group_count(&self, desc: RawConvolution, groups: i32) -> EngineResult<()> {
        if !self.supports_v7() {
            return Err(EngineStatus::NotSupported);
        }
        if groups < 1 {
            return Err(EngineStatus::BadParam);
        }
        let mut state = self.state();
        state.convolutions.get_mut(&desc.0).ok_or(EngineStatus::BadParam)?.group_count = groups;
        Ok(())
    }

    fn set_convolution_math_type(&self, desc: RawConvolution, math: MathType) -> EngineResult<()> {
        if !self.supports_v7() {
            return Err(EngineStatus::NotSupported);
        }
        let mut state = self.state();
        state.convolutions.get_mut(&desc.0).ok_or(EngineStatus::BadParam)?.math_type = math;
        Ok(())
    }

    fn get_convolution_nd(&self, desc: RawConvolution) -> EngineResult<ConvolutionLayout> {
        self.state().convolution(desc)
    }

    fn convolution_2d_forward_output_dim(
        &self,
        conv: RawConvolution,
        input: RawTensor,
        filter: RawFilter,
    ) -> EngineResult<[i32; 4]> {
        let state = self.state();
        let (x, w, conv) = (state.tensor(input)?, state.filter(filter)?, state.convolution(conv)?);
        if x.rank() != 4 || w.rank() != 4 || conv.rank() != 2 {
            return Err(EngineStatus::BadParam);
        }
        if x.dimensions[1] != w.dimensions[1] * conv.group_count.max(1) {
            return Err(EngineStatus::BadParam);
        }
        let mut out = [x.dimensions[0], w.dimensions[0], 0, 0];
        for axis in 0..2 {
            out[axis + 2] = reference::output_dim(
                x.dimensions[axis + 2],
                conv.pad[axis],
                w.dimensions[axis + 2],
                conv.stride[axis],
                conv.dilation[axis],
            )?;
        }
        Ok(out)
    }

    // ── Workspace queries ────────────────────────────────────────

    fn forward_workspace_size(
        &self,
        handle: RawEngine,
        x: RawTensor,
        w: RawFilter,
        conv: RawConvolution,
        y: RawTensor,
        algo: FwdAlgo,
    ) -> EngineResult<usize> {
        self.workspace_query(handle, x, w, conv, y, algo.into())
    }

    fn backward_data_workspace_size(
        &self,
        handle: RawEngine,
        w: RawFilter,
        dy: RawTensor,
        conv: RawConvolution,
        dx: RawTensor,
        algo: BwdDataAlgo,
    ) -> EngineResult<usize> {
        self.workspace_query(handle, dx, w, conv, dy, algo.into())
    }

    fn backward_filter_workspace_size(
        &self,
        handle: RawEngine,
        x: RawTensor,
        dy: RawTensor,
        conv: RawConvolution,
        dw: RawFilter,
        algo: BwdFilterAlgo,
    ) -> EngineResult<usize> {
        self.workspace_query(handle, x, dw, conv, dy, algo.into())
    }

    // ── Benchmarking ─────────────────────────────────────────────

    fn find_forward_algorithm(
        &self,
        handle: RawEngine,
        x: TensorArg,
        w: FilterArg,
        conv: RawConvolution,
        y: TensorArg,
        requested: usize,
        workspace: WorkspaceArg,
    ) -> EngineResult<Vec<AlgoPerf<FwdAlgo>>> {
        let data_type = {
            let state = self.state();
            state.check_engine(handle)?;
            state.problem(x.desc, w.desc, conv, y.desc)?.y.data_type
        };
        let (one, zero) = (
            ScalingFactor::for_data_type(1.0, data_type),
            ScalingFactor::for_data_type(0.0, data_type),
        );
        let results = self.find(
            FwdAlgo::ALL,
            requested,
            workspace,
            |algo| self.forward_workspace_size(handle, x.desc, w.desc, conv, y.desc, algo),
            |algo| self.convolution_forward(handle, one, x, w, conv, algo, workspace, zero, y),
        );
        log::debug!("find forward: {} records", results.len());
        Ok(results)
    }

    fn find_backward_data_algorithm(
        &self,
        handle: RawEngine,
        w: FilterArg,
        dy: TensorArg,
        conv: RawConvolution,
        dx: TensorArg,
        requested: usize,
        workspace: WorkspaceArg,
    ) -> EngineResult<Vec<AlgoPerf<BwdDataAlgo>>> {
        let data_type = {
            let state = self.state();
            state.check_engine(handle)?;
            state.problem(dx.desc, w.desc, conv, dy.desc)?.x.data_type
        };
        let (one, zero) = (
            ScalingFactor::for_data_type(1.0, data_type),
            ScalingFactor::for_data_type(0.0, data_type),
        );
        let results = self.find(
            BwdDataAlgo::ALL,
            requested,
            workspace,
            |algo| self.backward_data_workspace_size(handle, w.desc, dy.desc, conv, dx.desc, algo),
            |algo| self.convolution_backward_data(handle, one, w, dy, conv, algo, workspace, zero, dx),
        );
        log::debug!("find backward data: {} records", results.len());
        Ok(results)
    }

    fn find_backward_filter_algorithm(
        &self,
        handle: RawEngine,
        x: TensorArg,
        dy: TensorArg,
        conv: RawConvolution,
        dw: FilterArg,
        requested: usize,
        workspace: WorkspaceArg,
    ) -> EngineResult<Vec<AlgoPerf<BwdFilterAlgo>>> {
        let data_type = {
            let state = self.state();
            state.check_engine(handle)?;
            state.problem(x.desc, dw.desc, conv, dy.desc)?.w.data_type
        };
        let (one, zero) = (
            ScalingFactor::for_data_type(1.0, data_type),
            ScalingFactor::for_data_type(0.0, data_type),
        );
        let results = self.find(
            BwdFilterAlgo::ALL,
            requested,
            workspace,
            |algo| self.backward_filter_workspace_size(handle, x.desc, dy.desc, conv, dw.desc, algo),
            |algo| self.convolution_backward_filter(handle, one, x, dy, conv, algo, workspace, zero, dw),
        );
        log::debug!("find backward filter: {} records", results.len());
        Ok(results)
    }

    // ── Execution ────────────────────────────────────────────────

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
    ) -> EngineResult<()> {
        let required = self.forward_workspace_size(handle, x.desc, w.desc, conv, y.desc, algo)?;
        self.check_workspace(workspace, required)?;
        let mut state = self.state();
        let problem = state.problem(x.desc, w.desc, conv, y.desc)?;
        check_scaling(problem.y.data_type, [alpha, beta])?;
        let xs = state.read_tensor(x.data, &problem.x)?;
        let ws = state.read_filter(w.data, &problem.w)?;
        let result = reference::forward(&problem.geometry, &xs, &ws);
        state.write_tensor(y.data, &problem.y, &result, alpha, beta)
    }

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
    ) -> EngineResult<()> {
        let required =
            self.backward_data_workspace_size(handle, w.desc, dy.desc, conv, dx.desc, algo)?;
        self.check_workspace(workspace, required)?;
        let mut state = self.state();
        let problem = state.problem(dx.desc, w.desc, conv, dy.desc)?;
        check_scaling(problem.x.data_type, [alpha, beta])?;
        let ws = state.read_filter(w.data, &problem.w)?;
        let dys = state.read_tensor(dy.data, &problem.y)?;
        let result = reference::backward_data(&problem.geometry, &ws, &dys);
        state.write_tensor(dx.data, &problem.x, &result, alpha, beta)
    }

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
    ) -> EngineResult<()> {
        let required =
            self.backward_filter_workspace_size(handle, x.desc, dy.desc, conv, dw.desc, algo)?;
        self.check_workspace(workspace, required)?;
        let mut state = self.state();
        let problem = state.problem(x.desc, dw.desc, conv, dy.desc)?;
        check_scaling(problem.w.data_type, [alpha, beta])?;
        let xs = state.read_tensor(x.data, &problem.x)?;
        let dys = state.read_tensor(dy.data, &problem.y)?;
        let result = reference::backward_filter(&problem.geometry, &xs, &dys);
        state.write_filter(dw.data, &problem.w, &result, alpha, beta)
    }

    fn transform_tensor(
        &self,
        handle: RawEngine,
        alpha: ScalingFactor,
        src: TensorArg,
        beta: ScalingFactor,
        dst: TensorArg,
    ) -> EngineResult<()> {
        let mut state = self.state();
        state.check_engine(handle)?;
        let (from, to) = (state.tensor(src.desc)?.clone(), state.tensor(dst.desc)?.clone());
        if from.dimensions != to.dimensions || from.data_type != to.data_type {
            return Err(EngineStatus::BadParam);
        }
        check_scaling(to.data_type, [alpha, beta])?;
        let values = state.read_tensor(src.data, &from)?;
        state.write_tensor(dst.data, &to, &values, alpha, beta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        bytemuck::cast_slice(values).to_vec()
    }

    fn read_f32(driver: &HostDriver, ptr: DevicePtr, count: usize) -> Vec<f32> {
        let mut bytes = vec![0u8; count * 4];
        driver.memcpy_dtoh(&mut bytes, ptr).unwrap();
        bytemuck::pod_collect_to_vec(&bytes)
    }

    fn tensor(driver: &HostDriver, dims: [i32; 4]) -> RawTensor {
        let desc = driver.create_tensor_descriptor().unwrap();
        driver.set_tensor_4d(desc, TensorFormat::Nchw, DataType::Float, dims).unwrap();
        desc
    }

    #[test]
    fn test_memory_accounting() {
        let driver = HostDriver::with_config(HostDriverConfig {
            total_memory: 1024,
            ..HostDriverConfig::default()
        });
        let a = driver.malloc(1000).unwrap();
        assert_eq!(driver.mem_get_info().unwrap(), (24, 1024));
        assert_eq!(driver.malloc(100), Err(EngineStatus::AllocFailed));
        let b = driver.malloc(0).unwrap();
        assert_ne!(a, b);
        driver.free(a).unwrap();
        driver.free(b).unwrap();
        assert_eq!(driver.free(a), Err(EngineStatus::InvalidValue));
        assert_eq!(driver.live_allocations(), 0);
    }

    #[test]
    fn test_fresh_memory_reads_nan() {
        let driver = HostDriver::new();
        let ptr = driver.malloc(8).unwrap();
        assert!(read_f32(&driver, ptr, 2).iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_copy_out_of_range() {
        let driver = HostDriver::new();
        let ptr = driver.malloc(4).unwrap();
        assert_eq!(driver.memcpy_htod(ptr, &[0u8; 8]), Err(EngineStatus::InvalidValue));
        assert_eq!(driver.memcpy_htod(DevicePtr(ptr.0 + 2), &[1u8; 2]), Ok(()));
    }

    #[test]
    fn test_set_tensor_4d_strides() {
        let driver = HostDriver::new();
        let desc = driver.create_tensor_descriptor().unwrap();
        driver.set_tensor_4d(desc, TensorFormat::Nhwc, DataType::Half, [2, 3, 4, 5]).unwrap();
        let layout = driver.get_tensor_nd(desc).unwrap();
        assert_eq!(layout.strides, vec![60, 1, 15, 3]);
        assert_eq!(driver.tensor_size_in_bytes(desc).unwrap(), 240);
        assert_eq!(
            driver.set_tensor_4d(desc, TensorFormat::NchwVectC, DataType::Float, [1, 4, 1, 1]),
            Err(EngineStatus::BadParam)
        );
    }

    #[test]
    fn test_set_tensor_4d_rejects_overflowing_sizes() {
        let driver = HostDriver::new();
        let desc = driver.create_tensor_descriptor().unwrap();
        for format in [TensorFormat::Nchw, TensorFormat::Nhwc] {
            assert_eq!(
                driver.set_tensor_4d(desc, format, DataType::Float, [1, 2048, 2048, 1024]),
                Err(EngineStatus::BadParam)
            );
            // Strides fit, the element count does not.
            assert_eq!(
                driver.set_tensor_4d(desc, format, DataType::Float, [4, 1024, 1024, 1024]),
                Err(EngineStatus::BadParam)
            );
        }
        assert_eq!(driver.get_tensor_nd(desc), Err(EngineStatus::BadParam));
        driver.set_tensor_4d(desc, TensorFormat::Nchw, DataType::Float, [1, 1024, 1024, 1024]).unwrap();
    }

    #[test]
    fn test_set_tensor_nd_validation() {
        let driver = HostDriver::new();
        let desc = driver.create_tensor_descriptor().unwrap();
        let err = driver.set_tensor_nd(desc, DataType::Float, &[2, 0, 3], &[3, 3, 1]);
        assert_eq!(err, Err(EngineStatus::BadParam));
        let err = driver.set_tensor_nd(desc, DataType::Float, &[2, 3], &[3]);
        assert_eq!(err, Err(EngineStatus::BadParam));
        assert_eq!(driver.get_tensor_nd(desc), Err(EngineStatus::BadParam));
    }

    #[test]
    fn test_old_engine_lacks_group_count_and_math_type() {
        let driver = HostDriver::with_config(HostDriverConfig {
            version: EngineVersion::new(6, 0, 21),
            ..HostDriverConfig::default()
        });
        let conv = driver.create_convolution_descriptor().unwrap();
        assert_eq!(driver.set_convolution_group_count(conv, 2), Err(EngineStatus::NotSupported));
        assert_eq!(
            driver.set_convolution_math_type(conv, MathType::TensorOp),
            Err(EngineStatus::NotSupported)
        );
    }

    #[test]
    fn test_output_dim_query() {
        let driver = HostDriver::new();
        let x = tensor(&driver, [2, 4, 9, 7]);
        let w = driver.create_filter_descriptor().unwrap();
        driver.set_filter_nd(w, DataType::Float, TensorFormat::Nchw, &[6, 2, 3, 3]).unwrap();
        let conv = driver.create_convolution_descriptor().unwrap();
        driver
            .set_convolution_nd(conv, &[1, 0], &[2, 1], &[1, 2], ConvolutionMode::Convolution, DataType::Float)
            .unwrap();
        // Channel mismatch until the group count is set.
        assert_eq!(driver.convolution_2d_forward_output_dim(conv, x, w), Err(EngineStatus::BadParam));
        driver.set_convolution_group_count(conv, 2).unwrap();
        assert_eq!(driver.convolution_2d_forward_output_dim(conv, x, w), Ok([2, 6, 5, 3]));
    }

    #[test]
    fn test_forward_and_find() {
        let driver = HostDriver::new();
        let handle = driver.create_engine().unwrap();
        let x = tensor(&driver, [1, 1, 3, 3]);
        let y = tensor(&driver, [1, 1, 2, 2]);
        let w = driver.create_filter_descriptor().unwrap();
        driver.set_filter_nd(w, DataType::Float, TensorFormat::Nchw, &[1, 1, 2, 2]).unwrap();
        let conv = driver.create_convolution_descriptor().unwrap();
        driver
            .set_convolution_nd(conv, &[0, 0], &[1, 1], &[1, 1], ConvolutionMode::CrossCorrelation, DataType::Float)
            .unwrap();

        let (xp, wp, yp) = (driver.malloc(36).unwrap(), driver.malloc(16).unwrap(), driver.malloc(16).unwrap());
        driver.memcpy_htod(xp, &f32_bytes(&[1., 2., 3., 4., 5., 6., 7., 8., 9.])).unwrap();
        driver.memcpy_htod(wp, &f32_bytes(&[1., 0., 0., 1.])).unwrap();
        let (xa, wa, ya) = (
            TensorArg { desc: x, data: xp },
            FilterArg { desc: w, data: wp },
            TensorArg { desc: y, data: yp },
        );
        let none = WorkspaceArg { data: DevicePtr::NULL, size: 0 };

        driver
            .convolution_forward(
                handle,
                ScalingFactor::Float(1.0),
                xa,
                wa,
                conv,
                FwdAlgo::ImplicitGemm,
                none,
                ScalingFactor::Float(0.0),
                ya,
            )
            .unwrap();
        assert_eq!(read_f32(&driver, yp, 4), vec![6., 8., 12., 14.]);

        // Double storage for a float output is rejected.
        let err = driver.convolution_forward(
            handle,
            ScalingFactor::Double(1.0),
            xa,
            wa,
            conv,
            FwdAlgo::ImplicitGemm,
            none,
            ScalingFactor::Double(0.0),
            ya,
        );
        assert_eq!(err, Err(EngineStatus::BadParam));

        // GEMM needs a column buffer.
        let err = driver.convolution_forward(
            handle,
            ScalingFactor::Float(1.0),
            xa,
            wa,
            conv,
            FwdAlgo::Gemm,
            none,
            ScalingFactor::Float(0.0),
            ya,
        );
        assert_eq!(err, Err(EngineStatus::BadParam));

        let perf = driver.find_forward_algorithm(handle, xa, wa, conv, ya, 8, none).unwrap();
        assert_eq!(perf.len(), 8);
        assert_eq!(perf[0].status, Ok(()));
        assert_eq!(perf[0].algo, FwdAlgo::ImplicitGemm);
        assert!(perf[1..].iter().all(|p| p.status.is_err()));
    }

    #[test]
    fn test_configured_unsupported_algorithm() {
        let driver = HostDriver::with_config(HostDriverConfig {
            unsupported: vec![FwdAlgo::ImplicitGemm.into()],
            ..HostDriverConfig::default()
        });
        let handle = driver.create_engine().unwrap();
        let x = tensor(&driver, [1, 1, 3, 3]);
        let y = tensor(&driver, [1, 1, 1, 1]);
        let w = driver.create_filter_descriptor().unwrap();
        driver.set_filter_nd(w, DataType::Float, TensorFormat::Nchw, &[1, 1, 3, 3]).unwrap();
        let conv = driver.create_convolution_descriptor().unwrap();
        driver
            .set_convolution_nd(conv, &[0, 0], &[1, 1], &[1, 1], ConvolutionMode::Convolution, DataType::Float)
            .unwrap();
        assert_eq!(
            driver.forward_workspace_size(handle, x, w, conv, y, FwdAlgo::ImplicitGemm),
            Err(EngineStatus::NotSupported)
        );
        assert_eq!(driver.forward_workspace_size(handle, x, w, conv, y, FwdAlgo::ImplicitPrecompGemm), Ok(36));
    }

    #[test]
    fn test_convert_half_to_float() {
        let driver = HostDriver::new();
        let src = driver.malloc(4).unwrap();
        let dst = driver.malloc(8).unwrap();
        let halves = [half::f16::from_f32(1.5), half::f16::from_f32(-2.0)];
        driver.memcpy_htod(src, bytemuck::cast_slice(&halves)).unwrap();
        driver.convert_device_data(2.0, dst, DataType::Float, src, DataType::Half, 2).unwrap();
        assert_eq!(read_f32(&driver, dst, 2), vec![3.0, -4.0]);
    }
}
