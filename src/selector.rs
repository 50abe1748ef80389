//! Algorithm selection under a workspace budget.
//!
//! Two strategies: [`supported_algorithms`] walks the catalog and keeps every
//! identifier whose workspace query succeeds within the limit, while
//! [`find_algorithm`] lets the engine benchmark its candidates inside a
//! workspace of exactly the limit and takes the fastest.

use crate::algorithm::ConvolutionAlgo;
use crate::convolution::Convolution;
use crate::descriptor::{ConvolutionDescriptor, FilterDescriptor, TensorDescriptor};
use crate::device::Device;
use crate::error::{HarnessError, HarnessResult};
use crate::handle::EngineHandle;
use crate::types::Direction;

/// The four descriptors of one convolution problem.
#[derive(Debug, Clone, Copy)]
pub struct ConvDescriptors<'a> {
    pub input: &'a TensorDescriptor,
    pub filter: &'a FilterDescriptor,
    pub convolution: &'a ConvolutionDescriptor,
    pub output: &'a TensorDescriptor,
}

/// Workspace bytes `algo` needs on `d`.
///
/// The engine takes the descriptors in data-flow order: backward-data as
/// `(filter, output, conv, input)`, backward-filter as
/// `(input, output, conv, filter)`.
pub fn workspace_size(
    handle: &EngineHandle,
    d: ConvDescriptors<'_>,
    algo: ConvolutionAlgo,
) -> HarnessResult<usize> {
    let driver = handle.driver();
    let conv = d.convolution.raw();
    let size = match algo {
        ConvolutionAlgo::Forward(algo) => driver.forward_workspace_size(
            handle.get(),
            d.input.raw(),
            d.filter.raw(),
            conv,
            d.output.raw(),
            algo,
        ),
        ConvolutionAlgo::BackwardData(algo) => driver.backward_data_workspace_size(
            handle.get(),
            d.filter.raw(),
            d.output.raw(),
            conv,
            d.input.raw(),
            algo,
        ),
        ConvolutionAlgo::BackwardFilter(algo) => driver.backward_filter_workspace_size(
            handle.get(),
            d.input.raw(),
            d.output.raw(),
            conv,
            d.filter.raw(),
            algo,
        ),
    }?;
    Ok(size)
}

/// An algorithm that fits the budget, with the workspace it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlgorithmCandidate {
    pub algo: ConvolutionAlgo,
    pub workspace_size: usize,
}

/// Every algorithm of `direction` whose workspace query succeeds and fits in
/// `limit`, in ascending identifier order.
pub fn supported_candidates(
    handle: &EngineHandle,
    direction: Direction,
    d: ConvDescriptors<'_>,
    limit: usize,
) -> Vec<AlgorithmCandidate> {
    ConvolutionAlgo::all(direction)
        .into_iter()
        .filter_map(|algo| match workspace_size(handle, d, algo) {
            Ok(size) if size <= limit => Some(AlgorithmCandidate { algo, workspace_size: size }),
            Ok(size) => {
                log::debug!("skipping {}: needs {} bytes, limit {}", algo, size, limit);
                None
            }
            Err(err) => {
                log::debug!("skipping {}: {}", algo, err);
                None
            }
        })
        .collect()
}

/// Identifiers of [`supported_candidates`].
pub fn supported_algorithms(
    handle: &EngineHandle,
    direction: Direction,
    d: ConvDescriptors<'_>,
    limit: usize,
) -> Vec<ConvolutionAlgo> {
    supported_candidates(handle, direction, d, limit)
        .into_iter()
        .map(|candidate| candidate.algo)
        .collect()
}

/// Let the engine pick the fastest algorithm for `convolution` within a
/// workspace of `limit` bytes. Running the candidates overwrites the buffer
/// of the tensor being solved for. The device is synchronized on both sides
/// of the benchmark so no other work overlaps the timings.
pub fn find_algorithm(
    device: &Device,
    handle: &EngineHandle,
    direction: Direction,
    convolution: &Convolution,
    limit: usize,
) -> HarnessResult<ConvolutionAlgo> {
    let scratch = device.allocate(limit)?;
    let workspace = scratch.as_workspace();
    let args = convolution.args();
    let driver = handle.driver();
    let conv = args.convolution.raw();

    device.synchronize()?;
    let best = match direction {
        Direction::Forward => driver
            .find_forward_algorithm(
                handle.get(),
                args.input_arg(),
                args.filter_arg(),
                conv,
                args.output_arg(),
                1,
                workspace,
            )?
            .into_iter()
            .next()
            .map(|perf| (ConvolutionAlgo::from(perf.algo), perf.status, perf.time, perf.memory)),
        Direction::BackwardData => driver
            .find_backward_data_algorithm(
                handle.get(),
                args.filter_arg(),
                args.output_arg(),
                conv,
                args.input_arg(),
                1,
                workspace,
            )?
            .into_iter()
            .next()
            .map(|perf| (ConvolutionAlgo::from(perf.algo), perf.status, perf.time, perf.memory)),
        Direction::BackwardFilter => driver
            .find_backward_filter_algorithm(
                handle.get(),
                args.input_arg(),
                args.output_arg(),
                conv,
                args.filter_arg(),
                1,
                workspace,
            )?
            .into_iter()
            .next()
            .map(|perf| (ConvolutionAlgo::from(perf.algo), perf.status, perf.time, perf.memory)),
    };
    device.synchronize()?;

    match best {
        Some((algo, Ok(()), time, memory)) => {
            log::info!(
                "{} selected {} ({:?}, {} workspace bytes of {})",
                direction,
                algo,
                time,
                memory,
                limit
            );
            Ok(algo)
        }
        Some((algo, Err(status), _, _)) => {
            log::debug!("best {} candidate {} failed: {}", direction, algo, status);
            Err(HarnessError::NoSupportedAlgorithm)
        }
        None => Err(HarnessError::NoSupportedAlgorithm),
    }
}
