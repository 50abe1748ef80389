//! Typed execution engine.
//!
//! Dispatches one convolution call over the algorithm's direction. The engine
//! reads `alpha`/`beta` as `f64` or `f32` depending on the element kind of the
//! tensor the direction writes: the output for forward, the input for
//! backward-data and the filter for backward-filter.

use crate::algorithm::ConvolutionAlgo;
use crate::descriptor::{ConvolutionDescriptor, FilterDescriptor, TensorDescriptor};
use crate::driver::{DevicePtr, FilterArg, ScalingFactor, TensorArg, WorkspaceArg};
use crate::error::HarnessResult;
use crate::handle::EngineHandle;
use crate::memory::DeviceBuffer;
use crate::selector::ConvDescriptors;
use crate::types::{DataType, Direction};

/// Descriptors and data of one convolution. The buffer of the tensor being
/// solved for is overwritten by the engine.
#[derive(Debug, Clone, Copy)]
pub struct ConvolutionArgs<'a> {
    pub input: &'a TensorDescriptor,
    pub input_data: &'a DeviceBuffer,
    pub filter: &'a FilterDescriptor,
    pub filter_data: &'a DeviceBuffer,
    pub convolution: &'a ConvolutionDescriptor,
    pub output: &'a TensorDescriptor,
    pub output_data: &'a DeviceBuffer,
}

impl<'a> ConvolutionArgs<'a> {
    pub fn descriptors(&self) -> ConvDescriptors<'a> {
        ConvDescriptors {
            input: self.input,
            filter: self.filter,
            convolution: self.convolution,
            output: self.output,
        }
    }

    pub(crate) fn input_arg(&self) -> TensorArg {
        TensorArg { desc: self.input.raw(), data: self.input_data.ptr() }
    }

    pub(crate) fn filter_arg(&self) -> FilterArg {
        FilterArg { desc: self.filter.raw(), data: self.filter_data.ptr() }
    }

    pub(crate) fn output_arg(&self) -> TensorArg {
        TensorArg { desc: self.output.raw(), data: self.output_data.ptr() }
    }
}

/// Element kind that selects the scaling factor storage for `direction`.
pub fn scaling_data_type(direction: Direction, descriptors: ConvDescriptors<'_>) -> DataType {
    match direction {
        Direction::Forward => descriptors.output.data_type(),
        Direction::BackwardData => descriptors.input.data_type(),
        Direction::BackwardFilter => descriptors.filter.data_type(),
    }
}

/// Run `algo` on `args`: `result = alpha * conv + beta * result`.
pub fn run_convolution(
    handle: &EngineHandle,
    algo: ConvolutionAlgo,
    alpha: f64,
    beta: f64,
    args: &ConvolutionArgs<'_>,
    workspace: Option<&DeviceBuffer>,
) -> HarnessResult<()> {
    let driver = handle.driver();
    let data_type = scaling_data_type(algo.direction(), args.descriptors());
    let alpha = ScalingFactor::for_data_type(alpha, data_type);
    let beta = ScalingFactor::for_data_type(beta, data_type);
    let workspace = workspace
        .map(DeviceBuffer::as_workspace)
        .unwrap_or(WorkspaceArg { data: DevicePtr::NULL, size: 0 });
    log::debug!("running {} with {} workspace bytes", algo, workspace.size);

    match algo {
        ConvolutionAlgo::Forward(algo) => driver.convolution_forward(
            handle.get(),
            alpha,
            args.input_arg(),
            args.filter_arg(),
            args.convolution.raw(),
            algo,
            workspace,
            beta,
            args.output_arg(),
        ),
        ConvolutionAlgo::BackwardData(algo) => driver.convolution_backward_data(
            handle.get(),
            alpha,
            args.filter_arg(),
            args.output_arg(),
            args.convolution.raw(),
            algo,
            workspace,
            beta,
            args.input_arg(),
        ),
        ConvolutionAlgo::BackwardFilter(algo) => driver.convolution_backward_filter(
            handle.get(),
            alpha,
            args.input_arg(),
            args.output_arg(),
            args.convolution.raw(),
            algo,
            workspace,
            beta,
            args.filter_arg(),
        ),
    }?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::{BwdDataAlgo, BwdFilterAlgo, FwdAlgo};
    use crate::compare::download_values;
    use crate::config::{ConvolutionParams, FilterConfig, TensorConfig};
    use crate::convolution::create_convolution;
    use crate::error::{EngineStatus, HarnessError};
    use crate::random::RandomGenerator;
    use crate::testing::{host_device, small_config};
    use crate::types::TensorFormat;
    use crate::ConvolutionConfig;

    #[test]
    fn test_scaling_type_follows_direction() {
        use crate::descriptor::{build_convolution, build_filter, build_tensor};

        let (_host, device) = host_device();
        let config = small_config(Direction::Forward);
        // Each role gets its own element kind so a swapped arm is visible.
        let input = build_tensor(
            &device,
            &TensorConfig::packed(DataType::Float, &[1, 1, 4, 4], TensorFormat::Nchw),
        )
        .unwrap();
        let filter =
            build_filter(&device, &FilterConfig::new(DataType::Half, TensorFormat::Nchw, &[1, 1, 3, 3]))
                .unwrap();
        let convolution = build_convolution(&device, &config.convolution).unwrap();
        let output = build_tensor(
            &device,
            &TensorConfig::packed(DataType::Double, &[1, 1, 2, 2], TensorFormat::Nchw),
        )
        .unwrap();
        let d = ConvDescriptors {
            input: &input,
            filter: &filter,
            convolution: &convolution,
            output: &output,
        };

        assert_eq!(scaling_data_type(Direction::Forward, d), DataType::Double);
        assert_eq!(scaling_data_type(Direction::BackwardData, d), DataType::Float);
        assert_eq!(scaling_data_type(Direction::BackwardFilter, d), DataType::Half);
        for direction in Direction::ALL {
            let factor = ScalingFactor::for_data_type(1.0, scaling_data_type(direction, d));
            let is_double = matches!(factor, ScalingFactor::Double(_));
            assert_eq!(is_double, direction == Direction::Forward, "{direction}");
        }
    }

    #[test]
    fn test_forward_with_beta_accumulates() {
        let (_host, device) = host_device();
        let handle = device.create_engine_handle().unwrap();
        let mut rng = RandomGenerator::new(3);
        let conv =
            create_convolution(&device, &small_config(Direction::Forward), -1.0, 1.0, &mut rng)
                .unwrap();
        let args = conv.args();
        let algo = FwdAlgo::ImplicitGemm.into();

        run_convolution(&handle, algo, 1.0, 0.0, &args, None).unwrap();
        let once = download_values(&device, &conv.output, &conv.output_data).unwrap();
        run_convolution(&handle, algo, 1.0, 1.0, &args, None).unwrap();
        let twice = download_values(&device, &conv.output, &conv.output_data).unwrap();
        for (a, b) in once.iter().zip(&twice) {
            assert!((2.0 * a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_double_backward_data_uses_double_scaling() {
        let (_host, device) = host_device();
        let handle = device.create_engine_handle().unwrap();
        let mut rng = RandomGenerator::new(5);
        let config = ConvolutionConfig::new(
            TensorConfig::packed(DataType::Double, &[1, 2, 5, 5], TensorFormat::Nchw),
            FilterConfig::new(DataType::Double, TensorFormat::Nchw, &[3, 2, 3, 3]),
            ConvolutionParams::new(&[1, 1], &[], &[], DataType::Double),
            Direction::BackwardData,
        );
        let conv = create_convolution(&device, &config, -1.0, 1.0, &mut rng).unwrap();
        run_convolution(&handle, BwdDataAlgo::Algo0.into(), 1.0, 0.0, &conv.args(), None).unwrap();
        let dx = download_values(&device, &conv.input, &conv.input_data).unwrap();
        assert!(dx.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_missing_workspace_is_engine_error() {
        let (_host, device) = host_device();
        let handle = device.create_engine_handle().unwrap();
        let mut rng = RandomGenerator::new(7);
        let conv = create_convolution(
            &device,
            &small_config(Direction::BackwardFilter),
            -1.0,
            1.0,
            &mut rng,
        )
        .unwrap();
        let err = run_convolution(&handle, BwdFilterAlgo::Algo1.into(), 1.0, 0.0, &conv.args(), None)
            .unwrap_err();
        assert!(matches!(err, HarnessError::Engine(EngineStatus::BadParam)));

        let workspace = device.allocate(1 << 16).unwrap();
        run_convolution(
            &handle,
            BwdFilterAlgo::Algo1.into(),
            1.0,
            0.0,
            &conv.args(),
            Some(&workspace),
        )
        .unwrap();
    }
}
