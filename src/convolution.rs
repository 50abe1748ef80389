//! A complete convolution problem: descriptors plus random device data.

use crate::config::ConvolutionConfig;
use crate::descriptor::{
    build_convolution, build_filter, build_output_for, build_tensor, ConvolutionDescriptor,
    FilterDescriptor, TensorDescriptor,
};
use crate::device::Device;
use crate::error::{HarnessError, HarnessResult};
use crate::execute::ConvolutionArgs;
use crate::memory::DeviceBuffer;
use crate::random::{create_filter_data, create_tensor_data, RandomGenerator};
use crate::selector::ConvDescriptors;

/// Owns every resource of one convolution. Fields drop in declaration order,
/// data before descriptors.
#[derive(Debug)]
pub struct Convolution {
    pub input_data: DeviceBuffer,
    pub filter_data: DeviceBuffer,
    pub output_data: DeviceBuffer,
    pub input: TensorDescriptor,
    pub filter: FilterDescriptor,
    pub convolution: ConvolutionDescriptor,
    pub output: TensorDescriptor,
}

impl Convolution {
    pub fn descriptors(&self) -> ConvDescriptors<'_> {
        ConvDescriptors {
            input: &self.input,
            filter: &self.filter,
            convolution: &self.convolution,
            output: &self.output,
        }
    }

    pub fn args(&self) -> ConvolutionArgs<'_> {
        ConvolutionArgs {
            input: &self.input,
            input_data: &self.input_data,
            filter: &self.filter,
            filter_data: &self.filter_data,
            convolution: &self.convolution,
            output: &self.output,
            output_data: &self.output_data,
        }
    }
}

/// Build the descriptors of `config` and fill all three tensors with uniform
/// values in `[lower, upper]`. On error every resource created so far is
/// released.
pub fn create_convolution(
    device: &Device,
    config: &ConvolutionConfig,
    lower: f64,
    upper: f64,
    rng: &mut RandomGenerator,
) -> HarnessResult<Convolution> {
    if !device.capabilities().grouped_convolution
        && config.convolution.group_count.unwrap_or(1) > 1
    {
        return Err(HarnessError::Unsupported(format!(
            "Grouped convolution requires engine version 7, running {}",
            device.driver().version()
        )));
    }

    let input = build_tensor(device, &config.input)?;
    let filter = build_filter(device, &config.filter)?;
    let convolution = build_convolution(device, &config.convolution)?;
    let output = build_output_for(device, config, &input, &filter, &convolution)?;

    let input_data = create_tensor_data(device, &input, lower, upper, rng)?;
    let filter_data = create_filter_data(device, &filter, lower, upper, rng)?;
    let output_data = create_tensor_data(device, &output, lower, upper, rng)?;

    if let Some(label) = &config.label {
        log::debug!("created convolution '{}': output {:?}", label, output.dimensions());
    }
    Ok(Convolution {
        input_data,
        filter_data,
        output_data,
        input,
        filter,
        convolution,
        output,
    })
}
