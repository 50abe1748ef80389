//! Precision conversion and layout transforms between device buffers.

use crate::config::TensorConfig;
use crate::descriptor::{build_tensor, TensorDescriptor};
use crate::device::Device;
use crate::driver::{ScalingFactor, TensorArg};
use crate::error::{fatal, HarnessResult};
use crate::handle::EngineHandle;
use crate::memory::DeviceBuffer;
use crate::types::DataType;

/// `dst[i] = scale * src[i]` with a cast from `src_type` to `dst_type`, for as
/// many elements as `dst` holds.
///
/// # Panics
///
/// If the two element kinds are equal; callers copy or transform instead.
pub fn convert_device_data(
    device: &Device,
    dst: &mut DeviceBuffer,
    dst_type: DataType,
    src: &DeviceBuffer,
    src_type: DataType,
    scale: f64,
) -> HarnessResult<()> {
    if dst_type == src_type {
        fatal!("No conversion needed");
    }
    let count = dst.len() / dst_type.size_in_bytes();
    log::debug!("converting {} elements from {} to {}", count, src_type, dst_type);
    device
        .driver()
        .convert_device_data(scale, dst.ptr(), dst_type, src.ptr(), src_type, count)?;
    Ok(())
}

/// `dst = alpha * src + beta * dst` between two layouts of the same shape and
/// element kind.
pub fn transform_tensor(
    handle: &EngineHandle,
    alpha: f64,
    beta: f64,
    src_desc: &TensorDescriptor,
    src: &DeviceBuffer,
    dst_desc: &TensorDescriptor,
    dst: &mut DeviceBuffer,
) -> HarnessResult<()> {
    let data_type = dst_desc.data_type();
    handle.driver().transform_tensor(
        handle.get(),
        ScalingFactor::for_data_type(alpha, data_type),
        TensorArg { desc: src_desc.raw(), data: src.ptr() },
        ScalingFactor::for_data_type(beta, data_type),
        TensorArg { desc: dst_desc.raw(), data: dst.ptr() },
    )?;
    Ok(())
}

/// Like [`transform_tensor`], but `src` and `dst` may differ in element kind.
///
/// The source is first converted, scaled by `alpha`, into a temporary with
/// the source's dimensions and strides and the destination's element kind.
///
/// # Panics
///
/// If the element kinds differ and the ranks do not match.
#[allow(clippy::too_many_arguments)]
pub fn convert_and_transform_tensor(
    device: &Device,
    handle: &EngineHandle,
    alpha: f64,
    beta: f64,
    src_desc: &TensorDescriptor,
    src: &DeviceBuffer,
    dst_desc: &TensorDescriptor,
    dst: &mut DeviceBuffer,
) -> HarnessResult<()> {
    let (src_type, dst_type) = (src_desc.data_type(), dst_desc.data_type());
    if src_type == dst_type {
        return transform_tensor(handle, alpha, beta, src_desc, src, dst_desc, dst);
    }
    if src_desc.rank() != dst_desc.rank() {
        fatal!(
            "cannot transform a rank {} tensor into rank {}",
            src_desc.rank(),
            dst_desc.rank()
        );
    }

    let temp_desc = build_tensor(
        device,
        &TensorConfig::strided(dst_type, src_desc.dimensions(), src_desc.strides()),
    )?;
    let mut temp = device.allocate(temp_desc.size_in_bytes()?)?;
    convert_device_data(device, &mut temp, dst_type, src, src_type, alpha)?;
    device.synchronize()?;
    transform_tensor(handle, 1.0, beta, &temp_desc, &temp, dst_desc, dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::download_values;
    use crate::random::{create_tensor_data, RandomGenerator};
    use crate::testing::host_device;
    use crate::types::TensorFormat;
    use half::f16;

    #[test]
    fn test_float_double_round_trip() {
        let (_host, device) = host_device();
        let values: Vec<f32> = vec![0.1, -2.5, 3.75, 1e-3];
        let mut src = device.allocate(16).unwrap();
        src.copy_from_host(bytemuck::cast_slice(&values)).unwrap();

        let mut wide = device.allocate(32).unwrap();
        convert_device_data(&device, &mut wide, DataType::Double, &src, DataType::Float, 1.0)
            .unwrap();
        let mut back = device.allocate(16).unwrap();
        convert_device_data(&device, &mut back, DataType::Float, &wide, DataType::Double, 1.0)
            .unwrap();

        let bytes = back.copy_to_host().unwrap();
        let round: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes);
        assert_eq!(round, values);
    }

    #[test]
    fn test_half_conversion_scales() {
        let (_host, device) = host_device();
        let values = [1.0f32, -0.5, 0.25];
        let mut src = device.allocate(12).unwrap();
        src.copy_from_host(bytemuck::cast_slice(&values)).unwrap();

        let mut half = device.allocate(6).unwrap();
        convert_device_data(&device, &mut half, DataType::Half, &src, DataType::Float, 2.0)
            .unwrap();
        let bytes = half.copy_to_host().unwrap();
        let decoded: Vec<f32> = bytes
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect();
        assert_eq!(decoded, vec![2.0, -1.0, 0.5]);
    }

    #[test]
    #[should_panic(expected = "No conversion needed")]
    fn test_same_type_conversion_is_fatal() {
        let (_host, device) = host_device();
        let src = device.allocate(8).unwrap();
        let mut dst = device.allocate(8).unwrap();
        let _ = convert_device_data(&device, &mut dst, DataType::Float, &src, DataType::Float, 1.0);
    }

    #[test]
    fn test_convert_and_transform_nchw_to_nhwc_double() {
        let (_host, device) = host_device();
        let handle = device.create_engine_handle().unwrap();
        let mut rng = RandomGenerator::new(21);
        let src_desc = build_tensor(
            &device,
            &TensorConfig::packed(DataType::Float, &[2, 3, 4, 5], TensorFormat::Nchw),
        )
        .unwrap();
        let dst_desc = build_tensor(
            &device,
            &TensorConfig::packed(DataType::Double, &[2, 3, 4, 5], TensorFormat::Nhwc),
        )
        .unwrap();
        let src = create_tensor_data(&device, &src_desc, -1.0, 1.0, &mut rng).unwrap();
        let mut dst = device.allocate(dst_desc.size_in_bytes().unwrap()).unwrap();

        let before = device.bytes_allocated();
        convert_and_transform_tensor(&device, &handle, 0.5, 0.0, &src_desc, &src, &dst_desc, &mut dst)
            .unwrap();
        assert_eq!(device.bytes_allocated(), before);

        // Logical element order is the same for both layouts.
        let expected = download_values(&device, &src_desc, &src).unwrap();
        let actual = download_values(&device, &dst_desc, &dst).unwrap();
        assert_eq!(expected.len(), actual.len());
        for (e, a) in expected.iter().zip(&actual) {
            assert!((0.5 * e - a).abs() < 1e-7, "{e} vs {a}");
        }
    }

    #[test]
    fn test_same_type_transform_accumulates() {
        let (_host, device) = host_device();
        let handle = device.create_engine_handle().unwrap();
        let desc = build_tensor(
            &device,
            &TensorConfig::packed(DataType::Float, &[1, 2, 2, 2], TensorFormat::Nchw),
        )
        .unwrap();
        let ones = vec![1.0f32; 8];
        let mut src = device.allocate(32).unwrap();
        src.copy_from_host(bytemuck::cast_slice(&ones)).unwrap();
        let mut dst = device.allocate(32).unwrap();
        dst.copy_from_host(bytemuck::cast_slice(&ones)).unwrap();

        convert_and_transform_tensor(&device, &handle, 2.0, 3.0, &desc, &src, &desc, &mut dst)
            .unwrap();
        assert!(download_values(&device, &desc, &dst).unwrap().iter().all(|&v| v == 5.0));
    }
}
