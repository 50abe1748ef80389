//! Support predicates and workspace cost of each algorithm on the host
//! engine. Costs are deterministic functions of the problem shape, sized like
//! the scratch buffers the corresponding device kernels would need.

use crate::algorithm::{BwdDataAlgo, BwdFilterAlgo, ConvolutionAlgo, FwdAlgo};
use crate::error::{EngineResult, EngineStatus};
use crate::types::DataType;

use super::reference::Geometry;

/// Edge of one FFT tile.
const FFT_TILE: usize = 32;
/// Output tile edge of the Winograd transforms.
const WINOGRAD_TILE: usize = 4;
/// Bytes of one complex single-precision value.
const COMPLEX_BYTES: usize = 8;

pub(super) fn workspace_size(algo: ConvolutionAlgo, geometry: &Geometry) -> EngineResult<usize> {
    let elem = geometry.data_type.size_in_bytes();
    match algo {
        ConvolutionAlgo::Forward(algo) => match algo {
            FwdAlgo::ImplicitGemm => Ok(0),
            FwdAlgo::ImplicitPrecompGemm => {
                Ok(geometry.output_spatial() * geometry.filter_spatial() * std::mem::size_of::<i32>())
            }
            FwdAlgo::Gemm => Ok(column_len(geometry) * elem),
            FwdAlgo::Direct => Err(EngineStatus::NotSupported),
            FwdAlgo::Fft => fft(geometry),
            FwdAlgo::FftTiling => fft_tiling(geometry),
            FwdAlgo::Winograd => winograd(geometry),
            FwdAlgo::WinogradNonfused => winograd_nonfused(geometry),
        },
        ConvolutionAlgo::BackwardData(algo) => match algo {
            BwdDataAlgo::Algo0 | BwdDataAlgo::Algo1 => Ok(0),
            BwdDataAlgo::Fft => fft(geometry),
            BwdDataAlgo::FftTiling => fft_tiling(geometry),
            BwdDataAlgo::Winograd => winograd(geometry),
            BwdDataAlgo::WinogradNonfused => winograd_nonfused(geometry),
        },
        ConvolutionAlgo::BackwardFilter(algo) => match algo {
            BwdFilterAlgo::Algo0 => Ok(0),
            BwdFilterAlgo::Algo1 => Ok(column_len(geometry) * elem),
            BwdFilterAlgo::Fft => fft(geometry),
            BwdFilterAlgo::Algo3 => Ok(geometry.filter_len() * elem),
            BwdFilterAlgo::Winograd => Err(EngineStatus::NotSupported),
            BwdFilterAlgo::WinogradNonfused => winograd_nonfused(geometry),
            BwdFilterAlgo::FftTiling => fft_tiling(geometry),
        },
    }
}

/// Elements of the unfolded (im2col) input of one image.
fn column_len(geometry: &Geometry) -> usize {
    geometry.channels_per_group() * geometry.filter_spatial() * geometry.output_spatial()
}

/// Number of spectra the FFT algorithms keep: input, filter and output.
fn spectra(geometry: &Geometry) -> usize {
    let (n, c, k) = (geometry.batch, geometry.in_channels, geometry.out_channels);
    n * c + c * k + n * k
}

fn fft_shape(geometry: &Geometry) -> bool {
    geometry.spatial_rank() == 2
        && geometry.groups == 1
        && geometry.unit_stride_and_dilation()
        && geometry.data_type != DataType::Double
}

fn fft(geometry: &Geometry) -> EngineResult<usize> {
    if !fft_shape(geometry) {
        return Err(EngineStatus::NotSupported);
    }
    let padded: usize = geometry
        .input
        .iter()
        .zip(&geometry.pad)
        .map(|(&dim, &pad)| (dim + 2 * pad).next_power_of_two())
        .product();
    Ok(spectra(geometry) * padded * COMPLEX_BYTES)
}

fn fft_tiling(geometry: &Geometry) -> EngineResult<usize> {
    if !fft_shape(geometry) || geometry.filter.iter().any(|&f| f >= FFT_TILE) {
        return Err(EngineStatus::NotSupported);
    }
    Ok(spectra(geometry) * FFT_TILE * FFT_TILE * COMPLEX_BYTES)
}

fn winograd_shape(geometry: &Geometry, sizes: &[usize]) -> bool {
    geometry.spatial_rank() == 2
        && geometry.unit_stride_and_dilation()
        && geometry.filter[0] == geometry.filter[1]
        && sizes.contains(&geometry.filter[0])
        && geometry.data_type != DataType::Double
}

fn winograd(geometry: &Geometry) -> EngineResult<usize> {
    if !winograd_shape(geometry, &[3]) {
        return Err(EngineStatus::NotSupported);
    }
    // Transformed filter only; input and output tiles stay in registers.
    let tile = WINOGRAD_TILE * WINOGRAD_TILE;
    Ok(geometry.out_channels * geometry.channels_per_group() * tile * geometry.data_type.size_in_bytes())
}

fn winograd_nonfused(geometry: &Geometry) -> EngineResult<usize> {
    if !winograd_shape(geometry, &[3, 5]) || geometry.groups != 1 {
        return Err(EngineStatus::NotSupported);
    }
    let tiles: usize = geometry
        .output
        .iter()
        .map(|&dim| dim.div_ceil(WINOGRAD_TILE))
        .product();
    let edge = WINOGRAD_TILE + geometry.filter[0] - 1;
    let (n, c, k) = (geometry.batch, geometry.in_channels, geometry.out_channels);
    Ok((n * c * tiles + c * k + n * k * tiles) * edge * edge * geometry.data_type.size_in_bytes())
}
