//! Numeric identifiers must match the engine's constants, since algorithm
//! and element-kind values cross the driver boundary as plain integers.

use convcheck::{
    BwdDataAlgo, BwdFilterAlgo, ConvolutionAlgo, ConvolutionMode, DataType, Direction, FwdAlgo,
    MathType, TensorFormat,
};

#[test]
fn test_algorithm_constants() {
    assert_eq!(FwdAlgo::COUNT, 8);
    assert_eq!(BwdDataAlgo::COUNT, 6);
    assert_eq!(BwdFilterAlgo::COUNT, 7);

    assert_eq!(FwdAlgo::Direct as i32, 3);
    assert_eq!(FwdAlgo::WinogradNonfused as i32, 7);
    assert_eq!(BwdDataAlgo::FftTiling as i32, 3);
    // FFT_TILING was appended after the Winograd variants for backward filter.
    assert_eq!(BwdFilterAlgo::Algo3 as i32, 3);
    assert_eq!(BwdFilterAlgo::FftTiling as i32, 6);
    assert_eq!(BwdFilterAlgo::FftTiling.name(), "CONVOLUTION_BWD_FILTER_ALGO_FFT_TILING");
}

#[test]
fn test_all_is_ascending_and_dense() {
    for direction in Direction::ALL {
        let all = ConvolutionAlgo::all(direction);
        assert_eq!(all.len(), direction.algorithm_count());
        for (position, algo) in all.iter().enumerate() {
            assert_eq!(algo.index(), position, "{algo}");
            assert_eq!(algo.direction(), direction);
            assert_eq!(ConvolutionAlgo::from_index(direction, position), Some(*algo));
        }
        assert_eq!(ConvolutionAlgo::from_index(direction, all.len()), None);
    }
}

#[test]
fn test_descriptor_enum_constants() {
    let raw: Vec<i32> = DataType::ALL.iter().map(|&t| t as i32).collect();
    assert_eq!(raw, vec![0, 1, 2, 3, 4, 5]);
    for data_type in DataType::ALL {
        assert_eq!(DataType::from_raw(data_type as i32), Some(data_type));
    }
    assert_eq!(DataType::from_raw(6), None);
    assert_eq!(DataType::Int8x4.name(), "DATA_INT8x4");

    assert_eq!(TensorFormat::ALL.map(|f| f as i32), [0, 1, 2]);
    assert_eq!(ConvolutionMode::CrossCorrelation as i32, 1);
    assert_eq!(MathType::TensorOp as i32, 1);
}
