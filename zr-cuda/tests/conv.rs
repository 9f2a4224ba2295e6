use zr_cuda::CudaEngine;

fn engine() -> CudaEngine {
    let path = std::env::var("ZR_CUDA_KERNELS")
        .unwrap_or_else(|_| concat!(env!("CARGO_MANIFEST_DIR"), "/kernels/engine.ptx").to_owned());
    CudaEngine::new(0, path).unwrap()
}

#[test]
fn max_pool_non_overlapping() {
    let engine = engine();
    engine.push_layer();

    // 4x4 single-depth input with values 1..16 row-major
    let values: Vec<f32> = (1..=16).map(|v| v as f32).collect();
    let input = engine.to_device(&values).unwrap();

    let (pooled, indices, rows, columns) = engine
        .tensor_max_pool(&input, 4, 4, 1, 1, 2, 2, 2, 2, true)
        .unwrap();
    assert_eq!((rows, columns), (2, 2));
    assert_eq!(engine.to_host(&pooled, 4).unwrap(), vec![6.0, 8.0, 14.0, 16.0]);

    // the recorded maxima are the flat input positions of 6, 8, 14 and 16
    let indices = indices.unwrap();
    assert_eq!(engine.to_host(&indices, 4).unwrap(), vec![5.0, 7.0, 13.0, 15.0]);

    // an all-ones gradient scatters exactly onto those positions
    let gradient = engine.to_device(&[1.0; 4]).unwrap();
    let scattered = engine
        .tensor_reverse_max_pool(&gradient, &indices, 2, 2, 1, 1, 4, 4)
        .unwrap();
    let mut expected = vec![0.0f32; 16];
    for &index in &[5, 7, 13, 15] {
        expected[index] = 1.0;
    }
    assert_eq!(engine.to_host(&scattered, 16).unwrap(), expected);

    engine.pop_layer();
}

#[test]
fn max_pool_without_indices() {
    let engine = engine();
    engine.push_layer();

    let values: Vec<f32> = (1..=16).map(|v| v as f32).collect();
    let input = engine.to_device(&values).unwrap();
    let (pooled, indices, rows, columns) = engine
        .tensor_max_pool(&input, 4, 4, 1, 1, 2, 2, 2, 2, false)
        .unwrap();

    assert!(indices.is_none());
    assert_eq!((rows, columns), (2, 2));
    assert_eq!(engine.to_host(&pooled, 4).unwrap(), vec![6.0, 8.0, 14.0, 16.0]);

    engine.pop_layer();
}

/// Overlapping windows recording the same input cell must accumulate, not race.
#[test]
fn reverse_max_pool_accumulates_shared_maxima() {
    let engine = engine();
    engine.push_layer();

    let input = engine.to_device(&[1.0, 9.0, 1.0]).unwrap();
    let (pooled, indices, rows, columns) = engine
        .tensor_max_pool(&input, 1, 3, 1, 1, 2, 1, 1, 1, true)
        .unwrap();
    assert_eq!((rows, columns), (1, 2));
    assert_eq!(engine.to_host(&pooled, 2).unwrap(), vec![9.0, 9.0]);

    let gradient = engine.to_device(&[1.0, 1.0]).unwrap();
    let scattered = engine
        .tensor_reverse_max_pool(&gradient, &indices.unwrap(), 1, 2, 1, 1, 1, 3)
        .unwrap();
    assert_eq!(engine.to_host(&scattered, 3).unwrap(), vec![0.0, 2.0, 0.0]);

    engine.pop_layer();
}

#[test]
fn padding_round_trip() {
    let engine = engine();
    engine.push_layer();

    // 2x3 slices, depth 2, count 2
    let values: Vec<f32> = (0..24).map(|v| v as f32).collect();
    let input = engine.to_device(&values).unwrap();

    let (padded, rows, columns) = engine.tensor_add_padding(&input, 2, 3, 2, 2, 2).unwrap();
    assert_eq!((rows, columns), (6, 7));

    // the core of the first slice sits surrounded by zeros
    let padded_values = engine.to_host(&padded, 6 * 7 * 4).unwrap();
    assert_eq!(padded_values[2 * 7 + 2], 0.0);
    assert_eq!(padded_values[2 * 7 + 3], 1.0);
    assert_eq!(padded_values[0], 0.0);

    let (restored, rows, columns) = engine.tensor_remove_padding(&padded, 6, 7, 2, 2, 2).unwrap();
    assert_eq!((rows, columns), (2, 3));
    assert_eq!(engine.to_host(&restored, 24).unwrap(), values);

    engine.pop_layer();
}

#[test]
fn padding_round_trip_is_identity_for_zero() {
    let engine = engine();
    engine.push_layer();

    let values: Vec<f32> = (0..6).map(|v| v as f32).collect();
    let input = engine.to_device(&values).unwrap();
    let (padded, rows, columns) = engine.tensor_add_padding(&input, 2, 3, 1, 1, 0).unwrap();
    assert_eq!((rows, columns), (2, 3));
    assert_eq!(engine.to_host(&padded, 6).unwrap(), values);

    engine.pop_layer();
}

#[test]
fn im2col_overlapping_windows() {
    let engine = engine();
    engine.push_layer();

    // 3x3 input 1..9, 2x2 filter, stride 1: four placements in row-major order
    let values: Vec<f32> = (1..=9).map(|v| v as f32).collect();
    let input = engine.to_device(&values).unwrap();

    let (matrix, rows, columns, count) = engine
        .tensor_im2col(&input, 3, 3, 1, 1, 2, 2, 1, 1)
        .unwrap();
    assert_eq!((rows, columns, count), (4, 4, 1));

    let expected = vec![
        1.0, 2.0, 4.0, 5.0, //
        2.0, 3.0, 5.0, 6.0, //
        4.0, 5.0, 7.0, 8.0, //
        5.0, 6.0, 8.0, 9.0, //
    ];
    assert_eq!(engine.to_host(&matrix, 16).unwrap(), expected);

    engine.pop_layer();
}

#[test]
fn im2col_interleaves_depth() {
    let engine = engine();
    engine.push_layer();

    // two 2x2 slices, one placement covering everything
    let values: Vec<f32> = vec![1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0];
    let input = engine.to_device(&values).unwrap();

    let (matrix, rows, columns, count) = engine
        .tensor_im2col(&input, 2, 2, 2, 1, 2, 2, 1, 1)
        .unwrap();
    assert_eq!((rows, columns, count), (1, 8, 1));
    assert_eq!(
        engine.to_host(&matrix, 8).unwrap(),
        vec![1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0]
    );

    engine.pop_layer();
}

#[test]
fn reverse_im2col_single_placement() {
    let engine = engine();
    engine.push_layer();

    // one placement of a 2x2 filter over a 2x2 input: the scattered gradient is the filter
    // scaled by the single upstream gradient value
    let gradient = engine.to_device(&[2.0]).unwrap();
    let filters = engine.to_device(&[1.0, 2.0, 3.0, 4.0]).unwrap();

    let (output, rows, columns, depth) = engine
        .tensor_reverse_im2col(&gradient, &filters, 1, 1, 1, 1, 2, 2, 1, 2, 2, 1, 1)
        .unwrap();
    assert_eq!((rows, columns, depth), (2, 2, 1));
    assert_eq!(engine.to_host(&output, 4).unwrap(), vec![2.0, 4.0, 6.0, 8.0]);

    engine.pop_layer();
}

/// Overlapping placements accumulate contributions per input cell.
#[test]
fn reverse_im2col_overlapping_placements() {
    let engine = engine();
    engine.push_layer();

    // 1x2 filter sliding over a 1x3 input: placements at x=0 and x=1, the middle cell is
    // touched by both
    let gradient = engine.to_device(&[1.0, 1.0]).unwrap();
    let filters = engine.to_device(&[1.0, 10.0]).unwrap();

    let (output, rows, columns, depth) = engine
        .tensor_reverse_im2col(&gradient, &filters, 1, 2, 1, 1, 1, 3, 1, 2, 1, 1, 1)
        .unwrap();
    assert_eq!((rows, columns, depth), (1, 3, 1));
    assert_eq!(engine.to_host(&output, 3).unwrap(), vec![1.0, 11.0, 10.0]);

    engine.pop_layer();
}

#[test]
fn occupancy_cache_is_stable_across_shapes() {
    let engine = engine();
    engine.push_layer();

    // the same kernel planned for growing shapes keeps its block dimensions, and the pooled
    // results stay correct, which pins the grid scaling
    for size in [64usize, 1024, 100_000] {
        let values = vec![1.0f32; size];
        let buffer = engine.to_device(&values).unwrap();
        let doubled = engine.pow(&buffer, size, 2.0).unwrap();
        assert_eq!(engine.sum_values(&doubled, size).unwrap(), size as f32);
        engine.free(buffer);
        engine.free(doubled);
    }

    engine.pop_layer();
}
