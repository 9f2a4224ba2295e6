use zr_cuda::{CudaEngine, DistanceMetric};

fn engine() -> CudaEngine {
    let path = std::env::var("ZR_CUDA_KERNELS")
        .unwrap_or_else(|_| concat!(env!("CARGO_MANIFEST_DIR"), "/kernels/engine.ptx").to_owned());
    CudaEngine::new(0, path).unwrap()
}

fn assert_close(expected: f32, actual: f32) {
    assert!(
        (expected - actual).abs() <= 1e-5 * expected.abs().max(1.0),
        "expected {} got {}",
        expected,
        actual
    );
}

#[test]
fn euclidean_and_manhattan() {
    let engine = engine();
    engine.push_layer();

    let a = engine.to_device(&[1.0, 2.0, 3.0]).unwrap();
    let b = engine.to_device(&[4.0, 0.0, 3.0]).unwrap();

    let euclidean = engine.euclidean_distance(&a, &b, 3).unwrap();
    assert_close(13.0f32.sqrt(), euclidean);

    let manhattan = engine.manhattan_distance(&a, &b, 3).unwrap();
    assert_close(5.0, manhattan);

    engine.pop_layer();
}

#[test]
fn cosine_of_parallel_and_orthogonal_vectors() {
    let engine = engine();
    engine.push_layer();

    let a = engine.to_device(&[1.0, 0.0]).unwrap();
    let parallel = engine.to_device(&[2.0, 0.0]).unwrap();
    let orthogonal = engine.to_device(&[0.0, 3.0]).unwrap();

    assert_close(0.0, engine.cosine_distance(&a, &parallel, 2).unwrap());
    assert_close(1.0, engine.cosine_distance(&a, &orthogonal, 2).unwrap());

    engine.pop_layer();
}

#[test]
fn cosine_degenerate_policy() {
    let engine = engine();
    engine.push_layer();

    let zero = engine.to_device(&[0.0, 0.0, 0.0]).unwrap();
    let other_zero = engine.to_device(&[0.0, 0.0, 0.0]).unwrap();
    let nonzero = engine.to_device(&[1.0, 2.0, 3.0]).unwrap();

    // two zero vectors are at distance 0, a zero and a nonzero vector at distance 1
    assert_eq!(engine.cosine_distance(&zero, &other_zero, 3).unwrap(), 0.0);
    assert_eq!(engine.cosine_distance(&zero, &nonzero, 3).unwrap(), 1.0);
    assert_eq!(engine.cosine_distance(&nonzero, &zero, 3).unwrap(), 1.0);

    engine.pop_layer();
}

#[test]
fn distance_matrix_euclidean_scenario() {
    let engine = engine();
    engine.push_layer();

    let vectors = vec![
        engine.to_device(&[1.0, 0.0]).unwrap(),
        engine.to_device(&[0.0, 1.0]).unwrap(),
    ];
    let compare_to = vec![engine.to_device(&[1.0, 0.0]).unwrap()];

    let (matrix, rows, columns) = engine
        .calculate_distances(&vectors, &compare_to, DistanceMetric::Euclidean)
        .unwrap();
    assert_eq!((rows, columns), (1, 2));

    let values = engine.to_host(&matrix, 2).unwrap();
    assert_close(0.0, values[0]);
    assert_close(2.0f32.sqrt(), values[1]);

    engine.pop_layer();
}

#[test]
fn distance_matrix_matches_pairwise_calls() {
    let engine = engine();
    engine.push_layer();

    let data_a: [&[f32]; 2] = [&[1.0, 2.0, 3.0], &[-1.0, 0.5, 2.0]];
    let data_b: [&[f32]; 3] = [&[0.0, 1.0, -1.0], &[2.0, 2.0, 2.0], &[0.0, 0.0, 0.0]];

    let vectors: Vec<_> = data_a.iter().map(|v| engine.to_device(v).unwrap()).collect();
    let compare_to: Vec<_> = data_b.iter().map(|v| engine.to_device(v).unwrap()).collect();

    for metric in [DistanceMetric::Euclidean, DistanceMetric::Manhattan, DistanceMetric::Cosine] {
        let (matrix, rows, columns) = engine.calculate_distances(&vectors, &compare_to, metric).unwrap();
        assert_eq!((rows, columns), (3, 2));
        let values = engine.to_host(&matrix, 6).unwrap();

        for (k, compare) in compare_to.iter().enumerate() {
            for (j, vector) in vectors.iter().enumerate() {
                let expected = match metric {
                    DistanceMetric::Euclidean => engine.euclidean_distance(vector, compare, 3).unwrap(),
                    DistanceMetric::Manhattan => engine.manhattan_distance(vector, compare, 3).unwrap(),
                    DistanceMetric::Cosine => engine.cosine_distance(vector, compare, 3).unwrap(),
                };
                assert_close(expected, values[k * columns + j]);
            }
        }
        engine.free(matrix);
    }

    engine.pop_layer();
}
