use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use zr_cuda::CudaEngine;

fn engine() -> CudaEngine {
    let path = std::env::var("ZR_CUDA_KERNELS")
        .unwrap_or_else(|_| concat!(env!("CARGO_MANIFEST_DIR"), "/kernels/engine.ptx").to_owned());
    CudaEngine::new(0, path).unwrap()
}

/// Sizes around the reduction block boundary plus a couple of large ones.
const SIZES: &[usize] = &[0, 1, 2, 100, 255, 256, 257, 512, 1000, 4096, 10_000];

fn random_values(size: usize, rng: &mut StdRng) -> Vec<f32> {
    (0..size).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

#[test]
fn sum_matches_host() {
    let engine = engine();
    let mut rng = StdRng::seed_from_u64(456);

    for &size in SIZES {
        engine.push_layer();
        let values = random_values(size, &mut rng);
        let buffer = engine.to_device(&values).unwrap();

        let actual = engine.sum_values(&buffer, size).unwrap();

        // f64 reference; the tolerance scales with the absolute mass being summed, since both
        // the device tree and any f32 reference accumulate rounding proportional to it
        let expected: f64 = values.iter().map(|&v| v as f64).sum();
        let magnitude: f64 = values.iter().map(|&v| v.abs() as f64).sum();
        let tolerance = 1e-5 * magnitude.max(1.0);
        assert!(
            (expected - actual as f64).abs() <= tolerance,
            "size {}: expected {} got {}",
            size,
            expected,
            actual
        );

        engine.pop_layer();
    }
}

#[test]
fn min_and_max_match_host() {
    let engine = engine();
    let mut rng = StdRng::seed_from_u64(457);

    for &size in SIZES {
        engine.push_layer();
        let values = random_values(size, &mut rng);
        let buffer = engine.to_device(&values).unwrap();

        let (min, max) = engine.find_min_and_max(&buffer, size).unwrap();
        if size == 0 {
            assert_eq!((min, max), (0.0, 0.0));
        } else {
            // min/max pass values through unchanged, so the comparison is exact
            let expected_min = values.iter().copied().fold(f32::MAX, f32::min);
            let expected_max = values.iter().copied().fold(f32::MIN, f32::max);
            assert_eq!(min, expected_min, "size {}", size);
            assert_eq!(max, expected_max, "size {}", size);
        }

        engine.pop_layer();
    }
}

#[test]
fn std_dev_matches_host() {
    let engine = engine();
    let mut rng = StdRng::seed_from_u64(458);
    let distribution = Normal::new(0.0f32, 2.0).unwrap();

    for &size in SIZES {
        engine.push_layer();
        let values: Vec<f32> = (0..size).map(|_| distribution.sample(&mut rng)).collect();
        let buffer = engine.to_device(&values).unwrap();

        let mean = if size == 0 {
            0.0
        } else {
            (values.iter().map(|&v| v as f64).sum::<f64>() / size as f64) as f32
        };
        let actual = engine.find_std_dev(&buffer, size, mean).unwrap();

        let expected = if size == 0 {
            0.0
        } else {
            let mean = mean as f64;
            (values
                .iter()
                .map(|&v| (v as f64 - mean) * (v as f64 - mean))
                .sum::<f64>()
                / size as f64)
                .sqrt()
        };
        assert!(
            (expected - actual as f64).abs() <= 1e-4 * expected.max(1.0),
            "size {}: expected {} got {}",
            size,
            expected,
            actual
        );

        engine.pop_layer();
    }
}

/// All-positive input must not be polluted by zero partials from rounding the block count up.
#[test]
fn min_of_positive_values_stays_positive() {
    let engine = engine();
    engine.push_layer();

    let values = vec![5.0f32; 512];
    let buffer = engine.to_device(&values).unwrap();
    let (min, max) = engine.find_min_and_max(&buffer, 512).unwrap();
    assert_eq!((min, max), (5.0, 5.0));

    engine.pop_layer();
}
