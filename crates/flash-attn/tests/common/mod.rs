#![allow(dead_code)]

use candle_core::{DType, Device, Tensor};
use flash_attn::{EngineConfig, FlashEngine};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Engine with small tiles so short sequences still span several tiles.
pub fn engine() -> FlashEngine {
    engine_with(EngineConfig {
        tile_q: 3,
        tile_k: 4,
        ..EngineConfig::default()
    })
}

pub fn engine_with(config: EngineConfig) -> FlashEngine {
    FlashEngine::new(config, &Device::Cpu).expect("engine")
}

/// Uniform `[-1, 1)` tensor with a fixed seed.
pub fn random(shape: &[usize], seed: u64) -> Tensor {
    let mut rng = StdRng::seed_from_u64(seed);
    let len = shape.iter().product();
    let data: Vec<f32> = (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect();
    Tensor::from_vec(data, shape, &Device::Cpu).expect("tensor")
}

pub fn values(tensor: &Tensor) -> Vec<f32> {
    tensor
        .to_dtype(DType::F32)
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1::<f32>())
        .expect("values")
}

/// Largest elementwise difference; equal infinities count as zero.
pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    assert_eq!(a.dims(), b.dims());
    values(a)
        .iter()
        .zip(values(b))
        .map(|(x, y)| if *x == y { 0.0 } else { (x - y).abs() })
        .fold(0.0, f32::max)
}
