//! Tolerance harness comparing the tiled engine with the dense reference.
//! Run with: `cargo bench -p flash-attn --bench correctness`

#[path = "common/mod.rs"]
mod util;

use std::error::Error;

use candle_core::{DType, Device, Tensor};
use flash_attn::{AttentionKernel, AttentionParams, DenseAttention, FlashEngine, Window};
use util::{markdown_table, random_input, update_results};

/// Log-sum-exp is always produced in `f32`.
const LSE_TOL: f32 = 1e-4;

/// Outputs are rounded to the input dtype, so one ulp near 2.0 is allowed.
fn output_tolerance(dtype: DType) -> f32 {
    match dtype {
        DType::F32 => 1e-4,
        DType::F16 => 4e-3,
        _ => 3e-2,
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("correctness harness failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let device = Device::Cpu;
    let engine = FlashEngine::from_env()?;
    let variants = [
        ("full", AttentionParams::new()),
        ("causal", AttentionParams::causal()),
        ("window 64", AttentionParams::causal().with_window(Window::new(Some(64), Some(0)))),
        ("softcap 30", AttentionParams::causal().with_softcap(30.0)),
    ];

    let mut rows = Vec::new();
    for seq_len in [32usize, 128, 512, 1024] {
        for head_dim in [64usize, 80, 128] {
            for dtype in [DType::F32, DType::BF16, DType::F16] {
                let q = random_input(&device, (1, seq_len, 8, head_dim), dtype)?;
                let k = random_input(&device, (1, seq_len, 2, head_dim), dtype)?;
                let v = random_input(&device, (1, seq_len, 2, head_dim), dtype)?;
                for (label, params) in &variants {
                    let flash = engine.attend(&q, &k, &v, params)?;
                    let dense = DenseAttention.attend(&q, &k, &v, params)?;
                    let (max_abs, max_rel) = deviation(&flash.out, &dense.out)?;
                    let (lse_diff, _) = deviation(&flash.lse, &dense.lse)?;

                    if max_abs > output_tolerance(dtype) || lse_diff > LSE_TOL {
                        return Err(format!(
                            "tolerance breach for {label} seq_len={seq_len} head_dim={head_dim} dtype={dtype:?}: \
                             abs={max_abs:.3e} rel={max_rel:.3e} lse={lse_diff:.3e}"
                        )
                        .into());
                    }
                    rows.push(vec![
                        label.to_string(),
                        format!("(1,8/2,{seq_len},{head_dim})"),
                        format!("{dtype:?}"),
                        format!("{max_abs:.2e}"),
                        format!("{max_rel:.2e}"),
                        format!("{lse_diff:.2e}"),
                    ]);
                }
            }
        }
    }

    let table = markdown_table(
        &["mask", "shape", "dtype", "max abs", "max rel", "max |Δlse|"],
        &rows,
    );
    println!("\nCorrectness summary:\n{table}");
    update_results("Correctness", &table)?;
    Ok(())
}

/// Largest absolute and relative differences, with equal infinities (masked
/// log-sum-exp rows) counted as zero.
fn deviation(actual: &Tensor, expected: &Tensor) -> candle_core::Result<(f32, f32)> {
    let actual = actual.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let expected = expected.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    Ok(actual
        .iter()
        .zip(&expected)
        .filter(|(a, e)| a != e)
        .fold((0.0f32, 0.0f32), |(abs, rel), (a, e)| {
            let diff = (a - e).abs();
            (abs.max(diff), rel.max(diff / e.abs().max(1e-5)))
        }))
}
