#![allow(dead_code)]

use std::{fs, path::Path};

use candle_core::{DType, Device, Tensor};

const RESULTS_PATH: &str = "crates/flash-attn/benchmarks/RESULTS.md";

/// `[batch, seq, heads, head_dim]` normal samples cast to `dtype`.
pub fn random_input(
    device: &Device,
    dims: (usize, usize, usize, usize),
    dtype: DType,
) -> candle_core::Result<Tensor> {
    Tensor::randn(0f32, 1.0, dims, device)?.to_dtype(dtype)
}

pub fn markdown_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut lines = Vec::with_capacity(rows.len() + 2);
    lines.push(format!("| {} |", headers.join(" | ")));
    lines.push(format!("|{}", " --- |".repeat(headers.len())));
    lines.extend(rows.iter().map(|row| format!("| {} |", row.join(" | "))));
    let mut table = lines.join("\n");
    table.push('\n');
    table
}

/// Replace (or append) the section delimited by `<!-- NAME_START -->` and
/// `<!-- NAME_END -->` in the shared results file.
pub fn update_results(section: &str, content: &str) -> std::io::Result<()> {
    let name = section.to_uppercase();
    let (start, end) = (format!("<!-- {name}_START -->"), format!("<!-- {name}_END -->"));
    let path = Path::new(RESULTS_PATH);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut body = match fs::read_to_string(path) {
        Ok(body) => body,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            "# Flash Attention Benchmarks\n\n".to_string()
        }
        Err(err) => return Err(err),
    };

    let block = format!("{start}\n{content}\n{end}\n");
    match (body.find(&start), body.find(&end)) {
        (Some(from), Some(to)) => {
            let stop = (to + end.len() + 1).min(body.len());
            body.replace_range(from..stop, &block);
        }
        _ => {
            if !body.ends_with('\n') {
                body.push('\n');
            }
            body.push_str(&block);
        }
    }
    fs::write(path, body)
}

pub fn per_second(count: f64, seconds: f64) -> String {
    let rate = count / seconds;
    match rate {
        r if r >= 1e6 => format!("{:.2} M", r / 1e6),
        r if r >= 1e3 => format!("{:.2} K", r / 1e3),
        r => format!("{r:.2}"),
    }
}
