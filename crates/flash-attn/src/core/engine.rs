//! The engine/session object every operation is routed through.
//!
//! A [`FlashEngine`] is built once per configuration. It probes the host for
//! the number of parallel compute units, owns a dedicated `rayon` pool of that
//! size and remembers the device its outputs are bound to. Several engines
//! with different configurations can coexist in one process.

use std::thread;

use candle_core::{DType, Device, DeviceLocation, Tensor};

use super::config::{EngineConfig, PrecisionPolicy, MAX_HEAD_DIM};
use super::errors::{AttentionError, Result};

/// Properties of the compute target discovered at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Capabilities {
    /// Independent workers available to tile units.
    pub compute_units: usize,
    /// Device that input tensors must live on.
    pub location: DeviceLocation,
}

impl Capabilities {
    fn probe(config: &EngineConfig, device: &Device) -> Self {
        let compute_units = config.num_threads.unwrap_or_else(|| {
            thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        Self {
            compute_units,
            location: device.location(),
        }
    }
}

/// Tiled attention engine.
#[derive(Debug)]
pub struct FlashEngine {
    config: EngineConfig,
    capabilities: Capabilities,
    device: Device,
    pool: rayon::ThreadPool,
}

impl FlashEngine {
    /// Validate `config`, probe the host and spin up the worker pool.
    pub fn new(config: EngineConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let capabilities = Capabilities::probe(&config, device);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(capabilities.compute_units)
            .thread_name(|idx| format!("flash-attn-{idx}"))
            .build()
            .map_err(|err| AttentionError::Config {
                context: format!("failed to build worker pool: {err}"),
            })?;
        log::info!(
            "flash-attn engine init: device={:?} compute_units={} tile_q={} tile_k={} head_dim_alignment={} precision={:?} max_splits={}",
            capabilities.location,
            capabilities.compute_units,
            config.tile_q,
            config.tile_k,
            config.head_dim_alignment,
            config.precision,
            config.max_splits
        );
        Ok(Self {
            config,
            capabilities,
            device: device.clone(),
            pool,
        })
    }

    /// Engine on the CPU with defaults layered under `FLASH_ATTN_*` overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = EngineConfig::default();
        config.apply_env_overrides();
        Self::new(config, &Device::Cpu)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Run `op` inside this engine's worker pool.
    pub(crate) fn install<R, F>(&self, op: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        self.pool.install(op)
    }

    /// Dtype produced for outputs derived from inputs of `input`.
    pub(crate) fn output_dtype(&self, input: DType) -> DType {
        match self.config.precision {
            PrecisionPolicy::Inherit => input,
            PrecisionPolicy::ForceF32 => DType::F32,
        }
    }

    pub(crate) fn padded_head_dim(&self, head_dim: usize) -> usize {
        self.config.padded_head_dim(head_dim)
    }

    /// Device, dtype and head-dim checks shared by every entry point.
    pub(crate) fn check_inputs(&self, tensors: &[(&str, &Tensor)]) -> Result<DType> {
        let Some((_, first)) = tensors.first() else {
            return Err(AttentionError::shape("no input tensors supplied"));
        };
        let dtype = first.dtype();
        if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
            return Err(AttentionError::dtype(format!(
                "inputs must be f32, f16 or bf16, got {dtype:?}"
            )));
        }
        for (name, tensor) in tensors {
            if !tensor.device().same_device(&self.device) {
                return Err(AttentionError::unsupported(format!(
                    "{name} lives on {:?} but the engine is bound to {:?}",
                    tensor.device().location(),
                    self.capabilities.location
                )));
            }
            if tensor.dtype() != dtype {
                return Err(AttentionError::dtype(format!(
                    "{name} has dtype {:?}, expected {dtype:?}",
                    tensor.dtype()
                )));
            }
            let head_dim = tensor.dims().last().copied().unwrap_or(0);
            if head_dim == 0 || head_dim > MAX_HEAD_DIM {
                return Err(AttentionError::unsupported(format!(
                    "{name} head dim {head_dim} outside 1..={MAX_HEAD_DIM}"
                )));
            }
        }
        Ok(dtype)
    }
}
