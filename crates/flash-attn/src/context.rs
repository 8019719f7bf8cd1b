//! Explicit state carried from a forward call to its backward call.
//!
//! A [`SavedContext`] holds copies of every tensor backward needs together
//! with the resolved scalar configuration, so backward is a pure function of
//! the context and the incoming output gradient. The struct serializes to
//! JSON; tensors are stored as shape, element type and `f32` data.

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::core::{AttentionError, AttentionParams, Result};
use crate::indexer::SeqLayout;

/// Element types a saved tensor can be restored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SavedDType {
    F32,
    F16,
    BF16,
}

impl SavedDType {
    fn from_dtype(dtype: DType) -> Result<Self> {
        match dtype {
            DType::F32 => Ok(Self::F32),
            DType::F16 => Ok(Self::F16),
            DType::BF16 => Ok(Self::BF16),
            other => Err(AttentionError::dtype(format!(
                "cannot save a tensor of dtype {other:?}"
            ))),
        }
    }

    pub fn dtype(self) -> DType {
        match self {
            Self::F32 => DType::F32,
            Self::F16 => DType::F16,
            Self::BF16 => DType::BF16,
        }
    }
}

/// Host copy of one tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedTensor {
    pub dims: Vec<usize>,
    pub dtype: SavedDType,
    /// Masked rows store `-inf` in the log-sum-exp, which JSON numbers
    /// cannot carry; non-finite values are written as strings.
    #[serde(with = "non_finite")]
    pub data: Vec<f32>,
}

mod non_finite {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f32),
        Special(String),
    }

    pub fn serialize<S: Serializer>(data: &[f32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(data.iter().map(|&x| {
            if x.is_finite() {
                Repr::Number(x)
            } else if x.is_nan() {
                Repr::Special("nan".to_owned())
            } else if x > 0.0 {
                Repr::Special("inf".to_owned())
            } else {
                Repr::Special("-inf".to_owned())
            }
        }))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f32>, D::Error> {
        Vec::<Repr>::deserialize(deserializer)?
            .into_iter()
            .map(|repr| match repr {
                Repr::Number(x) => Ok(x),
                Repr::Special(s) => match s.as_str() {
                    "nan" => Ok(f32::NAN),
                    "inf" => Ok(f32::INFINITY),
                    "-inf" => Ok(f32::NEG_INFINITY),
                    other => Err(D::Error::custom(format!("invalid float literal {other:?}"))),
                },
            })
            .collect()
    }
}

impl SavedTensor {
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let dtype = SavedDType::from_dtype(tensor.dtype())?;
        let data = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        Ok(Self {
            dims: tensor.dims().to_vec(),
            dtype,
            data,
        })
    }

    /// Restore the tensor in its original dtype on `device`.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let tensor = Tensor::from_slice(&self.data, self.dims.as_slice(), device)?;
        Ok(tensor.to_dtype(self.dtype.dtype())?)
    }

    /// Error unless `data` holds exactly one value per element of `dims`.
    pub(crate) fn check_len(&self, name: &str) -> Result<()> {
        let elements = self
            .dims
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim));
        if elements != Some(self.data.len()) {
            return Err(AttentionError::shape(format!(
                "saved {name} holds {} values for dims {:?}",
                self.data.len(),
                self.dims
            )));
        }
        Ok(())
    }

    pub(crate) fn last_dim(&self) -> usize {
        self.dims.last().copied().unwrap_or(0)
    }
}

/// Everything backward needs from one forward call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedContext {
    pub q: SavedTensor,
    pub k: SavedTensor,
    pub v: SavedTensor,
    pub out: SavedTensor,
    /// Log-sum-exp exactly as returned by the forward call.
    pub lse: SavedTensor,
    /// Parameters with the softmax scale filled in.
    pub params: AttentionParams,
    pub layout: SeqLayout,
    /// Run backward with the bitwise-reproducible schedule.
    pub deterministic: bool,
}

impl SavedContext {
    pub(crate) fn capture(
        tensors: [&Tensor; 5],
        params: AttentionParams,
        layout: SeqLayout,
    ) -> Result<Self> {
        let [q, k, v, out, lse] = tensors;
        Ok(Self {
            q: SavedTensor::from_tensor(q)?,
            k: SavedTensor::from_tensor(k)?,
            v: SavedTensor::from_tensor(v)?,
            out: SavedTensor::from_tensor(out)?,
            lse: SavedTensor::from_tensor(lse)?,
            params,
            layout,
            deterministic: false,
        })
    }

    pub fn with_deterministic(mut self, deterministic: bool) -> Self {
        self.deterministic = deterministic;
        self
    }

    pub fn head_dim(&self) -> usize {
        self.q.last_dim()
    }

    /// Resolved softmax scale.
    pub fn scale(&self) -> f32 {
        self.params.resolved_scale(self.head_dim())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
