//! Portable, exact attention used as the baseline for the tiled engine.
//!
//! These paths favour clarity over performance: the whole score matrix is
//! built with dense tensor ops and normalized in one softmax.

pub mod dense;

pub use dense::{DenseAttention, DenseOutput};
