//! Unrolled ISTA reconstruction of under-sampled MRI data with a residual-network prior.

pub mod array_utils;
pub mod config;
pub mod data_import;
pub mod error;
pub mod fft;
pub mod fftshift;
pub mod layers;
pub mod logging;
pub mod params;
pub mod resnet;
pub mod signal_model;
pub mod tensor;
pub mod unroll;

pub use config::{DataLayout, NormMode, ReconParams, RenormClipping};
pub use error::{ReconError, Result};
pub use params::{IterationParams, ParameterRegistry};
pub use signal_model::{adjoint, apply_mask, forward, kspace_mask, SamplingMask, SenseOperator};
pub use tensor::FeatureMap;
pub use unroll::{reconstruct, Reconstruction, UnrolledIsta};
