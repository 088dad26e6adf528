//! Learned parameters of the unrolled network.
//!
//! Every step of the solver reads one [IterationParams] set through a [ParameterRegistry]. The
//! registry maps iteration indices to parameter handles; weight sharing is expressed by mapping
//! all indices to the same handle. The mapping is resolved once when the solver is built.
//!
//! Parameter tensors are stored as flat vectors with explicit shape fields so that the registry
//! can be persisted as plain json.

use crate::config::ReconParams;
use crate::error::{shape, ReconError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;

/// step size used by the gradient update when it isn't learned
pub const FIXED_STEP: f32 = -2.0;

/// Square convolution kernel with weights in (out, in, ky, kx) order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvParams {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    pub weights: Vec<f32>,
    pub bias: Option<Vec<f32>>,
}

impl ConvParams {
    /// glorot-uniform weights and zero bias
    pub fn glorot<R: Rng>(in_channels: usize, out_channels: usize, kernel_size: usize, use_bias: bool, rng: &mut R) -> Self {
        let k2 = kernel_size * kernel_size;
        let fan_in = (in_channels * k2) as f32;
        let fan_out = (out_channels * k2) as f32;
        let limit = (6. / (fan_in + fan_out)).sqrt();
        let weights = (0..out_channels * in_channels * k2)
            .map(|_| rng.random_range(-limit..limit))
            .collect();
        Self {
            in_channels,
            out_channels,
            kernel_size,
            weights,
            bias: use_bias.then(|| vec![0.; out_channels]),
        }
    }

    /// checks the declared and stored shapes against what a layer expects
    pub fn validate(&self, in_channels: usize, out_channels: usize, kernel_size: usize, use_bias: bool) -> Result<()> {
        if (self.in_channels, self.out_channels, self.kernel_size) != (in_channels, out_channels, kernel_size) {
            return Err(shape(format!(
                "expected a {}x{} conv from {} to {} channels, found {}x{} from {} to {}",
                kernel_size, kernel_size, in_channels, out_channels,
                self.kernel_size, self.kernel_size, self.in_channels, self.out_channels
            )));
        }
        let n = out_channels * in_channels * kernel_size * kernel_size;
        if self.weights.len() != n {
            return Err(shape(format!("expected {} conv weights, found {}", n, self.weights.len())));
        }
        match (&self.bias, use_bias) {
            (Some(b), true) if b.len() == out_channels => Ok(()),
            (None, false) => Ok(()),
            (b, _) => Err(shape(format!(
                "conv bias mismatch: expected {}, found {:?} entries",
                if use_bias { out_channels } else { 0 },
                b.as_ref().map(|b| b.len())
            ))),
        }
    }

    #[inline(always)]
    pub fn weight(&self, o: usize, i: usize, ky: usize, kx: usize) -> f32 {
        let k = self.kernel_size;
        self.weights[((o * self.in_channels + i) * k + ky) * k + kx]
    }

    pub fn parameter_count(&self) -> usize {
        self.weights.len() + self.bias.as_ref().map_or(0, |b| b.len())
    }
}

/// per-channel affine parameters and moving statistics of a batch normalization layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchNormParams {
    pub gamma: Vec<f32>,
    pub beta: Vec<f32>,
    pub moving_mean: Vec<f32>,
    pub moving_variance: Vec<f32>,
}

impl BatchNormParams {
    /// unit scale, zero shift, zero mean and unit variance
    pub fn identity(channels: usize) -> Self {
        Self {
            gamma: vec![1.; channels],
            beta: vec![0.; channels],
            moving_mean: vec![0.; channels],
            moving_variance: vec![1.; channels],
        }
    }

    pub fn channels(&self) -> usize {
        self.gamma.len()
    }

    pub fn validate(&self, channels: usize) -> Result<()> {
        let lens = [self.gamma.len(), self.beta.len(), self.moving_mean.len(), self.moving_variance.len()];
        if lens.iter().any(|&l| l != channels) {
            return Err(shape(format!("expected batch norm over {} channels, found {:?}", channels, lens)));
        }
        if let Some((c, v)) = self.moving_variance.iter().enumerate().find(|&(_, &v)| !(v.is_finite() && v >= 0.)) {
            return Err(shape(format!("moving variance of channel {} must be finite and non-negative, found {}", c, v)));
        }
        Ok(())
    }

    pub fn parameter_count(&self) -> usize {
        4 * self.channels()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResBlockParams {
    /// 1x1 projection, present only when the block changes the channel count
    pub shortcut: Option<ConvParams>,
    pub norm1: Option<BatchNormParams>,
    pub conv1: ConvParams,
    pub norm2: Option<BatchNormParams>,
    pub conv2: ConvParams,
}

impl ResBlockParams {
    pub fn init<R: Rng>(in_channels: usize, out_channels: usize, kernel_size: usize, batchnorm: bool, rng: &mut R) -> Self {
        let use_bias = !batchnorm;
        Self {
            shortcut: (in_channels != out_channels)
                .then(|| ConvParams::glorot(in_channels, out_channels, 1, use_bias, rng)),
            norm1: batchnorm.then(|| BatchNormParams::identity(in_channels)),
            conv1: ConvParams::glorot(in_channels, out_channels, kernel_size, use_bias, rng),
            norm2: batchnorm.then(|| BatchNormParams::identity(out_channels)),
            conv2: ConvParams::glorot(out_channels, out_channels, kernel_size, use_bias, rng),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorParams {
    pub shortcut: Option<ConvParams>,
    pub blocks: Vec<ResBlockParams>,
    pub final_norm: Option<BatchNormParams>,
    pub final_conv: ConvParams,
}

impl PriorParams {
    #[allow(clippy::too_many_arguments)]
    pub fn init<R: Rng>(
        in_channels: usize,
        num_features: usize,
        out_channels: usize,
        num_blocks: usize,
        kernel_size: usize,
        batchnorm: bool,
        do_residual: bool,
        rng: &mut R,
    ) -> Self {
        let use_bias = !batchnorm;
        let shortcut = (do_residual && in_channels != out_channels)
            .then(|| ConvParams::glorot(in_channels, out_channels, 1, use_bias, rng));
        let blocks = (0..num_blocks)
            .map(|i| {
                let block_in = if i == 0 { in_channels } else { num_features };
                ResBlockParams::init(block_in, num_features, kernel_size, batchnorm, rng)
            })
            .collect();
        Self {
            shortcut,
            blocks,
            final_norm: batchnorm.then(|| BatchNormParams::identity(num_features)),
            final_conv: ConvParams::glorot(num_features, out_channels, kernel_size, use_bias, rng),
        }
    }
}

/// everything a single unrolled step reads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationParams {
    /// learned gradient step size, unused when the update is fixed
    pub step: Option<f32>,
    pub prior: PriorParams,
}

impl IterationParams {
    pub fn init<R: Rng>(params: &ReconParams, in_channels: usize, rng: &mut R) -> Self {
        Self {
            step: Some(FIXED_STEP),
            prior: PriorParams::init(
                in_channels,
                params.resblock_num_features,
                2,
                params.resblock_num_blocks,
                params.kernel_size,
                params.batchnorm,
                true,
                rng,
            ),
        }
    }
}

/// Maps iteration indices onto shared, immutable parameter sets
#[derive(Debug, Clone)]
pub struct ParameterRegistry {
    sets: Vec<Arc<IterationParams>>,
    slots: Vec<usize>,
}

#[derive(Serialize, Deserialize)]
struct StoredRegistry {
    sets: Vec<IterationParams>,
    slots: Vec<usize>,
}

impl ParameterRegistry {
    /// every iteration resolves to the same parameter set
    pub fn shared(set: IterationParams, num_steps: usize) -> Self {
        Self {
            sets: vec![Arc::new(set)],
            slots: vec![0; num_steps],
        }
    }

    /// one independent parameter set per iteration
    pub fn per_iteration(sets: Vec<IterationParams>) -> Self {
        let slots = (0..sets.len()).collect();
        Self {
            sets: sets.into_iter().map(Arc::new).collect(),
            slots,
        }
    }

    /// builds a registry from explicit slot assignments. Every slot must name an existing set.
    pub fn from_parts(sets: Vec<IterationParams>, slots: Vec<usize>) -> Result<Self> {
        if let Some((iteration, &slot)) = slots.iter().enumerate().find(|&(_, &s)| s >= sets.len()) {
            return Err(ReconError::MissingParameters {
                iteration,
                reason: format!("slot {} refers to one of only {} parameter sets", slot, sets.len()),
            });
        }
        Ok(Self {
            sets: sets.into_iter().map(Arc::new).collect(),
            slots,
        })
    }

    /// Allocates glorot-initialized parameters for a configuration. With weight sharing a single
    /// set is created, otherwise one per step.
    pub fn initialize(params: &ReconParams, seed: u64) -> Result<Self> {
        params.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        if params.resblock_share {
            let set = IterationParams::init(params, params.prior_in_channels(0), &mut rng);
            Ok(Self::shared(set, params.num_grad_steps))
        } else {
            let sets = (0..params.num_grad_steps)
                .map(|i| IterationParams::init(params, params.prior_in_channels(i), &mut rng))
                .collect();
            Ok(Self::per_iteration(sets))
        }
    }

    pub fn num_steps(&self) -> usize {
        self.slots.len()
    }

    pub fn num_sets(&self) -> usize {
        self.sets.len()
    }

    /// true when more than one iteration reads the same set
    pub fn is_shared(&self) -> bool {
        self.sets.len() < self.slots.len()
    }

    pub fn resolve(&self, iteration: usize) -> Result<Arc<IterationParams>> {
        let slot = *self.slots.get(iteration).ok_or_else(|| ReconError::MissingParameters {
            iteration,
            reason: format!("registry only covers {} iterations", self.slots.len()),
        })?;
        self.sets.get(slot).cloned().ok_or_else(|| ReconError::MissingParameters {
            iteration,
            reason: format!("slot {} has no parameter set", slot),
        })
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let stored = StoredRegistry {
            sets: self.sets.iter().map(|s| s.as_ref().clone()).collect(),
            slots: self.slots.clone(),
        };
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, &stored)?;
        Ok(())
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let stored: StoredRegistry = serde_json::from_reader(reader)?;
        Self::from_parts(stored.sets, stored.slots)
    }
}
