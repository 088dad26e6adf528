//! Unrolled ISTA reconstruction.
//!
//! A fixed number of proximal gradient steps is applied to the zero-filled reconstruction:
//!
//! x_{k+1} = P( x_k + t * (A^H W A x_k - A^H W b) )
//!
//! where the proximal operator P is a residual-network prior with learned parameters. After the last
//! step the measured samples are optionally re-inserted into the predicted k-space.

use crate::array_utils::{all_finite, channels_to_complex, complex_to_channels};
use crate::config::{DataLayout, ReconParams};
use crate::error::{ReconError, Result};
use crate::params::{IterationParams, ParameterRegistry, FIXED_STEP};
use crate::resnet::{PriorConfig, PriorNetwork};
use crate::signal_model::{SamplingMask, SenseOperator};
use crate::tensor::FeatureMap;
use cfl::ndarray::{Array3, Array4, ArrayD};
use cfl::num_complex::Complex32;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// complex channels of the prior output
const PRIOR_OUT_CHANNELS: usize = 2;

/// output of a reconstruction
#[derive(Debug, Clone)]
pub struct Reconstruction {
    /// coil-combined image (batch, z, y)
    pub image: Array3<Complex32>,
    /// k-space of the final image (batch, coils, z, y)
    pub kspace: Array4<Complex32>,
    /// image after every step, keyed by `iter_00`, `iter_01`, ...
    pub iterations: BTreeMap<String, Array3<Complex32>>,
}

/// An unrolled solver bound to one configuration and one set of learned parameters. Parameter
/// handles are resolved once on construction and only read afterwards, so a solver can be shared
/// between threads.
#[derive(Debug, Clone)]
pub struct UnrolledIsta {
    params: ReconParams,
    prior: PriorConfig,
    steps: Vec<Arc<IterationParams>>,
}

/// key of the image after step `i` in [Reconstruction::iterations]
fn iteration_name(i: usize) -> String {
    format!("iter_{:02}", i)
}

/// prior input of a step: the update followed by every earlier dense tap
fn dense_input(z: FeatureMap, acc: Option<&FeatureMap>) -> Result<FeatureMap> {
    match acc {
        Some(acc) => FeatureMap::concat_channels(&[&z, acc]),
        None => Ok(z),
    }
}

/// appends the dense tap of the latest step after the earlier ones
fn append_dense(acc: Option<FeatureMap>, dense_k: FeatureMap) -> Result<FeatureMap> {
    match acc {
        Some(acc) => FeatureMap::concat_channels(&[&acc, &dense_k]),
        None => Ok(dense_k),
    }
}

impl UnrolledIsta {
    pub fn new(params: &ReconParams, registry: &ParameterRegistry) -> Result<Self> {
        params.validate()?;
        let n = params.num_grad_steps;

        info!("building unrolled network ({} steps)", n);
        info!("prior: {} res blocks, {} features", params.resblock_num_blocks, params.resblock_num_features);
        if params.resblock_share {
            info!("sharing weights across steps");
        }
        if params.do_dense {
            info!("inserting dense connections");
        }
        if !params.batchnorm {
            info!("batch normalization is off");
        }
        if !params.circular {
            warn!("circular convolutions are off");
        }
        if params.hard_projection {
            info!("final hard data projection");
        }

        let steps = (0..n).map(|i| registry.resolve(i)).collect::<Result<Vec<_>>>()?;

        if params.resblock_share {
            if let Some((i, _)) = steps.iter().enumerate().find(|(_, s)| !Arc::ptr_eq(s, &steps[0])) {
                return Err(ReconError::MissingParameters {
                    iteration: i,
                    reason: "weight sharing is on but the iteration resolves to its own parameter set".to_string(),
                });
            }
        }

        let prior = PriorConfig::from_params(params);
        for (i, set) in steps.iter().enumerate() {
            if !params.fix_update && set.step.is_none() {
                return Err(ReconError::MissingParameters {
                    iteration: i,
                    reason: "learned step size is missing".to_string(),
                });
            }
            PriorNetwork::new(&set.prior, params.prior_in_channels(i), PRIOR_OUT_CHANNELS, prior)
                .map_err(|e| ReconError::MissingParameters { iteration: i, reason: e.to_string() })?;
        }

        Ok(Self {
            params: params.clone(),
            prior,
            steps,
        })
    }

    pub fn num_steps(&self) -> usize {
        self.steps.len()
    }

    fn step_size(&self, i: usize, set: &IterationParams) -> Result<f32> {
        if self.params.fix_update {
            return Ok(FIXED_STEP);
        }
        set.step.ok_or_else(|| ReconError::MissingParameters {
            iteration: i,
            reason: "learned step size is missing".to_string(),
        })
    }

    /// Reconstructs a (batch, coils, z, y) k-space. Without a mask, samples with a non-zero
    /// magnitude are treated as acquired. Without sensitivity maps the data must have one coil.
    pub fn reconstruct(
        &self,
        kspace: &Array4<Complex32>,
        sensitivity: Option<&Array4<Complex32>>,
        mask: Option<&ArrayD<f32>>,
    ) -> Result<Reconstruction> {
        let dim = kspace.dim();
        let mask = match mask {
            Some(m) => SamplingMask::new(m, dim)?,
            None => SamplingMask::from_kspace(kspace),
        };
        let op = SenseOperator::new(dim, sensitivity, mask)?;
        if op.has_sensitivity() {
            debug!("using sensitivity maps");
        }
        let mode = self.params.norm_mode();
        let layout = self.params.prior_layout;

        let ks0 = op.mask().apply(kspace)?;
        let im0 = op.adjoint(&ks0)?;

        let mut im = im0.clone();
        let mut dense: Option<FeatureMap> = None;
        let mut iterations = BTreeMap::new();

        for (i, set) in self.steps.iter().enumerate() {
            let t = self.step_size(i, set)?;
            let grad = &op.normal(&im)? - &im0;
            let update = &complex_to_channels(&im) + &(complex_to_channels(&grad) * t);
            let z = FeatureMap::new(update, DataLayout::ChannelsLast).into_layout(layout);

            let input = dense_input(z, dense.as_ref())?;
            let prior = PriorNetwork::new(&set.prior, input.channels(), PRIOR_OUT_CHANNELS, self.prior)?;
            let (out, dense_k) = prior.forward(&input, mode)?;

            if self.params.do_dense {
                dense = Some(append_dense(dense.take(), dense_k)?);
            }

            im = channels_to_complex(&out.into_layout(DataLayout::ChannelsLast).into_data());
            debug_assert!(all_finite(&im), "non-finite image after step {}", i);
            debug!(step = i, "finished unrolled step");
            iterations.insert(iteration_name(i), im.clone());
        }

        let mut ks = op.forward(&im)?;
        if self.params.hard_projection {
            ks = op.mask().project(&ks0, &ks, self.params.mask_output)?;
            im = op.adjoint(&ks)?;
        }

        Ok(Reconstruction {
            image: im,
            kspace: ks,
            iterations,
        })
    }
}

/// builds a solver for the configuration and parameters and runs a single reconstruction
pub fn reconstruct(
    kspace: &Array4<Complex32>,
    sensitivity: Option<&Array4<Complex32>>,
    mask: Option<&ArrayD<f32>>,
    params: &ReconParams,
    registry: &ParameterRegistry,
) -> Result<Reconstruction> {
    UnrolledIsta::new(params, registry)?.reconstruct(kspace, sensitivity, mask)
}
