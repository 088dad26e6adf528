use crate::error::{config, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

/// axis convention of a real-valued feature tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataLayout {
    /// (batch, channels, z, y)
    #[default]
    ChannelsFirst,
    /// (batch, z, y, channels)
    ChannelsLast,
}

/// selects which statistics batch normalization uses for a single forward evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormMode {
    Training,
    Inference,
}

impl NormMode {
    pub fn from_training(training: bool) -> Self {
        if training { NormMode::Training } else { NormMode::Inference }
    }
}

/// bounds on the batch renormalization corrections r and d
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RenormClipping {
    pub rmax: f32,
    pub dmax: f32,
}

/// Hyper-parameters of the unrolled network. These are fixed when the solver is built and are
/// written to / read from a toml file by the command line tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconParams {
    pub num_grad_steps: usize,
    pub resblock_num_features: usize,
    pub resblock_num_blocks: usize,
    pub resblock_share: bool,
    pub kernel_size: usize,
    pub mask_output: Option<f32>,
    pub hard_projection: bool,
    pub do_dense: bool,
    pub batchnorm: bool,
    pub batchnorm_epsilon: f32,
    pub circular: bool,
    pub fix_update: bool,
    pub training: bool,
    pub prior_layout: DataLayout,
    // kept last so the toml table follows all plain values
    pub renorm_clipping: Option<RenormClipping>,
}

impl Default for ReconParams {
    fn default() -> Self {
        Self {
            num_grad_steps: 4,
            resblock_num_features: 128,
            resblock_num_blocks: 3,
            resblock_share: false,
            kernel_size: 3,
            mask_output: Some(1.0),
            hard_projection: true,
            do_dense: false,
            batchnorm: true,
            batchnorm_epsilon: 1e-3,
            circular: true,
            fix_update: false,
            training: false,
            prior_layout: DataLayout::ChannelsFirst,
            renorm_clipping: None,
        }
    }
}

impl ReconParams {
    pub fn validate(&self) -> Result<()> {
        if self.resblock_num_features < 1 {
            return Err(config("resblock_num_features must be at least 1"));
        }
        if self.resblock_num_blocks < 1 {
            return Err(config("resblock_num_blocks must be at least 1"));
        }
        if self.kernel_size == 0 || self.kernel_size % 2 == 0 {
            return Err(config(format!("kernel_size must be odd, got {}", self.kernel_size)));
        }
        if self.batchnorm && !(self.batchnorm_epsilon > 0.) {
            return Err(config("batchnorm_epsilon must be positive"));
        }
        if let Some(clip) = &self.renorm_clipping {
            if !(clip.rmax >= 1.) || !(clip.dmax >= 0.) {
                return Err(config(format!("renorm clipping requires rmax >= 1 and dmax >= 0, got {:?}", clip)));
            }
        }
        // the prior input width grows every step when dense connections are on, so a single
        // parameter set can't serve more than one step
        if self.resblock_share && self.do_dense && self.num_grad_steps > 1 {
            return Err(config("weight sharing can't be combined with dense connections for more than one step"));
        }
        Ok(())
    }

    pub fn norm_mode(&self) -> NormMode {
        NormMode::from_training(self.training)
    }

    /// number of real channels entering the prior network at the given step
    pub fn prior_in_channels(&self, step: usize) -> usize {
        if self.do_dense {
            2 + step * self.resblock_num_features
        } else {
            2
        }
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut toml_str = String::new();
        File::open(path.as_ref())?.read_to_string(&mut toml_str)?;
        Ok(toml::from_str(&toml_str)?)
    }

    /// writes the parameters to a toml file, returning the path that was written
    pub fn to_toml_file(&self, path: impl AsRef<Path>) -> Result<std::path::PathBuf> {
        let mut toml_string = toml::to_string(self)?;
        toml_string.push('\n');
        let filename = path.as_ref().with_extension("toml");
        File::create(&filename)?.write_all(toml_string.as_bytes())?;
        Ok(filename)
    }
}
