//! Residual blocks and the residual-network prior used as the learned proximal step.

use crate::config::{NormMode, ReconParams};
use crate::error::{shape, Result};
use crate::layers::{batch_norm_relu, conv2d, NormSettings};
use crate::params::{BatchNormParams, ConvParams, PriorParams, ResBlockParams};
use crate::tensor::FeatureMap;

/// circular pad applied by a residual block that wraps its own main path
pub fn block_pad(kernel_size: usize) -> usize {
    (((2 * (kernel_size - 1)) as f32 + 0.5) / 2.) as usize
}

/// circular pad applied once at the entry of the prior network, covering its 2B + 1 convolutions
pub fn prior_pad(num_blocks: usize, kernel_size: usize) -> usize {
    ((((2 * num_blocks + 1) * (kernel_size - 1)) as f32 + 0.5) / 2.) as usize
}

fn check_norm(norm: Option<&BatchNormParams>, channels: usize, batchnorm: bool, what: &str) -> Result<()> {
    match (norm, batchnorm) {
        (Some(n), true) => n.validate(channels),
        (None, false) => Ok(()),
        (Some(_), false) => Err(shape(format!("{} has batch norm parameters but normalization is off", what))),
        (None, true) => Err(shape(format!("{} is missing batch norm parameters", what))),
    }
}

fn check_projection(proj: Option<&ConvParams>, needed: bool, in_c: usize, out_c: usize, use_bias: bool, what: &str) -> Result<()> {
    match (proj, needed) {
        (Some(p), true) => p.validate(in_c, out_c, 1, use_bias),
        (None, false) => Ok(()),
        (Some(_), false) => Err(shape(format!("{} has an unexpected 1x1 projection", what))),
        (None, true) => Err(shape(format!(
            "{} maps {} to {} channels but has no 1x1 projection",
            what, in_c, out_c
        ))),
    }
}

/// Pre-activation residual block: (norm, relu, conv) twice plus a shortcut. The shortcut is the
/// input itself, or a 1x1 projection when the channel count changes.
#[derive(Debug, Clone)]
pub struct ResBlock<'a> {
    params: &'a ResBlockParams,
    in_channels: usize,
    num_features: usize,
    kernel_size: usize,
    norm: NormSettings,
}

impl<'a> ResBlock<'a> {
    pub fn new(
        params: &'a ResBlockParams,
        in_channels: usize,
        num_features: usize,
        kernel_size: usize,
        batchnorm: bool,
        norm: NormSettings,
    ) -> Result<Self> {
        let use_bias = !batchnorm;
        check_projection(params.shortcut.as_ref(), in_channels != num_features, in_channels, num_features, use_bias, "res block")?;
        check_norm(params.norm1.as_ref(), in_channels, batchnorm, "res block input")?;
        params.conv1.validate(in_channels, num_features, kernel_size, use_bias)?;
        check_norm(params.norm2.as_ref(), num_features, batchnorm, "res block interior")?;
        params.conv2.validate(num_features, num_features, kernel_size, use_bias)?;
        Ok(Self {
            params,
            in_channels,
            num_features,
            kernel_size,
            norm,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.num_features
    }

    pub fn has_projection(&self) -> bool {
        self.params.shortcut.is_some()
    }

    pub fn parameter_count(&self) -> usize {
        let p = self.params;
        p.shortcut.as_ref().map_or(0, |s| s.parameter_count())
            + p.norm1.as_ref().map_or(0, |n| n.parameter_count())
            + p.conv1.parameter_count()
            + p.norm2.as_ref().map_or(0, |n| n.parameter_count())
            + p.conv2.parameter_count()
    }

    /// With `circular` the main path is periodically padded by [block_pad] and cropped after the
    /// second convolution. All convolutions inside the block are zero padded.
    pub fn forward(&self, x: &FeatureMap, circular: bool, mode: NormMode) -> Result<FeatureMap> {
        let shortcut = match &self.params.shortcut {
            Some(proj) => conv2d(x, proj, false)?,
            None => x.clone(),
        };
        let pad = if circular { block_pad(self.kernel_size) } else { 0 };

        let mut net = x.circular_pad(pad);
        net = batch_norm_relu(&net, self.params.norm1.as_ref(), &self.norm, mode)?;
        net = conv2d(&net, &self.params.conv1, false)?;
        net = batch_norm_relu(&net, self.params.norm2.as_ref(), &self.norm, mode)?;
        net = conv2d(&net, &self.params.conv2, false)?;
        net.crop(pad)?.add(&shortcut)
    }
}

/// structural settings of a prior network
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriorConfig {
    pub num_features: usize,
    pub num_blocks: usize,
    pub kernel_size: usize,
    pub circular: bool,
    pub batchnorm: bool,
    pub do_residual: bool,
    pub norm: NormSettings,
}

impl PriorConfig {
    pub fn from_params(params: &ReconParams) -> Self {
        Self {
            num_features: params.resblock_num_features,
            num_blocks: params.resblock_num_blocks,
            kernel_size: params.kernel_size,
            circular: params.circular,
            batchnorm: params.batchnorm,
            do_residual: true,
            norm: NormSettings {
                epsilon: params.batchnorm_epsilon,
                clipping: params.renorm_clipping,
            },
        }
    }
}

/// A stack of residual blocks followed by normalization and a final convolution, with an optional
/// residual connection around the whole stack.
#[derive(Debug, Clone)]
pub struct PriorNetwork<'a> {
    params: &'a PriorParams,
    config: PriorConfig,
    in_channels: usize,
    out_channels: usize,
    blocks: Vec<ResBlock<'a>>,
}

impl<'a> PriorNetwork<'a> {
    pub fn new(params: &'a PriorParams, in_channels: usize, out_channels: usize, config: PriorConfig) -> Result<Self> {
        if params.blocks.len() != config.num_blocks {
            return Err(shape(format!(
                "prior expects {} residual blocks, found {}",
                config.num_blocks,
                params.blocks.len()
            )));
        }
        let use_bias = !config.batchnorm;
        check_projection(
            params.shortcut.as_ref(),
            config.do_residual && in_channels != out_channels,
            in_channels,
            out_channels,
            use_bias,
            "prior",
        )?;
        let blocks = params
            .blocks
            .iter()
            .enumerate()
            .map(|(i, b)| {
                let block_in = if i == 0 { in_channels } else { config.num_features };
                ResBlock::new(b, block_in, config.num_features, config.kernel_size, config.batchnorm, config.norm)
            })
            .collect::<Result<Vec<_>>>()?;
        check_norm(params.final_norm.as_ref(), config.num_features, config.batchnorm, "prior output")?;
        params
            .final_conv
            .validate(config.num_features, out_channels, config.kernel_size, use_bias)?;
        Ok(Self {
            params,
            config,
            in_channels,
            out_channels,
            blocks,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn blocks(&self) -> &[ResBlock<'a>] {
        &self.blocks
    }

    pub fn parameter_count(&self) -> usize {
        self.params.shortcut.as_ref().map_or(0, |s| s.parameter_count())
            + self.blocks.iter().map(|b| b.parameter_count()).sum::<usize>()
            + self.params.final_norm.as_ref().map_or(0, |n| n.parameter_count())
            + self.params.final_conv.parameter_count()
    }

    /// Returns the output with `out_channels` channels and the dense tap (the block stack output,
    /// `num_features` channels). Both keep the spatial extent of the input.
    pub fn forward(&self, x: &FeatureMap, mode: NormMode) -> Result<(FeatureMap, FeatureMap)> {
        if x.channels() != self.in_channels {
            return Err(shape(format!(
                "prior expects {} input channels, found {}",
                self.in_channels,
                x.channels()
            )));
        }
        let cfg = &self.config;
        let pad = if cfg.circular { prior_pad(cfg.num_blocks, cfg.kernel_size) } else { 0 };

        let mut net = x.circular_pad(pad);
        for block in &self.blocks {
            net = block.forward(&net, false, mode)?;
        }
        let dense = net.crop(pad)?;

        net = batch_norm_relu(&net, self.params.final_norm.as_ref(), &cfg.norm, mode)?;
        net = conv2d(&net, &self.params.final_conv, false)?;
        let mut out = net.crop(pad)?;

        if cfg.do_residual {
            out = match &self.params.shortcut {
                Some(proj) => out.add(&conv2d(x, proj, false)?)?,
                None => out.add(x)?,
            };
        }
        Ok((out, dense))
    }
}

/// Builds the prior network for one parameter set and evaluates it. `out_channels` defaults to the
/// input channel count.
pub fn prior_grad_res_net(
    x: &FeatureMap,
    params: &PriorParams,
    out_channels: Option<usize>,
    config: PriorConfig,
    mode: NormMode,
) -> Result<(FeatureMap, FeatureMap)> {
    let in_channels = x.channels();
    PriorNetwork::new(params, in_channels, out_channels.unwrap_or(in_channels), config)?.forward(x, mode)
}
