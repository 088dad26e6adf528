//! Spatial layers of the prior network: "same" 2-D convolution with an optional periodic boundary,
//! and batch renormalization followed by ReLU.

use crate::config::{NormMode, RenormClipping};
use crate::error::{shape, Result};
use crate::params::{BatchNormParams, ConvParams};
use crate::tensor::FeatureMap;
use cfl::ndarray::Array4;
use rayon::prelude::*;

/// settings shared by every normalization layer of a network
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormSettings {
    pub epsilon: f32,
    pub clipping: Option<RenormClipping>,
}

/// number of samples wrapped onto each side before a circular convolution
pub fn conv_pad(kernel_size: usize) -> usize {
    ((kernel_size as f32 - 0.5) / 2.) as usize
}

/// 2-D cross-correlation with output the same size as the input. With `circular` the input is
/// periodically extended first and the result cropped back, otherwise the border is zero padded.
pub fn conv2d(x: &FeatureMap, params: &ConvParams, circular: bool) -> Result<FeatureMap> {
    let pad = if circular { conv_pad(params.kernel_size) } else { 0 };
    if pad == 0 {
        return conv2d_same(x, params);
    }
    conv2d_same(&x.circular_pad(pad), params)?.crop(pad)
}

fn conv2d_same(x: &FeatureMap, params: &ConvParams) -> Result<FeatureMap> {
    if x.channels() != params.in_channels {
        return Err(shape(format!(
            "conv expects {} input channels, found {}",
            params.in_channels,
            x.channels()
        )));
    }
    let input = x.channels_first_standard();
    let src = input
        .as_slice()
        .ok_or_else(|| shape("conv input is not contiguous"))?;

    let (nb, cin, nz, ny) = input.dim();
    let cout = params.out_channels;
    let k = params.kernel_size;
    let half = ((k - 1) / 2) as isize;
    let plane_len = nz * ny;

    let mut out = vec![0f32; nb * cout * plane_len];
    out.par_chunks_exact_mut(plane_len).enumerate().for_each(|(idx, plane)| {
        let b = idx / cout;
        let o = idx % cout;
        if let Some(bias) = &params.bias {
            plane.fill(bias[o]);
        }
        for i in 0..cin {
            let in_plane = &src[(b * cin + i) * plane_len..(b * cin + i + 1) * plane_len];
            for ky in 0..k {
                let dz = ky as isize - half;
                let z0 = (-dz).max(0) as usize;
                let z1 = (nz as isize - dz).min(nz as isize).max(0) as usize;
                for kx in 0..k {
                    let w = params.weight(o, i, ky, kx);
                    let dy = kx as isize - half;
                    let y0 = (-dy).max(0) as usize;
                    let y1 = (ny as isize - dy).min(ny as isize).max(0) as usize;
                    for z in z0..z1 {
                        let sz = (z as isize + dz) as usize;
                        let dst = &mut plane[z * ny..(z + 1) * ny];
                        let row = &in_plane[sz * ny..(sz + 1) * ny];
                        for y in y0..y1 {
                            dst[y] += w * row[(y as isize + dy) as usize];
                        }
                    }
                }
            }
        }
    });

    let data = Array4::from_shape_vec((nb, cout, nz, ny), out).map_err(|e| shape(e.to_string()))?;
    Ok(FeatureMap::from_channels_first(data, x.layout()))
}

/// Batch renormalization. In training mode the batch statistics are used and corrected towards the
/// moving statistics by r and d, clipped when bounds are given. In inference mode only the moving
/// statistics are used. Moving statistics are never updated here.
pub fn batch_norm(x: &FeatureMap, params: &BatchNormParams, settings: &NormSettings, mode: NormMode) -> Result<FeatureMap> {
    params.validate(x.channels())?;
    let axis = x.layout().channel_axis();
    let eps = settings.epsilon;
    let mut out = x.data().to_owned();

    for (c, mut lane) in out.axis_iter_mut(axis).enumerate() {
        let (g, b) = (params.gamma[c], params.beta[c]);
        let mu_m = params.moving_mean[c];
        let sigma_m = (params.moving_variance[c] + eps).sqrt();
        match mode {
            NormMode::Inference => {
                lane.mapv_inplace(|v| (v - mu_m) / sigma_m * g + b);
            }
            NormMode::Training => {
                let (mu_b, var_b) = moments(lane.iter().copied());
                let sigma_b = (var_b + eps).sqrt();
                let mut r = sigma_b / sigma_m;
                let mut d = (mu_b - mu_m) / sigma_m;
                if let Some(clip) = &settings.clipping {
                    r = r.clamp(1. / clip.rmax, clip.rmax);
                    d = d.clamp(-clip.dmax, clip.dmax);
                }
                lane.mapv_inplace(|v| ((v - mu_b) / sigma_b * r + d) * g + b);
            }
        }
    }
    Ok(FeatureMap::new(out, x.layout()))
}

/// mean and biased variance, accumulated in double precision
fn moments(values: impl Iterator<Item = f32> + Clone) -> (f32, f32) {
    let mut n = 0usize;
    let sum = values.clone().fold(0f64, |acc, v| {
        n += 1;
        acc + v as f64
    });
    if n == 0 {
        return (0., 0.);
    }
    let mean = sum / n as f64;
    let var = values.fold(0f64, |acc, v| acc + (v as f64 - mean).powi(2)) / n as f64;
    (mean as f32, var as f32)
}

pub fn relu(x: &FeatureMap) -> FeatureMap {
    FeatureMap::new(x.data().mapv(|v| if v > 0. { v } else { 0. }), x.layout())
}

/// normalization (when parameters are present) followed by ReLU
pub fn batch_norm_relu(
    x: &FeatureMap,
    params: Option<&BatchNormParams>,
    settings: &NormSettings,
    mode: NormMode,
) -> Result<FeatureMap> {
    match params {
        Some(p) => Ok(relu(&batch_norm(x, p, settings, mode)?)),
        None => Ok(relu(x)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array_utils::wrap_index;
    use crate::config::DataLayout;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn channel_means(x: &FeatureMap) -> Vec<f32> {
        x.data()
            .axis_iter(x.layout().channel_axis())
            .map(|lane| moments(lane.iter().copied()).0)
            .collect()
    }

    fn test_map(nb: usize, c: usize, nz: usize, ny: usize, layout: DataLayout) -> FeatureMap {
        FeatureMap::from_channels_first(
            Array4::from_shape_fn((nb, c, nz, ny), |(b, c, z, y)| {
                ((b * 31 + c * 17 + z * 7 + y * 3) % 11) as f32 * 0.25 - 1.
            }),
            layout,
        )
    }

    /// direct periodic convolution: out[z, y] = sum w[ky, kx] * x[(z + ky - h) mod nz, (y + kx - h) mod ny]
    fn periodic_conv(x: &FeatureMap, p: &ConvParams) -> Array4<f32> {
        let xin = x.channels_first();
        let (nb, cin, nz, ny) = xin.dim();
        let h = (p.kernel_size / 2) as isize;
        Array4::from_shape_fn((nb, p.out_channels, nz, ny), |(b, o, z, y)| {
            let mut acc = p.bias.as_ref().map_or(0., |bias| bias[o]);
            for i in 0..cin {
                for ky in 0..p.kernel_size {
                    for kx in 0..p.kernel_size {
                        let sz = wrap_index(z as isize + ky as isize - h, nz);
                        let sy = wrap_index(y as isize + kx as isize - h, ny);
                        acc += p.weight(o, i, ky, kx) * xin[[b, i, sz, sy]];
                    }
                }
            }
            acc
        })
    }

    #[test]
    fn pad_sizes() {
        assert_eq!(conv_pad(1), 0);
        assert_eq!(conv_pad(3), 1);
        assert_eq!(conv_pad(5), 2);
        assert_eq!(conv_pad(7), 3);
    }

    #[test]
    fn identity_kernel_preserves_input() {
        let x = test_map(1, 2, 5, 6, DataLayout::ChannelsFirst);
        let mut weights = vec![0.; 2 * 2 * 9];
        weights[4] = 1.;
        weights[3 * 9 + 4] = 1.;
        let p = ConvParams { in_channels: 2, out_channels: 2, kernel_size: 3, weights, bias: None };
        assert_eq!(conv2d(&x, &p, false).unwrap(), x);
        assert_eq!(conv2d(&x, &p, true).unwrap(), x);
    }

    #[test]
    fn circular_conv_matches_periodic_reference() {
        let mut rng = StdRng::seed_from_u64(9);
        for k in [1, 3, 5] {
            let mut p = ConvParams::glorot(3, 4, k, true, &mut rng);
            p.bias = Some(vec![0.1, -0.2, 0.3, 0.0]);
            for layout in [DataLayout::ChannelsFirst, DataLayout::ChannelsLast] {
                let x = test_map(2, 3, 6, 5, layout);
                let y = conv2d(&x, &p, true).unwrap();
                assert_eq!(y.layout(), layout);
                let expected = periodic_conv(&x, &p);
                y.channels_first().iter().zip(expected.iter()).for_each(|(a, b)| {
                    assert_abs_diff_eq!(a, b, epsilon = 1e-5);
                });
            }
        }
    }

    #[test]
    fn zero_padded_conv_differs_at_border_only() {
        let mut rng = StdRng::seed_from_u64(2);
        let p = ConvParams::glorot(1, 1, 3, false, &mut rng);
        let x = test_map(1, 1, 6, 6, DataLayout::ChannelsFirst);
        let zero = conv2d(&x, &p, false).unwrap();
        let periodic = periodic_conv(&x, &p);
        let zero = zero.channels_first();
        for z in 1..5 {
            for y in 1..5 {
                assert_abs_diff_eq!(zero[[0, 0, z, y]], periodic[[0, 0, z, y]], epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn conv_rejects_wrong_channel_count() {
        let mut rng = StdRng::seed_from_u64(2);
        let p = ConvParams::glorot(3, 1, 3, false, &mut rng);
        assert!(conv2d(&test_map(1, 2, 4, 4, DataLayout::ChannelsFirst), &p, true).is_err());
    }

    #[test]
    fn unclipped_training_matches_inference_with_batch_moments() {
        let settings = NormSettings { epsilon: 1e-3, clipping: None };
        let x = test_map(2, 3, 4, 5, DataLayout::ChannelsLast);
        let stats = x
            .data()
            .axis_iter(x.layout().channel_axis())
            .map(|lane| moments(lane.iter().copied()))
            .collect::<Vec<_>>();
        let mut p = BatchNormParams::identity(3);
        p.moving_mean = stats.iter().map(|s| s.0 + 0.3).collect();
        p.moving_variance = stats.iter().map(|s| s.1 * 2.).collect();
        p.gamma = vec![0.5, 1.5, -1.];
        p.beta = vec![0.1, 0., 2.];
        let train = batch_norm(&x, &p, &settings, NormMode::Training).unwrap();
        let infer = batch_norm(&x, &p, &settings, NormMode::Inference).unwrap();
        train.data().iter().zip(infer.data().iter()).for_each(|(a, b)| {
            assert_abs_diff_eq!(a, b, epsilon = 1e-4);
        });
    }

    #[test]
    fn tight_clipping_standardizes_with_batch_moments() {
        let settings = NormSettings {
            epsilon: 1e-3,
            clipping: Some(RenormClipping { rmax: 1., dmax: 0. }),
        };
        let x = test_map(2, 2, 4, 4, DataLayout::ChannelsFirst);
        let mut p = BatchNormParams::identity(2);
        p.moving_mean = vec![5., -5.];
        p.moving_variance = vec![9., 0.01];
        let y = batch_norm(&x, &p, &settings, NormMode::Training).unwrap();
        channel_means(&y).iter().for_each(|m| assert_abs_diff_eq!(*m, 0., epsilon = 1e-5));
    }

    #[test]
    fn inference_uses_moving_statistics() {
        let settings = NormSettings { epsilon: 0., clipping: None };
        let x = test_map(1, 1, 3, 3, DataLayout::ChannelsFirst);
        let mut p = BatchNormParams::identity(1);
        p.moving_mean = vec![1.];
        p.moving_variance = vec![4.];
        let y = batch_norm(&x, &p, &settings, NormMode::Inference).unwrap();
        y.data().iter().zip(x.data().iter()).for_each(|(a, b)| {
            assert_abs_diff_eq!(*a, (b - 1.) / 2., epsilon = 1e-6);
        });
    }

    #[test]
    fn relu_clamps_negatives() {
        let x = test_map(1, 2, 3, 3, DataLayout::ChannelsFirst);
        let settings = NormSettings { epsilon: 1e-3, clipping: None };
        let y = batch_norm_relu(&x, None, &settings, NormMode::Inference).unwrap();
        assert!(y.data().iter().all(|v| *v >= 0.));
        y.data().iter().zip(x.data().iter()).for_each(|(a, b)| assert_eq!(*a, b.max(0.)));
    }
}
