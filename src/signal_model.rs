// Forward and adjoint MRI signal model
// the purpose of this module is to transform coil-combined images to multi-coil k-space and back while
// accounting for coil sensitivities and the sampling pattern

use crate::error::{shape, Result};
use crate::fft::{Fft2Plan, FftDirection};
use cfl::ndarray::{Array3, Array4, ArrayBase, Axis, Data, Dimension};
use cfl::num_complex::Complex32;
use tracing::debug;

/// magnitude above which a k-space sample is considered acquired when deriving a mask
pub const KSPACE_MASK_EPS: f32 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelDirection {
    Forward,
    Inverse,
}

impl From<ModelDirection> for FftDirection {
    fn from(direction: ModelDirection) -> Self {
        match direction {
            ModelDirection::Forward => FftDirection::Forward,
            ModelDirection::Inverse => FftDirection::Inverse,
        }
    }
}

/// k-space dims in (batch, coils, z, y) order
pub type KspaceDim = (usize, usize, usize, usize);

/// multiplies a sample by a mask weight. A zero weight always yields an exact zero, even for
/// non-finite samples.
#[inline]
fn weight(v: Complex32, m: f32) -> Complex32 {
    if m == 0. { Complex32::ZERO } else { v * m }
}

/// A real-valued sampling mask broadcast to the full k-space shape. The mask is validated once
/// on construction and is fixed for the rest of the reconstruction.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingMask {
    values: Array4<f32>,
}

impl SamplingMask {
    /// broadcasts any mask of compatible rank to the k-space dims
    pub fn new<S, D>(mask: &ArrayBase<S, D>, kspace_dim: KspaceDim) -> Result<Self>
    where
        S: Data<Elem = f32>,
        D: Dimension,
    {
        let values = mask.broadcast(kspace_dim).ok_or_else(|| {
            shape(format!("mask with shape {:?} can't be broadcast to k-space shape {:?}", mask.shape(), kspace_dim))
        })?;
        Ok(Self { values: values.to_owned() })
    }

    /// mask of acquired samples, derived from the non-zero entries of k-space
    pub fn from_kspace(kspace: &Array4<Complex32>) -> Self {
        Self { values: kspace_mask(kspace) }
    }

    /// fully sampled mask
    pub fn ones(kspace_dim: KspaceDim) -> Self {
        Self { values: Array4::ones(kspace_dim) }
    }

    pub fn dim(&self) -> KspaceDim {
        self.values.dim()
    }

    pub fn values(&self) -> &Array4<f32> {
        &self.values
    }

    /// fraction of acquired samples
    pub fn sampling_fraction(&self) -> f32 {
        let n = self.values.len().max(1);
        self.values.iter().filter(|&&m| m != 0.).count() as f32 / n as f32
    }

    pub fn apply(&self, kspace: &Array4<Complex32>) -> Result<Array4<Complex32>> {
        apply_mask(kspace, &self.values)
    }

    /// Hard data-consistency projection: mask * measured + (1 - mask) * predicted, optionally scaled.
    /// Acquired locations reproduce the measured samples exactly.
    pub fn project(&self, measured: &Array4<Complex32>, predicted: &Array4<Complex32>, scale: Option<f32>) -> Result<Array4<Complex32>> {
        if measured.dim() != self.dim() || predicted.dim() != self.dim() {
            return Err(shape(format!(
                "projection needs measured {:?} and predicted {:?} k-space to match the mask {:?}",
                measured.dim(), predicted.dim(), self.dim()
            )));
        }
        let mut out = Array4::from_shape_fn(self.dim(), |idx| {
            let m = self.values[idx];
            weight(measured[idx], m) + weight(predicted[idx], 1. - m)
        });
        if let Some(s) = scale {
            out.mapv_inplace(|v| v * s);
        }
        Ok(out)
    }
}

/// derives a 0/1 mask from the acquired (non-zero) k-space samples
pub fn kspace_mask(kspace: &Array4<Complex32>) -> Array4<f32> {
    kspace.mapv(|v| if v.norm() > KSPACE_MASK_EPS { 1. } else { 0. })
}

/// Elementwise mask multiply with the mask broadcast to the k-space shape. Masked-out samples are
/// exactly zero regardless of magnitude.
pub fn apply_mask<S, D>(kspace: &Array4<Complex32>, mask: &ArrayBase<S, D>) -> Result<Array4<Complex32>>
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    let mask = mask.broadcast(kspace.dim()).ok_or_else(|| {
        shape(format!("mask with shape {:?} can't be broadcast to k-space shape {:?}", mask.shape(), kspace.dim()))
    })?;
    Ok(Array4::from_shape_fn(kspace.dim(), |idx| weight(kspace[idx], mask[idx])))
}

fn check_plane(nz: usize, ny: usize) -> Result<()> {
    if nz == 0 || ny == 0 {
        return Err(shape(format!("image planes must be non-empty, got {}x{}", nz, ny)));
    }
    Ok(())
}

/// broadcasts sensitivity maps over the batch of the given image dims
fn broadcast_sensitivity(sens: &Array4<Complex32>, kspace_dim: KspaceDim) -> Result<Array4<Complex32>> {
    sens.broadcast(kspace_dim)
        .map(|s| s.to_owned())
        .ok_or_else(|| shape(format!("sensitivity maps {:?} can't be broadcast to {:?}", sens.dim(), kspace_dim)))
}

fn fft_planes(plan: &Fft2Plan, x: &mut Array4<Complex32>, direction: ModelDirection) -> Result<()> {
    let data = x.as_slice_memory_order_mut().ok_or_else(|| shape("k-space buffer is not contiguous"))?;
    plan.fft2c_batch(data, direction.into());
    Ok(())
}

/// image (batch, z, y) -> coil weighted k-space (batch, coils, z, y)
fn forward_with(plan: &Fft2Plan, image: &Array3<Complex32>, sens: Option<&Array4<Complex32>>) -> Result<Array4<Complex32>> {
    let (nb, nz, ny) = image.dim();
    if plan.dims() != [nz, ny] {
        return Err(shape(format!("image planes {:?} don't match the fft plan {:?}", [nz, ny], plan.dims())));
    }
    let mut ks = match sens {
        Some(s) => {
            let (sb, nc, sz, sy) = s.dim();
            if (sb, sz, sy) != (nb, nz, ny) {
                return Err(shape(format!("sensitivity maps {:?} don't match image {:?}", s.dim(), image.dim())));
            }
            Array4::from_shape_fn((nb, nc, nz, ny), |(b, c, z, y)| image[[b, z, y]] * s[[b, c, z, y]])
        }
        None => Array4::from_shape_fn((nb, 1, nz, ny), |(b, _, z, y)| image[[b, z, y]]),
    };
    fft_planes(plan, &mut ks, ModelDirection::Forward)?;
    Ok(ks)
}

/// coil k-space (batch, coils, z, y) -> combined image (batch, z, y)
fn adjoint_with(plan: &Fft2Plan, kspace: &Array4<Complex32>, sens: Option<&Array4<Complex32>>) -> Result<Array3<Complex32>> {
    let (nb, nc, nz, ny) = kspace.dim();
    if plan.dims() != [nz, ny] {
        return Err(shape(format!("k-space planes {:?} don't match the fft plan {:?}", [nz, ny], plan.dims())));
    }
    let mut x = kspace.as_standard_layout().into_owned();
    fft_planes(plan, &mut x, ModelDirection::Inverse)?;
    match sens {
        Some(s) => {
            if s.dim() != kspace.dim() {
                return Err(shape(format!("sensitivity maps {:?} don't match k-space {:?}", s.dim(), kspace.dim())));
            }
            Ok(Array3::from_shape_fn((nb, nz, ny), |(b, z, y)| {
                (0..nc).fold(Complex32::ZERO, |acc, c| acc + s[[b, c, z, y]].conj() * x[[b, c, z, y]])
            }))
        }
        None => {
            if nc != 1 {
                return Err(shape(format!("{} coils found but no sensitivity maps were supplied", nc)));
            }
            Ok(x.index_axis_move(Axis(1), 0))
        }
    }
}

/// Expands a coil-combined image into per-coil k-space with a centered unitary fft. Without
/// sensitivity maps this is a plain fft into a single coil.
pub fn forward(image: &Array3<Complex32>, sensitivity: Option<&Array4<Complex32>>) -> Result<Array4<Complex32>> {
    let (nb, nz, ny) = image.dim();
    check_plane(nz, ny)?;
    let plan = Fft2Plan::new([nz, ny]);
    match sensitivity {
        Some(s) => {
            let s = broadcast_sensitivity(s, (nb, s.len_of(Axis(1)), nz, ny))?;
            forward_with(&plan, image, Some(&s))
        }
        None => forward_with(&plan, image, None),
    }
}

/// Adjoint of [forward]: centered inverse fft followed by conjugate-weighted coil combination.
/// This is not an inverse of [forward] when samples have been masked out.
pub fn adjoint(kspace: &Array4<Complex32>, sensitivity: Option<&Array4<Complex32>>) -> Result<Array3<Complex32>> {
    let (_, _, nz, ny) = kspace.dim();
    check_plane(nz, ny)?;
    let plan = Fft2Plan::new([nz, ny]);
    match sensitivity {
        Some(s) => {
            let s = broadcast_sensitivity(s, kspace.dim())?;
            adjoint_with(&plan, kspace, Some(&s))
        }
        None => adjoint_with(&plan, kspace, None),
    }
}

/// The sensing operator A = M F S for a single reconstruction. Sensitivity maps and the mask are
/// validated against the k-space dims once, and the fft plan is reused for every application.
pub struct SenseOperator {
    sensitivity: Option<Array4<Complex32>>,
    mask: SamplingMask,
    plan: Fft2Plan,
}

impl SenseOperator {
    pub fn new(kspace_dim: KspaceDim, sensitivity: Option<&Array4<Complex32>>, mask: SamplingMask) -> Result<Self> {
        let (nb, nc, nz, ny) = kspace_dim;
        if nb == 0 || nc == 0 || nz == 0 || ny == 0 {
            return Err(shape(format!("k-space dims must be non-zero, got {:?}", kspace_dim)));
        }
        let sensitivity = match sensitivity {
            Some(s) => Some(broadcast_sensitivity(s, kspace_dim)?),
            None if nc != 1 => {
                return Err(shape(format!("{} coils found but no sensitivity maps were supplied", nc)));
            }
            None => None,
        };
        if mask.dim() != kspace_dim {
            return Err(shape(format!("mask {:?} doesn't match k-space {:?}", mask.dim(), kspace_dim)));
        }
        debug!(?kspace_dim, sampled = mask.sampling_fraction(), "built sensing operator");
        Ok(Self {
            sensitivity,
            mask,
            plan: Fft2Plan::new([nz, ny]),
        })
    }

    pub fn mask(&self) -> &SamplingMask {
        &self.mask
    }

    pub fn has_sensitivity(&self) -> bool {
        self.sensitivity.is_some()
    }

    /// un-masked forward model F S x
    pub fn forward(&self, image: &Array3<Complex32>) -> Result<Array4<Complex32>> {
        forward_with(&self.plan, image, self.sensitivity.as_ref())
    }

    /// S^H F^H k
    pub fn adjoint(&self, kspace: &Array4<Complex32>) -> Result<Array3<Complex32>> {
        adjoint_with(&self.plan, kspace, self.sensitivity.as_ref())
    }

    /// normal operator A^H W A x
    pub fn normal(&self, image: &Array3<Complex32>) -> Result<Array3<Complex32>> {
        let ks = self.forward(image)?;
        let ks = self.mask.apply(&ks)?;
        self.adjoint(&ks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use cfl::ndarray::{Array2, ArrayD, IxDyn};

    fn test_image(nb: usize, nz: usize, ny: usize) -> Array3<Complex32> {
        Array3::from_shape_fn((nb, nz, ny), |(b, z, y)| {
            Complex32::new(((b + 1) * (z + 2 * y)) as f32 * 0.1, (z as f32 - y as f32) * 0.05)
        })
    }

    fn test_sens(nb: usize, nc: usize, nz: usize, ny: usize) -> Array4<Complex32> {
        Array4::from_shape_fn((nb, nc, nz, ny), |(_, c, z, y)| {
            Complex32::from_polar(0.5 + 0.1 * c as f32, 0.3 * (c * z + y) as f32)
        })
    }

    fn inner3(a: &Array3<Complex32>, b: &Array3<Complex32>) -> Complex32 {
        a.iter().zip(b.iter()).fold(Complex32::ZERO, |acc, (x, y)| acc + x.conj() * y)
    }

    fn inner4(a: &Array4<Complex32>, b: &Array4<Complex32>) -> Complex32 {
        a.iter().zip(b.iter()).fold(Complex32::ZERO, |acc, (x, y)| acc + x.conj() * y)
    }

    #[test]
    fn masked_entries_are_exact_zero() {
        let ks = Array4::from_shape_fn((1, 1, 2, 2), |(_, _, z, y)| {
            if z == 0 && y == 0 { Complex32::new(f32::INFINITY, f32::NAN) } else { Complex32::new(3., -1.) }
        });
        let mask = Array4::from_shape_fn((1, 1, 2, 2), |(_, _, z, _)| if z == 0 { 0. } else { 1. });
        let out = apply_mask(&ks, &mask).unwrap();
        assert_eq!(out[[0, 0, 0, 0]], Complex32::ZERO);
        assert_eq!(out[[0, 0, 0, 1]], Complex32::ZERO);
        assert_eq!(out[[0, 0, 1, 1]], Complex32::new(3., -1.));
    }

    #[test]
    fn plane_mask_broadcasts_in_apply() {
        let ks = test_sens(2, 3, 4, 5);
        let plane = Array2::from_shape_fn((4, 5), |(z, _)| if z == 1 { 0f32 } else { 1. });
        let out = apply_mask(&ks, &plane).unwrap();
        assert_eq!(out[[1, 2, 1, 3]], Complex32::new(0., 0.));
        assert_eq!(out[[1, 2, 2, 3]], ks[[1, 2, 2, 3]]);
        let bad = Array2::<f32>::ones((3, 5));
        assert!(matches!(apply_mask(&ks, &bad), Err(crate::error::ReconError::ShapeMismatch(_))));
    }

    #[test]
    fn empty_planes_are_a_shape_mismatch() {
        let image = Array3::<Complex32>::zeros((1, 0, 4));
        assert!(matches!(forward(&image, None), Err(crate::error::ReconError::ShapeMismatch(_))));
        let ks = Array4::<Complex32>::zeros((1, 1, 4, 0));
        assert!(matches!(adjoint(&ks, None), Err(crate::error::ReconError::ShapeMismatch(_))));
    }

    #[test]
    fn mask_is_idempotent() {
        let ks = test_sens(2, 3, 4, 5);
        let mask = Array4::from_shape_fn((2, 3, 4, 5), |(b, c, z, y)| ((b + c + z * y) % 3) as f32 * 0.5);
        let once = apply_mask(&ks, &mask).unwrap();
        let binary = mask.mapv(|m| if m > 0. { 1. } else { 0. });
        let a = apply_mask(&ks, &binary).unwrap();
        let b = apply_mask(&a, &binary).unwrap();
        assert_eq!(a, b);
        assert_eq!(once.dim(), ks.dim());
    }

    #[test]
    fn mask_broadcasts_from_plane() {
        let plane = Array2::from_shape_fn((4, 6), |(z, _)| if z % 2 == 0 { 1f32 } else { 0. });
        let mask = SamplingMask::new(&plane, (2, 3, 4, 6)).unwrap();
        assert_eq!(mask.dim(), (2, 3, 4, 6));
        assert_eq!(mask.values()[[1, 2, 2, 5]], 1.);
        assert_eq!(mask.values()[[1, 2, 1, 5]], 0.);
        assert_abs_diff_eq!(mask.sampling_fraction(), 0.5);
    }

    #[test]
    fn incompatible_mask_is_a_shape_mismatch() {
        let m = ArrayD::<f32>::ones(IxDyn(&[5, 6]));
        assert!(matches!(SamplingMask::new(&m, (1, 1, 4, 6)), Err(crate::error::ReconError::ShapeMismatch(_))));
    }

    #[test]
    fn derived_mask_marks_nonzero_samples() {
        let mut ks = Array4::from_elem((1, 2, 3, 3), Complex32::ZERO);
        ks[[0, 1, 2, 0]] = Complex32::new(0., 1e-3);
        let mask = SamplingMask::from_kspace(&ks);
        assert_eq!(mask.values().sum(), 1.);
        assert_eq!(mask.values()[[0, 1, 2, 0]], 1.);
    }

    #[test]
    fn single_coil_forward_then_adjoint_is_identity() {
        let x = test_image(2, 6, 5);
        let ks = forward(&x, None).unwrap();
        assert_eq!(ks.dim(), (2, 1, 6, 5));
        let y = adjoint(&ks, None).unwrap();
        x.iter().zip(y.iter()).for_each(|(a, b)| {
            assert_abs_diff_eq!(a.re, b.re, epsilon = 1e-5);
            assert_abs_diff_eq!(a.im, b.im, epsilon = 1e-5);
        });
    }

    #[test]
    fn multi_coil_without_maps_is_rejected() {
        let ks = Array4::from_elem((1, 4, 3, 3), Complex32::ONE);
        assert!(adjoint(&ks, None).is_err());
        assert!(SenseOperator::new(ks.dim(), None, SamplingMask::ones(ks.dim())).is_err());
    }

    #[test]
    fn adjoint_satisfies_inner_product_identity() {
        // <A x, k> == <x, A^H k> with masking included in A
        let (nb, nc, nz, ny) = (2, 3, 6, 4);
        let sens = test_sens(nb, nc, nz, ny);
        let mask = SamplingMask::new(
            &Array2::from_shape_fn((nz, ny), |(z, y)| if (z + y) % 3 == 0 { 0f32 } else { 1. }),
            (nb, nc, nz, ny),
        ).unwrap();
        let op = SenseOperator::new((nb, nc, nz, ny), Some(&sens), mask).unwrap();
        let x = test_image(nb, nz, ny);
        let k = Array4::from_shape_fn((nb, nc, nz, ny), |(b, c, z, y)| {
            Complex32::new((b + c) as f32 - 0.5 * z as f32, 0.25 * y as f32)
        });
        let ax = op.mask().apply(&op.forward(&x).unwrap()).unwrap();
        let ahk = op.adjoint(&op.mask().apply(&k).unwrap()).unwrap();
        let lhs = inner4(&ax, &k);
        let rhs = inner3(&x, &ahk);
        assert_abs_diff_eq!(lhs.re, rhs.re, epsilon = 1e-3);
        assert_abs_diff_eq!(lhs.im, rhs.im, epsilon = 1e-3);
    }

    #[test]
    fn operator_matches_free_functions() {
        let sens = test_sens(1, 2, 4, 4);
        let x = test_image(1, 4, 4);
        let op = SenseOperator::new((1, 2, 4, 4), Some(&sens), SamplingMask::ones((1, 2, 4, 4))).unwrap();
        assert_eq!(op.forward(&x).unwrap(), forward(&x, Some(&sens)).unwrap());
        let ks = forward(&x, Some(&sens)).unwrap();
        assert_eq!(op.adjoint(&ks).unwrap(), adjoint(&ks, Some(&sens)).unwrap());
    }

    #[test]
    fn sensitivity_broadcasts_over_batch() {
        let sens = test_sens(1, 2, 4, 4);
        let x = test_image(3, 4, 4);
        let ks = forward(&x, Some(&sens)).unwrap();
        assert_eq!(ks.dim(), (3, 2, 4, 4));
        let bad = test_sens(2, 2, 4, 4);
        assert!(forward(&x, Some(&bad)).is_err());
    }

    #[test]
    fn projection_keeps_measured_samples() {
        let dim = (1, 1, 3, 3);
        let mask = SamplingMask::new(&Array2::from_shape_fn((3, 3), |(z, _)| if z == 1 { 1f32 } else { 0. }), dim).unwrap();
        let measured = Array4::from_shape_fn(dim, |(_, _, z, y)| if z == 1 { Complex32::new(y as f32 + 1., -2.) } else { Complex32::ZERO });
        let predicted = Array4::from_elem(dim, Complex32::new(0.25, 0.75));
        let out = mask.project(&measured, &predicted, Some(2.)).unwrap();
        for ((idx, v), m) in out.indexed_iter().zip(mask.values().iter()) {
            if *m == 1. {
                assert_eq!(*v, measured[idx] * 2.);
            } else {
                assert_eq!(*v, predicted[idx] * 2.);
            }
        }
    }
}
