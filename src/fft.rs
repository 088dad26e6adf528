//! 2-D fast fourier transforms over the trailing (z, y) axes of row-major complex data, backed by
//! rustfft. Plans are created once per plane size and reused for every plane of a batch.

use crate::fftshift::{fftshift2, ifftshift2};
use cfl::num_complex::Complex32;
use rayon::prelude::*;
use rustfft::num_complex::Complex as FftComplex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FftDirection {
    Forward,
    Inverse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NormalizationType {
    None,
    #[default]
    Inverse,
    Unitary,
}

/// cached forward and inverse plans for (nz, ny) planes
pub struct Fft2Plan {
    dims: [usize; 2],
    fwd_z: Arc<dyn Fft<f32>>,
    fwd_y: Arc<dyn Fft<f32>>,
    inv_z: Arc<dyn Fft<f32>>,
    inv_y: Arc<dyn Fft<f32>>,
}

impl Fft2Plan {
    pub fn new(dims: [usize; 2]) -> Self {
        assert!(dims[0] > 0 && dims[1] > 0, "fft plane dims must be non-zero");
        let mut planner = FftPlanner::<f32>::new();
        Self {
            dims,
            fwd_z: planner.plan_fft_forward(dims[0]),
            fwd_y: planner.plan_fft_forward(dims[1]),
            inv_z: planner.plan_fft_inverse(dims[0]),
            inv_y: planner.plan_fft_inverse(dims[1]),
        }
    }

    pub fn dims(&self) -> [usize; 2] {
        self.dims
    }

    pub fn plane_len(&self) -> usize {
        self.dims[0] * self.dims[1]
    }

    /// un-centered 2-D fft of a single row-major plane
    pub fn fft2(&self, plane: &mut [Complex32], direction: FftDirection, norm: NormalizationType) {
        let [nz, ny] = self.dims;
        assert_eq!(plane.len(), nz * ny, "plane length and fft dims disagree");

        let (plan_z, plan_y) = match direction {
            FftDirection::Forward => (&self.fwd_z, &self.fwd_y),
            FftDirection::Inverse => (&self.inv_z, &self.inv_y),
        };

        // rows are contiguous, so all of them are transformed in one call
        let mut rows = plane.iter().map(|x| FftComplex::new(x.re, x.im)).collect::<Vec<_>>();
        plan_y.process(&mut rows);

        // transpose so the columns become contiguous
        let mut cols = vec![FftComplex::new(0f32, 0f32); nz * ny];
        for iz in 0..nz {
            for iy in 0..ny {
                cols[iy * nz + iz] = rows[iz * ny + iy];
            }
        }
        plan_z.process(&mut cols);

        let scale = match norm {
            NormalizationType::Inverse => match direction {
                FftDirection::Inverse => Some((1. / (nz * ny) as f64) as f32),
                FftDirection::Forward => None,
            },
            NormalizationType::Unitary => Some((1. / ((nz * ny) as f64).sqrt()) as f32),
            NormalizationType::None => None,
        };

        for iz in 0..nz {
            for iy in 0..ny {
                let v = cols[iy * nz + iz];
                let v = match scale {
                    Some(s) => v * s,
                    None => v,
                };
                plane[iz * ny + iy] = Complex32::new(v.re, v.im);
            }
        }
    }

    /// unitary centered fft of a single plane: fftshift(fft(ifftshift(x))) / sqrt(n)
    pub fn fft2c(&self, plane: &mut [Complex32], direction: FftDirection) {
        ifftshift2(&self.dims, plane);
        self.fft2(plane, direction, NormalizationType::Unitary);
        fftshift2(&self.dims, plane);
    }

    /// centered unitary fft of every plane in a contiguous batch of planes. The plane dims vary
    /// the fastest.
    pub fn fft2c_batch(&self, data: &mut [Complex32], direction: FftDirection) {
        let plane_len = self.plane_len();
        assert_eq!(data.len() % plane_len, 0, "data length must be a multiple of the plane size");
        data.par_chunks_exact_mut(plane_len).for_each(|plane| {
            self.fft2c(plane, direction);
        });
    }
}
