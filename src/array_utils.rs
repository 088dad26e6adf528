// Array utilities for complex data and periodic indexing

use cfl::ndarray::{Array3, Array4, Axis};
use cfl::num_complex::Complex32;

/// maps a possibly out-of-range coordinate onto [0, n) with a periodic boundary
#[inline(always)]
pub fn wrap_index(i: isize, n: usize) -> usize {
    i.rem_euclid(n as isize) as usize
}

/// Packs a complex image (batch, z, y) into a real channels-last array (batch, z, y, 2) where channel
/// 0 is the real part and channel 1 is the imaginary part
pub fn complex_to_channels(x: &Array3<Complex32>) -> Array4<f32> {
    let (nb, nz, ny) = x.dim();
    Array4::from_shape_fn((nb, nz, ny, 2), |(b, z, y, c)| {
        let v = x[[b, z, y]];
        if c == 0 { v.re } else { v.im }
    })
}

/// inverse of [complex_to_channels]. The last axis must have exactly 2 entries
pub fn channels_to_complex(x: &Array4<f32>) -> Array3<Complex32> {
    assert_eq!(x.len_of(Axis(3)), 2, "expected a real and imaginary channel");
    let (nb, nz, ny, _) = x.dim();
    Array3::from_shape_fn((nb, nz, ny), |(b, z, y)| Complex32::new(x[[b, z, y, 0]], x[[b, z, y, 1]]))
}

/// true if every real and imaginary component is finite
pub fn all_finite<'a>(x: impl IntoIterator<Item = &'a Complex32>) -> bool {
    x.into_iter().all(|v| v.re.is_finite() && v.im.is_finite())
}
