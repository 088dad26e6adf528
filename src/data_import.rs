//! cfl file io for the command line tools.
//!
//! cfl arrays are column-major with the fastest axis first, so a file with dims [y, z, coils, batch]
//! becomes a row-major (batch, coils, z, y) array after reversing its axes. Files with fewer than
//! four dims are promoted by adding unit batch/coil axes.

use crate::error::{shape, ReconError, Result};
use crate::unroll::Reconstruction;
use cfl::ndarray::{Array3, Array4, ArrayD, Axis, Ix4};
use cfl::num_complex::Complex32;
use std::path::{Path, PathBuf};
use tracing::info;

fn cfl_error(path: &Path, e: impl std::fmt::Debug) -> ReconError {
    ReconError::Cfl(format!("{}: {:?}", path.display(), e))
}

/// promotes an array of rank 2 to 4 to rank 4 by inserting leading unit axes
pub fn promote_to_4d<T>(array: ArrayD<T>) -> Result<Array4<T>> {
    let rank = array.ndim();
    if !(2..=4).contains(&rank) {
        return Err(shape(format!("expected an array of rank 2 to 4, found dims {:?}", array.shape())));
    }
    let mut array = array;
    for _ in rank..4 {
        array = array.insert_axis(Axis(0));
    }
    array
        .into_dimensionality::<Ix4>()
        .map_err(|e| shape(e.to_string()))
}

/// reads a cfl file as (batch, coils, z, y)
pub fn read_kspace(path: impl AsRef<Path>) -> Result<Array4<Complex32>> {
    let path = path.as_ref();
    let a = cfl::to_array(path, true).map_err(|e| cfl_error(path, e))?;
    let a = promote_to_4d(a.reversed_axes())?;
    Ok(a.as_standard_layout().into_owned())
}

/// sensitivity maps use the same layout as k-space
pub fn read_sensitivity(path: impl AsRef<Path>) -> Result<Array4<Complex32>> {
    read_kspace(path)
}

/// Reads a sampling mask from the real part of a cfl file. The mask keeps its own rank so that it
/// can be broadcast against k-space later.
pub fn read_mask(path: impl AsRef<Path>) -> Result<ArrayD<f32>> {
    let path = path.as_ref();
    let a = cfl::to_array(path, true).map_err(|e| cfl_error(path, e))?;
    let a = a.reversed_axes();
    Ok(a.as_standard_layout().mapv(|v| v.re))
}

fn write_array<D: cfl::ndarray::Dimension>(path: &Path, a: &cfl::ndarray::Array<Complex32, D>) -> Result<()> {
    let column_major = a.view().reversed_axes().to_owned().into_dyn();
    cfl::from_array(path, &column_major).map_err(|e| cfl_error(path, e))?;
    Ok(())
}

pub fn write_image(path: impl AsRef<Path>, image: &Array3<Complex32>) -> Result<()> {
    write_array(path.as_ref(), image)
}

pub fn write_kspace(path: impl AsRef<Path>, kspace: &Array4<Complex32>) -> Result<()> {
    write_array(path.as_ref(), kspace)
}

/// output file names derived from a base path
pub fn output_path(base: impl AsRef<Path>, suffix: &str) -> PathBuf {
    let base = base.as_ref();
    let name = base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    base.with_file_name(format!("{}_{}", name, suffix))
}

/// Writes `<base>_img` and `<base>_ksp`, and `<base>_iter_XX` for every step when requested.
/// Returns the paths that were written.
pub fn write_reconstruction(base: impl AsRef<Path>, rec: &Reconstruction, with_iterations: bool) -> Result<Vec<PathBuf>> {
    let base = base.as_ref();
    let mut written = vec![];

    let img = output_path(base, "img");
    write_image(&img, &rec.image)?;
    written.push(img);

    let ksp = output_path(base, "ksp");
    write_kspace(&ksp, &rec.kspace)?;
    written.push(ksp);

    if with_iterations {
        for (name, im) in &rec.iterations {
            let p = output_path(base, name);
            write_image(&p, im)?;
            written.push(p);
        }
    }
    info!("wrote {} cfl files", written.len());
    Ok(written)
}
