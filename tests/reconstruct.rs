use cfl::ndarray::{Array2, Array3, Array4, ArrayD};
use cfl::num_complex::Complex32;
use std::sync::Arc;
use std::thread;
use unrolled_reco::{forward, reconstruct, DataLayout, ParameterRegistry, ReconError, ReconParams, SamplingMask, UnrolledIsta};

fn params() -> ReconParams {
    ReconParams {
        num_grad_steps: 2,
        resblock_num_features: 6,
        resblock_num_blocks: 2,
        ..ReconParams::default()
    }
}

fn phantom(nb: usize, nz: usize, ny: usize) -> Array3<Complex32> {
    Array3::from_shape_fn((nb, nz, ny), |(b, z, y)| {
        let inside = z > nz / 4 && z < 3 * nz / 4 && y > ny / 4 && y < 3 * ny / 4;
        Complex32::new(if inside { 1. } else { 0.2 } + 0.05 * b as f32, 0.01 * z as f32)
    })
}

fn sens(nc: usize, nz: usize, ny: usize) -> Array4<Complex32> {
    Array4::from_shape_fn((1, nc, nz, ny), |(_, c, z, y)| {
        Complex32::from_polar(0.4 + 0.1 * c as f32, 0.15 * (c * y + z) as f32)
    })
}

fn mask(nz: usize, ny: usize) -> ArrayD<f32> {
    Array2::from_shape_fn((nz, ny), |(z, _)| if z % 3 == 0 || (z as isize - nz as isize / 2).abs() < 2 { 1f32 } else { 0. })
        .into_dyn()
}

fn measured(nb: usize, nc: usize, nz: usize, ny: usize) -> Array4<Complex32> {
    let ks = forward(&phantom(nb, nz, ny), Some(&sens(nc, nz, ny))).unwrap();
    SamplingMask::new(&mask(nz, ny), ks.dim()).unwrap().apply(&ks).unwrap()
}

#[test]
fn multi_coil_reconstruction_is_consistent_with_measurements() {
    let params = params();
    let registry = ParameterRegistry::initialize(&params, 42).unwrap();
    let (nb, nc, nz, ny) = (2, 4, 12, 10);
    let ks = measured(nb, nc, nz, ny);
    let s = sens(nc, nz, ny);
    let m = mask(nz, ny);

    let rec = reconstruct(&ks, Some(&s), Some(&m), &params, &registry).unwrap();
    assert_eq!(rec.image.dim(), (nb, nz, ny));
    assert_eq!(rec.kspace.dim(), (nb, nc, nz, ny));
    assert_eq!(rec.iterations.len(), 2);
    assert!(rec.image.iter().all(|v| v.re.is_finite() && v.im.is_finite()));

    let full_mask = SamplingMask::new(&m, ks.dim()).unwrap();
    for (idx, v) in rec.kspace.indexed_iter() {
        if full_mask.values()[idx] == 1. {
            assert_eq!(*v, ks[idx]);
        }
    }
}

#[test]
fn weights_survive_a_json_round_trip() {
    let mut params = params();
    params.prior_layout = DataLayout::ChannelsLast;
    params.do_dense = true;
    let registry = ParameterRegistry::initialize(&params, 5).unwrap();
    let path = std::env::temp_dir().join(format!("unrolled_reco_it_{}.json", std::process::id()));
    registry.save_json(&path).unwrap();
    let loaded = ParameterRegistry::load_json(&path).unwrap();
    std::fs::remove_file(&path).ok();

    let ks = measured(1, 2, 8, 8);
    let s = sens(2, 8, 8);
    let a = reconstruct(&ks, Some(&s), None, &params, &registry).unwrap();
    let b = reconstruct(&ks, Some(&s), None, &params, &loaded).unwrap();
    assert_eq!(a.image, b.image);
}

#[test]
fn solver_is_shared_between_threads() {
    let params = params();
    let registry = ParameterRegistry::initialize(&params, 1).unwrap();
    let solver = Arc::new(UnrolledIsta::new(&params, &registry).unwrap());
    let ks = Arc::new(measured(1, 1, 8, 8));
    let expected = solver.reconstruct(&ks, None, None).unwrap().image;

    let handles = (0..3)
        .map(|_| {
            let solver = Arc::clone(&solver);
            let ks = Arc::clone(&ks);
            thread::spawn(move || solver.reconstruct(&ks, None, None).unwrap().image)
        })
        .collect::<Vec<_>>();
    for h in handles {
        assert_eq!(h.join().unwrap(), expected);
    }
}

#[test]
fn multi_coil_data_needs_maps() {
    let params = params();
    let registry = ParameterRegistry::initialize(&params, 1).unwrap();
    let ks = measured(1, 3, 8, 8);
    assert!(matches!(
        reconstruct(&ks, None, None, &params, &registry),
        Err(ReconError::ShapeMismatch(_))
    ));
}
