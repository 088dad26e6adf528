use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;
use unrolled_reco::data_import::{output_path, read_kspace, read_mask, read_sensitivity, write_reconstruction};
use unrolled_reco::logging::init_logging;
use unrolled_reco::{ParameterRegistry, ReconParams, UnrolledIsta};

#[derive(Debug, Parser)]
struct Args {
    /// under-sampled k-space cfl file
    kspace: PathBuf,
    /// json file of network parameters
    weights: PathBuf,
    /// recon parameters toml file
    recon_params: PathBuf,
    /// base path for the output cfl files
    output: PathBuf,
    /// coil sensitivity maps cfl file
    #[arg(long)]
    sens: Option<PathBuf>,
    /// sampling mask cfl file. Derived from the non-zero k-space samples if omitted
    #[arg(long)]
    mask: Option<PathBuf>,
    /// also write the image after every step
    #[arg(long)]
    dump_iterations: bool,
    /// write the magnitude of the final image as nifti for viewing
    #[arg(long)]
    dump_magnitude: bool,
}

fn main() -> unrolled_reco::Result<()> {
    init_logging();
    let args = Args::parse();

    let params = ReconParams::from_toml_file(args.recon_params.with_extension("toml"))?;
    let registry = ParameterRegistry::load_json(&args.weights)?;
    let solver = UnrolledIsta::new(&params, &registry)?;
    info!("solver ready with {} steps", solver.num_steps());

    info!("loading k-space ...");
    let kspace = read_kspace(&args.kspace)?;
    let sens = args.sens.as_ref().map(read_sensitivity).transpose()?;
    let mask = args.mask.as_ref().map(read_mask).transpose()?;
    info!("k-space dims: {:?}", kspace.dim());

    let now = Instant::now();
    let rec = solver.reconstruct(&kspace, sens.as_ref(), mask.as_ref())?;
    info!("reconstruction took {:.03} secs", now.elapsed().as_secs_f32());

    write_reconstruction(&args.output, &rec, args.dump_iterations)?;
    if args.dump_magnitude {
        cfl::dump_magnitude(output_path(&args.output, "img"), &rec.image.clone().into_dyn());
    }
    Ok(())
}
