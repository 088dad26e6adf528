use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use unrolled_reco::logging::init_logging;
use unrolled_reco::ReconParams;

#[derive(Debug, Parser)]
struct Args {
    /// path to recon parameters file to write
    parameter_file: PathBuf,
}

fn main() -> unrolled_reco::Result<()> {
    init_logging();
    let args = Args::parse();
    let filename = ReconParams::default().to_toml_file(&args.parameter_file)?;
    info!("wrote default parameter file to {}", filename.display());
    Ok(())
}
