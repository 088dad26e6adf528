use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use unrolled_reco::logging::init_logging;
use unrolled_reco::{ParameterRegistry, ReconParams};

#[derive(Debug, Parser)]
struct Args {
    /// recon parameters toml file
    recon_params: PathBuf,
    /// json file to write the initialized network parameters to
    weights: PathBuf,
    /// seed for the weight initializer
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn main() -> unrolled_reco::Result<()> {
    init_logging();
    let args = Args::parse();
    let params = ReconParams::from_toml_file(args.recon_params.with_extension("toml"))?;
    let registry = ParameterRegistry::initialize(&params, args.seed)?;
    registry.save_json(&args.weights)?;
    info!(
        "wrote {} parameter set(s) for {} steps to {}",
        registry.num_sets(),
        registry.num_steps(),
        args.weights.display()
    );
    Ok(())
}
