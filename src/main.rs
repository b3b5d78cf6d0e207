pub mod alloc;
mod cache;
mod config;
mod connect;
mod error;
mod http;
mod rewrite;
mod serve;
mod tls;

use clap::{Args, Parser, Subcommand};
use config::{BootArgs, CaArgs, ConfigFile};
use std::path::PathBuf;

type Result<T, E = error::Error> = std::result::Result<T, E>;

const BIN_NAME: &str = env!("CARGO_PKG_NAME");

#[derive(Parser)]
#[clap(author, version, about, arg_required_else_help = true)]
#[command(args_conflicts_with_subcommands = true)]
struct Opt {
    #[clap(subcommand)]
    commands: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the caching proxy
    Run(BootArgs),

    /// Generate a root CA for TLS interception
    GenCa(GenCaArgs),
}

#[derive(Args, Clone)]
pub struct GenCaArgs {
    /// JSON config file [default: $HOME/.config/vcache/config.json]
    #[clap(long, env = "VCACHE_CONFIG")]
    config: Option<PathBuf>,

    #[clap(flatten)]
    ca: CaArgs,

    /// Replace an existing root CA
    #[clap(long)]
    force: bool,
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    match opt.commands {
        Commands::Run(args) => serve::run(args),
        Commands::GenCa(args) => gen_ca(args),
    }
}

fn gen_ca(args: GenCaArgs) -> Result<()> {
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(tracing::Level::INFO)
            .finish(),
    )?;

    let file = ConfigFile::load(args.config.as_deref())?;
    let ca = args.ca.resolve(&file);
    tls::write_root_ca(&ca.cert, &ca.key, args.force)?;
    tracing::info!(
        "Trust {} in your clients to let {} intercept HTTPS",
        ca.cert.display(),
        BIN_NAME
    );
    Ok(())
}
