use std::path::PathBuf;

use clap::{Parser, ValueHint};

#[derive(Parser, Debug, Clone)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION")
)]
pub struct Args {
    #[arg(
        long,
        value_name = "PATH",
        value_hint = ValueHint::FilePath,
        help = "Path to the TOML configuration file; ESCROW__* environment variables apply on top"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        value_name = "PATH",
        value_hint = ValueHint::DirPath,
        help = "Override the sled database path from the configuration"
    )]
    pub db: Option<PathBuf>,

    #[arg(
        long,
        action = clap::ArgAction::SetTrue,
        help = "Keep deals in memory only; nothing survives a restart"
    )]
    pub ephemeral: bool,
}
