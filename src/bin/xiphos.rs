//! xiphos CLI binary.

use std::process;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use xiphos::cli::{XiphosArgs, execute_command};

fn main() {
    let args = XiphosArgs::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("xiphos={}", args.log_filter())));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = execute_command(args) {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}
