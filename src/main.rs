//! tollgate binary.
//!
//! The component to run is chosen by `mode` (`proxy`, `controller` or
//! `standalone`) from the config file, the `MODE` variable or `--mode`.

use std::process::ExitCode;

use clap::Parser;
use tollgate::cli::{self, Args};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match cli::run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
