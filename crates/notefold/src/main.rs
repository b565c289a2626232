//! Notefold command-line interface.
//!
//! A thin operator surface over `notefold_core`: register and inspect
//! storage directories, run sync cycles, manage backups, drive cross-SD
//! moves, and work stale-sync entries.

mod cli;

use clap::Parser;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("notefold=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");

    if let Err(e) = runtime.block_on(cli::run(args)) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
