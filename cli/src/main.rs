//! The imgcomposer command line entrypoint.

use anyhow::Result;

async fn run() -> Result<()> {
    imgcomposer_utils::initialize_tracing(tracing::Level::INFO);
    tracing::trace!("starting");
    imgcomposer_lib::cli::run_from_iter(std::env::args()).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = run().await {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}
