//! LTBox - Flashing, region conversion and anti-rollback patching for Lenovo tablets
//!
//! This is the binary entry point. All logic lives in the library.

use clap::Parser;
use color_eyre::eyre::eyre;
use tracing::{error, info, warn};

use ltbox::Args;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    ltbox_core::logging::init()?;

    let result = tokio::select! {
        result = ltbox::run(args) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, aborting the current operation");
            return Err(eyre!("interrupted"));
        }
    };

    if let Err(ref e) = result {
        error!("Operation failed: {}", e);
        if let Ok(dir) = ltbox_core::logging::log_directory() {
            info!("Full log in {}", dir.display());
        }
    }
    info!("LTBox exiting");
    Ok(result?)
}
