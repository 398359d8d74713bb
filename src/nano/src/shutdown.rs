//! Signal handling: SIGTERM/SIGINT raise a stop flag the accept loop
//! checks before each accept. Other signals keep their platform default.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context as _;

pub fn register() -> anyhow::Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&stop))
        .context("registering SIGTERM handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&stop))
        .context("registering SIGINT handler")?;
    Ok(stop)
}
