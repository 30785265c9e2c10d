//! Shared setup for the demo binaries.

use anyhow::Result;
use simplelog::*;

use nullssh::{AlgoOptions, Config};

pub use nullssh::sshnames::DEMO_PORT;

pub fn setup_log(debug: bool, trace: bool) -> Result<()> {
    let conf = simplelog::ConfigBuilder::new()
        .add_filter_allow_str("nullssh")
        .build();

    let level = if trace {
        LevelFilter::Trace
    } else if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let logs: Vec<Box<dyn SharedLogger>> =
        vec![TermLogger::new(level, conf, TerminalMode::Mixed, ColorChoice::Auto)];

    CombinedLogger::init(logs)?;
    Ok(())
}

/// Prefers "none" for cipher and MAC, real algorithms remain available.
pub fn null_config() -> Config {
    Config { algos: AlgoOptions::null(), ..Default::default() }
}
