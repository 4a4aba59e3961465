mod assistant;
mod broker;
mod cli;
mod config;
mod daemon;
mod error;
mod event;
mod flags;
mod invoker;
mod ipc;
mod keys;
mod monitor;
mod paths;
mod parcel;
mod process_monitor;
mod restore;
mod status;
mod sysprop;

use anyhow::Result;
use clap::Parser;
use tokio::runtime::Builder;

use crate::cli::{Cli, Commands};

#[cfg(target_os = "android")]
fn init_logger() {
    use log::LevelFilter;

    android_logger::init_once(
        android_logger::Config::default()
            .with_max_level(if cfg!(debug_assertions) {
                LevelFilter::Trace
            } else {
                LevelFilter::Info
            })
            .with_tag("cts"),
    );
}

#[cfg(not(target_os = "android"))]
fn init_logger() {
    env_logger::init();
}

fn main() -> Result<()> {
    init_logger();

    let args = Cli::parse();

    if let Commands::Daemon = args.command {
        return Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(daemon::run());
    }

    let config = config::load_or_default(&paths::config_file_path()).unwrap_or_else(|e| {
        log::warn!("Config error (using defaults): {e:#}");
        config::Config::default()
    });
    cli::run(args.command, &config)
}
