//! `tidepool serve`: run the daemon in the foreground.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use tidepool_daemon::paths::{DEFAULT_HOST, DEFAULT_PORT};
use tidepool_daemon::{start_blocking, ServeOptions};

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Project roots to serve (default: current directory).
    pub dirs: Vec<PathBuf>,

    #[arg(long, default_value = DEFAULT_HOST)]
    pub host: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Log as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

impl ServeArgs {
    pub fn run(self) -> Result<()> {
        let mut options = ServeOptions {
            host: self.host,
            port: self.port,
            json_logs: self.log_json,
            ..ServeOptions::default()
        };
        if !self.dirs.is_empty() {
            options.roots = self.dirs;
        }
        let address = options.address();
        start_blocking(options).with_context(|| format!("tidepool server on {address} failed"))
    }
}
