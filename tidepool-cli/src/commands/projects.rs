//! `tidepool projects`: query the listing endpoint of a running server.

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;

use tidepool_daemon::paths::{bind_address, DEFAULT_HOST, DEFAULT_PORT, PLACE_ID_HEADER, PROJECTS_ROUTE};

#[derive(Args, Debug)]
pub struct ProjectsArgs {
    /// Place id to check authorization for.
    #[arg(long)]
    pub place_id: u64,

    #[arg(long, default_value = DEFAULT_HOST)]
    pub host: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,
}

impl ProjectsArgs {
    pub fn run(self) -> Result<()> {
        if self.place_id == 0 {
            bail!("--place-id must be a positive integer");
        }
        let url = format!("http://{}{PROJECTS_ROUTE}", bind_address(&self.host, self.port));
        let response = match ureq::get(&url)
            .set(PLACE_ID_HEADER, &self.place_id.to_string())
            .call()
        {
            Ok(response) => response,
            Err(ureq::Error::Status(code, response)) => {
                let body: serde_json::Value = response.into_json().unwrap_or_default();
                let message = body["error"].as_str().unwrap_or("request failed").to_string();
                bail!("server answered {code}: {message}");
            }
            Err(err) => {
                return Err(err).with_context(|| format!("could not reach tidepool at {url}"));
            }
        };

        let names: Vec<String> = response
            .into_json()
            .context("server returned an unexpected listing")?;
        if names.is_empty() {
            println!("No projects authorized for place {}.", self.place_id);
            return Ok(());
        }
        for name in names {
            println!("{} {name}", "•".green());
        }
        Ok(())
    }
}
