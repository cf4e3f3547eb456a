pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use tracing::info;

use crate::cli::commands::SubmitRequest;
use crate::cli::config::CrawlerConfig;
use crate::utils::default_log_file;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file, the default configuration when omitted
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also append logs to this file, `serve` defaults to the data directory
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the crawl pipelines until interrupted
    Serve,

    /// Submit catalog pages to a site's pipeline
    Submit {
        /// Catalog url, may carry a page-range expression such as page=1,3-8
        #[arg(required = true)]
        url: String,

        /// Site the pages belong to
        #[arg(short, long)]
        site: String,

        /// Catalog the pages are listed under
        #[arg(long)]
        catalog_id: Option<String>,

        /// Task attribute as key=value, the value parsed as JSON when possible
        #[arg(short, long = "attr", value_parser = parse_attribute)]
        attributes: Vec<(String, Value)>,
    },

    /// Show the effective configuration
    Config {
        /// Write it to this file instead
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

impl Cli {
    /// File logs are appended to, if any
    pub fn log_destination(&self) -> Option<PathBuf> {
        match (&self.log_file, &self.command) {
            (Some(path), _) => Some(path.clone()),
            (None, Commands::Serve) => Some(default_log_file()),
            (None, _) => None,
        }
    }
}

/// Parse `key=value`, keeping the value as a string unless it is valid JSON
fn parse_attribute(raw: &str) -> std::result::Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;

    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing attribute name in '{}'", raw));
    }

    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    let config = CrawlerConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve => {
            info!("Starting crawl pipelines");
            commands::serve(config).await
        }
        Commands::Submit { url, site, catalog_id, attributes } => {
            info!("Submitting {} for site {}", url, site);
            let request = SubmitRequest {
                url,
                site,
                catalog_id,
                attributes: attributes.into_iter().collect(),
            };
            commands::submit(config, request).await
        }
        Commands::Config { output } => commands::show_config(&config, output.as_deref()),
    }
}
