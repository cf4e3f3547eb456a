use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Crate directive added on top of `RUST_LOG`
fn crate_directive(verbose: bool) -> &'static str {
    if verbose {
        "crawl_pipeline=debug"
    } else {
        "crawl_pipeline=info"
    }
}

/// Initialize the logging system.
///
/// Logs go to stdout and, when `log_file` is given, are appended to that file
/// without ANSI colors. Stage handlers log through `tracing` with `site` and
/// `url` fields, which both layers render.
pub fn init_logging(verbose: bool, log_file: Option<PathBuf>) -> Result<()> {
    let env_filter = EnvFilter::from_default_env()
        .add_directive(crate_directive(verbose).parse()?)
        .add_directive("warn".parse()?);

    let stdout_layer = fmt::layer().with_target(true);

    let file_layer = match log_file {
        Some(path) => Some(
            fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(open_log_file(&path)?),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}

fn open_log_file(path: &Path) -> Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .context(format!("Failed to create log directory: {}", parent.display()))?;
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context(format!("Failed to open log file: {}", path.display()))
}

/// Log file used by long-running commands when `--log-file` is not given
pub fn default_log_file() -> PathBuf {
    let mut path = match directories::ProjectDirs::from("com", "crawl-pipeline", "crawl-pipeline") {
        Some(dirs) => dirs.data_dir().to_path_buf(),
        None => PathBuf::from("./logs"),
    };

    path.push("pipeline.log");
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crate_directive_parses() {
        for verbose in [true, false] {
            assert!(crate_directive(verbose).parse::<tracing_subscriber::filter::Directive>().is_ok());
        }
    }

    #[test]
    fn test_default_log_file_name() {
        assert_eq!(default_log_file().file_name().unwrap(), "pipeline.log");
    }

    #[test]
    fn test_log_file_is_appended() {
        let path = std::env::temp_dir()
            .join(format!("crawl-pipeline-logs-{}", std::process::id()))
            .join("pipeline.log");

        fs::write(&path, "first\n").ok();
        open_log_file(&path).unwrap();
        open_log_file(&path).unwrap();
        assert!(path.exists());

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
