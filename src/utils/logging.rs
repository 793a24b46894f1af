use anyhow::Result;
use std::fs;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter for this crate at `level` (debug when `verbose`), warnings elsewhere.
/// Directives in `RUST_LOG` are kept.
fn build_filter(level: &str, verbose: bool) -> Result<EnvFilter> {
    let crate_level = if verbose { "debug" } else { level };
    Ok(EnvFilter::from_default_env()
        .add_directive(format!("crawl_orchestrator={}", crate_level).parse()?)
        .add_directive("warn".parse()?))
}

/// Install the global subscriber: stderr always, plus an appending plain-text
/// file layer when `log_file` is set.
pub fn init_logging(level: &str, verbose: bool, log_file: Option<PathBuf>) -> Result<()> {
    let env_filter = build_filter(level, verbose)?;
    let fmt_layer = fmt::layer().with_target(true);

    let Some(log_file) = log_file else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
        return Ok(());
    };

    if let Some(parent) = log_file.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let file = fs::OpenOptions::new().create(true).append(true).open(&log_file)?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(
            fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file)),
        )
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_overrides_configured_level() {
        let filter = build_filter("warn", true).unwrap().to_string();
        assert!(filter.contains("crawl_orchestrator=debug"));

        let filter = build_filter("info", false).unwrap().to_string();
        assert!(filter.contains("crawl_orchestrator=info"));
    }

    #[test]
    fn rejects_unknown_level() {
        assert!(build_filter("loud", false).is_err());
    }
}
