use tracing_subscriber::EnvFilter;

/// Filter directive for the given level; `verbose` raises this crate to debug.
pub fn filter_directive(level: &str, verbose: bool) -> String {
    if verbose {
        format!("{level},datafactory=debug")
    } else {
        level.to_string()
    }
}

/// Installs the global fmt subscriber. `RUST_LOG` wins over the configured level.
///
/// Logs go to stderr so they don't interleave with reports on stdout.
pub fn init(level: &str, verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(level, verbose)));

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_raises_crate_level() {
        assert_eq!(filter_directive("warn", false), "warn");
        assert_eq!(filter_directive("warn", true), "warn,datafactory=debug");
    }

    #[test]
    fn init_twice_is_harmless() {
        init("info", false);
        init("debug", true);
    }
}
