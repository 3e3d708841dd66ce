use log::{info, warn, LevelFilter};
use serde::Serialize;

/// Diagnostics sink chosen once from `--verbose` and handed to every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Logger {
    Default,
    Verbose,
}

impl Logger {
    pub fn new(verbose: bool) -> Self {
        if verbose {
            Self::Verbose
        } else {
            Self::Default
        }
    }

    pub fn level(&self) -> LevelFilter {
        match self {
            Self::Default => LevelFilter::Info,
            Self::Verbose => LevelFilter::Debug,
        }
    }

    /// Installs the global `env_logger`. `RUST_LOG` takes precedence over the verbosity.
    pub fn init(&self) {
        env_logger::builder()
            .filter_level(self.level())
            .parse_default_env()
            .init();
    }

    /// Dumps `value` as indented JSON in verbose mode, does nothing otherwise.
    pub fn print_json<T: Serialize + ?Sized>(&self, msg: &str, value: &T) {
        if *self == Self::Default {
            return;
        }

        match serde_json::to_string_pretty(value) {
            Ok(json) => info!("{msg}:\n{json}"),
            Err(e) => warn!("{msg}: couldn't serialize to JSON: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use log::LevelFilter;

    use super::Logger;

    #[test]
    fn test_verbosity_selects_level() {
        assert_eq!(Logger::new(false), Logger::Default);
        assert_eq!(Logger::new(true).level(), LevelFilter::Debug);
        assert_eq!(Logger::new(false).level(), LevelFilter::Info);
    }
}
