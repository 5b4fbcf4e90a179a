pub use slog::{debug, error, info, o, trace, warn};
pub use slog::{Discard, Level, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds the process-wide terminal logger at the requested level. The level
/// string is one of `none`, `info`, `warning`, `error`, `debug`.
pub fn init(level: &str) -> Logger {
    if level == "none" {
        return Logger::root(Discard, o!());
    }

    let config: LoggerConfig = serdeconv::from_toml_str(&format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        level
    ))
    .expect("Error parsing logger configuration");

    config.build_logger().expect("Error building logger")
}

/// A logger that swallows everything. Used by tests and by components
/// constructed without a parent logger.
#[inline]
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_none_is_discard() {
        let log = init("none");
        trace!(log, "not printed");
    }

    #[test]
    fn test_discard_accepts_records() {
        let log = discard();
        debug!(log, "swallowed"; "key" => 1);
    }
}
