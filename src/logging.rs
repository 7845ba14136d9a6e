use std::sync::OnceLock;

use chrono::{DateTime, Local};
use log::{Level, Metadata, Record, SetLoggerError};

static LOGGER: OnceLock<ConsoleLogger> = OnceLock::new();

/// Writes log records to stderr with a local timestamp
pub struct ConsoleLogger {
    level: Level,
}

impl ConsoleLogger {
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Installs the logger process-wide. Fails if a logger is already set.
    pub fn init(level: Level) -> Result<(), SetLoggerError> {
        let logger = LOGGER.get_or_init(|| ConsoleLogger::new(level));
        log::set_logger(logger).map(|()| log::set_max_level(logger.level.to_level_filter()))
    }

    fn format_line(level: Level, timestamp: DateTime<Local>, message: &str) -> String {
        format!(
            "{} [{}]: {}",
            level,
            timestamp.format("%Y-%m-%d %H:%M:%S"),
            message
        )
    }
}

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let line =
                Self::format_line(record.level(), Local::now(), &record.args().to_string());
            eprintln!("{}", line);
        }
    }

    fn flush(&self) {}
}

/// Initializes logging.
///
/// `RUST_LOG` hands control to `env_logger`; otherwise the console logger runs
/// at debug level when `debug` is set and at info level otherwise.
pub fn setup_logging(debug: bool) {
    let installed = if std::env::var_os("RUST_LOG").is_some() {
        env_logger::try_init().is_ok()
    } else {
        let level = if debug { Level::Debug } else { Level::Info };
        ConsoleLogger::init(level).is_ok()
    };

    if installed {
        log::info!("Logging initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use log::Log;

    #[test]
    fn test_format_line() {
        let timestamp = Local.with_ymd_and_hms(2024, 5, 17, 8, 3, 9).unwrap();
        assert_eq!(
            ConsoleLogger::format_line(Level::Warn, timestamp, "Scan found nothing"),
            "WARN [2024-05-17 08:03:09]: Scan found nothing"
        );
    }

    #[test]
    fn test_level_filtering() {
        let logger = ConsoleLogger::new(Level::Info);
        let debug = Metadata::builder().level(Level::Debug).build();
        let error = Metadata::builder().level(Level::Error).build();
        assert!(!logger.enabled(&debug));
        assert!(logger.enabled(&error));
    }
}
