//! A `log::Log` implementation backed by a single append-mode file.
//!
//! Unlike a process-wide static handle opened once at startup and never
//! explicitly closed, `FileLogger` is an ordinary value: it is installed by
//! `main` and its underlying file is dropped (and so flushed) whenever the
//! logger itself goes out of scope, tying its lifetime to the mount.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;

pub struct FileLogger {
    file: Mutex<File>,
    level: LevelFilter,
}

impl FileLogger {
    pub fn open(path: &Path, level: LevelFilter) -> std::io::Result<FileLogger> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(FileLogger {
            file: Mutex::new(file),
            level,
        })
    }

    /// Install this logger as the global `log` facade sink. Consumes the
    /// logger because `log::set_boxed_logger` requires `'static` ownership;
    /// the file is closed only at process exit from this point on.
    pub fn install(self) -> Result<(), log::SetLoggerError> {
        log::set_max_level(self.level);
        log::set_boxed_logger(Box::new(self))
    }

    /// Read the desired level from `ARSENAL_LOG` (falling back to
    /// `RUST_LOG`), defaulting to `Info` if neither is set or valid.
    pub fn level_from_env() -> LevelFilter {
        std::env::var("ARSENAL_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(LevelFilter::Info)
    }
}

impl Log for FileLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut file = self.file.lock();
        let _ = writeln!(
            file,
            "[{}] {}: {}",
            level_tag(record.level()),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = self.file.lock().flush();
    }
}

fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARN",
        Level::Info => "INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}
