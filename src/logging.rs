//! Logging bootstrap for the binary.
//!
//! Library code logs through the `log` facade. By default those records are
//! bridged into tracing and printed to stderr. With `TASKSYNC_LOG_FILE` set,
//! env_logger owns the facade instead and writes them to a size-rotated file.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};

use tracing_log::LogTracer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Append-only log file that rolls over to `path.1 .. path.N` once it
/// would grow past `max_size` bytes.
pub struct RotatingFile {
    path: String,
    max_size: u64,
    max_files: u32,
    file: File,
    current_size: u64,
}

impl RotatingFile {
    pub fn new(path: impl Into<String>, max_size: u64, max_files: u32) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let current_size = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            max_size,
            max_files,
            file,
            current_size,
        })
    }

    fn rotate(&mut self) -> io::Result<()> {
        // path.N-1 -> path.N, ..., path -> path.1
        for i in (1..self.max_files).rev() {
            let src = format!("{}.{}", self.path, i);
            let dst = format!("{}.{}", self.path, i + 1);
            let _ = std::fs::rename(&src, &dst);
        }

        let _ = std::fs::rename(&self.path, format!("{}.1", self.path));

        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.current_size = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.current_size > 0 && self.current_size + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.current_size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// An env_logger writing to a rotating file. `filters` uses `RUST_LOG` syntax.
pub fn file_logger(
    path: impl Into<String>,
    max_size: u64,
    max_files: u32,
    filters: &str,
) -> io::Result<env_logger::Logger> {
    let rot = RotatingFile::new(path, max_size, max_files)?;
    Ok(env_logger::Builder::new()
        .parse_filters(filters)
        .write_style(env_logger::WriteStyle::Never)
        .target(env_logger::Target::Pipe(Box::new(rot)))
        .build())
}

fn env_number<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Install the process-wide loggers. Safe to call more than once.
pub fn init() {
    let filters = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    let file = std::env::var("TASKSYNC_LOG_FILE").ok().and_then(|path| {
        let max_size_mb: u64 = env_number("TASKSYNC_LOG_MAX_SIZE_MB", 10);
        let max_files: u32 = env_number("TASKSYNC_LOG_MAX_FILES", 3);
        match file_logger(path.as_str(), max_size_mb * 1024 * 1024, max_files, &filters) {
            Ok(logger) => Some(logger),
            Err(e) => {
                eprintln!("cannot open log file {path}: {e}");
                None
            }
        }
    });

    // Only one logger can own the `log` facade.
    match file {
        Some(logger) => {
            let max_level = logger.filter();
            if log::set_boxed_logger(Box::new(logger)).is_ok() {
                log::set_max_level(max_level);
            }
        }
        None => {
            let _ = LogTracer::init();
        }
    }

    let env_filter = EnvFilter::try_new(&filters).unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339());

    // The subscriber is installed even though its own `log` bridge finds the
    // slot taken.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}
