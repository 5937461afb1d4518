//! Logger setup for the binary.

use crate::config::LogConfig;
use crate::{Error, Result};
use file_rotate::compression::Compression;
use file_rotate::suffix::AppendCount;
use file_rotate::{ContentLimit, FileRotate};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

/// Writes every log line to both `primary` and `secondary`.
pub struct TeeWriter<A, B> {
    primary: A,
    secondary: B,
}

impl<A: Write, B: Write> TeeWriter<A, B> {
    pub fn new(primary: A, secondary: B) -> Self {
        Self { primary, secondary }
    }
}

impl<A: Write, B: Write> Write for TeeWriter<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.primary.write_all(buf)?;
        self.secondary.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.primary.flush()?;
        self.secondary.flush()
    }
}

/// Opens `path` as a log file that is rotated once it holds `max_bytes`,
/// keeping at most `backups` rotated files (`<path>.1`, `<path>.2`, ...).
pub fn rotating_file(
    path: &Path,
    max_bytes: usize,
    backups: usize,
) -> Result<FileRotate<AppendCount>> {
    if max_bytes == 0 {
        return Err(Error::Config("Log file size limit must be positive".to_string()));
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            Error::Config(format!("Cannot create log directory {}: {}", parent.display(), e))
        })?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::Config(format!("Cannot open log file {}: {}", path.display(), e)))?;

    Ok(FileRotate::new(
        path,
        AppendCount::new(backups),
        ContentLimit::Bytes(max_bytes),
        Compression::None,
        #[cfg(unix)]
        None,
    ))
}

/// Builds the `env_logger` logger described by `config`.
///
/// `RUST_LOG` still overrides the configured level. Lines look like
/// `2024-05-01T10:00:00Z: INFO src/tcp.rs 42: Connected 127.0.0.1:5201.`
/// and always go to stdout; with `file_name` set they are copied to a
/// size-rotated file as well.
pub fn builder(config: &LogConfig) -> Result<env_logger::Builder> {
    let level: log::LevelFilter = config
        .level
        .parse()
        .map_err(|_| Error::Config(format!("Unknown log level: {}", config.level)))?;

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.as_str()));

    builder.format(|buf, record| {
        writeln!(
            buf,
            "{}: {} {} {}: {}",
            buf.timestamp(),
            record.level(),
            record.file().unwrap_or("?"),
            record.line().unwrap_or(0),
            record.args()
        )
    });

    if let Some(path) = &config.file_name {
        let file = rotating_file(Path::new(path), config.max_bytes, config.backup_count)?;
        builder.target(env_logger::Target::Pipe(Box::new(TeeWriter::new(
            io::stdout(),
            file,
        ))));
    }

    Ok(builder)
}

/// Installs the global logger.
pub fn init(config: &LogConfig) -> Result<()> {
    builder(config)?
        .try_init()
        .map_err(|e| Error::Config(format!("Logger already initialised: {}", e)))
}
