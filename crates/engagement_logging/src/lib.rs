//! Logging setup for engagement pipeline binaries.
//!
//! Every run writes to a size-rotated log file under the pipeline home
//! directory and mirrors to stderr. `RUST_LOG` overrides the default filter.

use anyhow::{Context, Result};
use engagement_protocol::defaults;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "engagement=info,engagement_sync=info,engagement_coding=info,engagement_analysis=info,engagement_store=warn";
const MAX_LOG_FILES: usize = 5;
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Logging configuration for a pipeline run.
pub struct LogConfig<'a> {
    /// Base name of the log file (usually the pipeline name)
    pub app_name: &'a str,
    /// Mirror debug output to stderr
    pub verbose: bool,
    /// Override the log directory (defaults to `<home>/logs`)
    pub log_dir: Option<PathBuf>,
}

/// Initialize tracing with a rotating file writer and stderr output.
///
/// Returns the path of the active log file.
pub fn init_logging(config: LogConfig<'_>) -> Result<PathBuf> {
    let log_dir = match config.log_dir {
        Some(dir) => dir,
        None => logs_dir(),
    };
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create logs directory: {}", log_dir.display()))?;

    let file_writer = SharedLogWriter::open(&log_dir, config.app_name)
        .context("Failed to initialize rotating log writer")?;
    let log_path = file_writer.current_path();

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if config.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(log_path)
}

/// Pipeline home directory: `$ENGAGEMENT_HOME` or `~/.engagement_pipeline`.
pub fn pipeline_home() -> PathBuf {
    if let Ok(override_path) = std::env::var(defaults::HOME_ENV_VAR) {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(defaults::DEFAULT_HOME_DIR)
}

/// Logs directory: `<home>/logs`.
pub fn logs_dir() -> PathBuf {
    pipeline_home().join("logs")
}

/// Size-rotated log file: `<name>.log`, `<name>.log.1`, ... `<name>.log.<keep-1>`.
struct RotatingLog {
    dir: PathBuf,
    base_name: String,
    keep: usize,
    max_size: u64,
    file: Option<File>,
    written: u64,
}

impl RotatingLog {
    fn open(dir: &Path, base_name: &str, keep: usize, max_size: u64) -> io::Result<Self> {
        let mut log = Self {
            dir: dir.to_path_buf(),
            base_name: sanitize_name(base_name),
            keep: keep.max(1),
            max_size,
            file: None,
            written: 0,
        };
        log.reopen()?;
        if log.written > log.max_size {
            log.rotate()?;
        }
        Ok(log)
    }

    fn reopen(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.current_path())?;
        self.written = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }

    fn current_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.base_name))
    }

    fn numbered_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}.log.{}", self.base_name, index))
    }

    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }

        let oldest = self.keep.saturating_sub(1);
        if oldest == 0 {
            fs::remove_file(self.current_path()).or_else(ignore_missing)?;
            return self.reopen();
        }

        fs::remove_file(self.numbered_path(oldest)).or_else(ignore_missing)?;
        for idx in (1..oldest).rev() {
            let src = self.numbered_path(idx);
            if src.exists() {
                fs::rename(&src, self.numbered_path(idx + 1))?;
            }
        }
        let current = self.current_path();
        if current.exists() {
            fs::rename(current, self.numbered_path(1))?;
        }
        self.reopen()
    }
}

fn ignore_missing(err: io::Error) -> io::Result<()> {
    if err.kind() == io::ErrorKind::NotFound {
        Ok(())
    } else {
        Err(err)
    }
}

impl Write for RotatingLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "log file unavailable"))?;
        let bytes = file.write(buf)?;
        self.written += bytes as u64;
        Ok(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// `MakeWriter` handing out guards over one shared rotating log.
#[derive(Clone)]
struct SharedLogWriter {
    inner: Arc<Mutex<RotatingLog>>,
}

impl SharedLogWriter {
    fn open(dir: &Path, base_name: &str) -> Result<Self> {
        let log = RotatingLog::open(dir, base_name, MAX_LOG_FILES, MAX_LOG_FILE_SIZE)
            .with_context(|| format!("Failed to open log file for {}", base_name))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(log)),
        })
    }

    fn current_path(&self) -> PathBuf {
        match self.inner.lock() {
            Ok(log) => log.current_path(),
            Err(poisoned) => poisoned.into_inner().current_path(),
        }
    }
}

struct SharedLogGuard {
    inner: Arc<Mutex<RotatingLog>>,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedLogWriter {
    type Writer = SharedLogGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedLogGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedLogGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?
            .flush()
    }
}

fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "engagement".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("WorldBank-CPF S01"), "WorldBank-CPF_S01");
        assert_eq!(sanitize_name(""), "engagement");
    }

    #[test]
    fn test_rotation_keeps_bounded_files() {
        let tmp = tempfile::tempdir().unwrap();
        let mut log = RotatingLog::open(tmp.path(), "run", 3, 10).unwrap();

        for _ in 0..6 {
            log.write_all(b"0123456789").unwrap();
        }
        log.flush().unwrap();

        assert!(tmp.path().join("run.log").exists());
        assert!(tmp.path().join("run.log.1").exists());
        assert!(tmp.path().join("run.log.2").exists());
        assert!(!tmp.path().join("run.log.3").exists());
    }
}
