//! tracing setup: console output plus a size-capped rotating log file.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Errors from logging setup.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to open log file {}: {source}", path.display())]
    Open { path: PathBuf, source: io::Error },
    #[error("failed to install tracing subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// A log file that rotates to `<name>.1` … `<name>.<backups>` once the next
/// write would push it past `max_bytes`.
pub struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
    file: File,
    written: u64,
}

impl RotatingFile {
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64, backups: usize) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            max_bytes,
            backups,
            file,
            written,
        })
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.backups == 0 {
            self.file = File::create(&self.path)?;
        } else {
            let _ = std::fs::remove_file(self.backup_path(self.backups));
            for index in (1..self.backups).rev() {
                let from = self.backup_path(index);
                if from.exists() {
                    std::fs::rename(&from, self.backup_path(index + 1))?;
                }
            }
            std::fs::rename(&self.path, self.backup_path(1))?;
            self.file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
        }
        self.written = 0;
        Ok(())
    }

    #[allow(dead_code)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Verbosity selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

impl Verbosity {
    pub fn from_flags(verbose: bool, quiet: bool) -> Self {
        match (verbose, quiet) {
            (true, _) => Verbosity::Verbose,
            (false, true) => Verbosity::Quiet,
            (false, false) => Verbosity::Normal,
        }
    }

    fn default_directive(&self) -> &'static str {
        match self {
            Verbosity::Quiet => "warn",
            Verbosity::Normal => "info",
            Verbosity::Verbose => "debug",
        }
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the verbosity flags.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the lifetime of the program.
pub fn init(
    log_path: &Path,
    max_bytes: u64,
    backups: usize,
    verbosity: Verbosity,
) -> Result<WorkerGuard, LoggingError> {
    let file = RotatingFile::open(log_path, max_bytes, backups).map_err(|e| LoggingError::Open {
        path: log_path.to_path_buf(),
        source: e,
    })?;
    let (writer, guard) = tracing_appender::non_blocking(file);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.default_directive()));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer),
        )
        .try_init()?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backups_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_rotates_when_write_would_exceed_cap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("process.log");
        let mut file = RotatingFile::open(&path, 10, 2).unwrap();

        file.write_all(b"12345678\n").unwrap();
        file.write_all(b"abcdefgh\n").unwrap();
        file.flush().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "abcdefgh\n");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("process.log.1")).unwrap(),
            "12345678\n"
        );
    }

    #[test]
    fn test_keeps_at_most_backups_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("process.log");
        let mut file = RotatingFile::open(&path, 4, 2).unwrap();

        for line in ["a1\n", "b2\n", "c3\n", "d4\n", "e5\n"] {
            file.write_all(line.as_bytes()).unwrap();
        }
        file.flush().unwrap();

        assert_eq!(
            backups_in(dir.path()),
            vec!["process.log", "process.log.1", "process.log.2"]
        );
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "e5\n");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("process.log.1")).unwrap(),
            "d4\n"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("process.log.2")).unwrap(),
            "c3\n"
        );
    }

    #[test]
    fn test_no_file_exceeds_cap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("process.log");
        let mut file = RotatingFile::open(&path, 64, 3).unwrap();
        for i in 0..200 {
            writeln!(file, "line {i:04}").unwrap();
        }
        file.flush().unwrap();

        for name in backups_in(dir.path()) {
            let len = std::fs::metadata(dir.path().join(&name)).unwrap().len();
            assert!(len <= 64, "{name} is {len} bytes");
        }
        assert_eq!(backups_in(dir.path()).len(), 4);
    }

    #[test]
    fn test_reopen_appends_and_counts_existing_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("process.log");
        {
            let mut file = RotatingFile::open(&path, 8, 1).unwrap();
            file.write_all(b"1234567\n").unwrap();
        }
        let mut file = RotatingFile::open(&path, 8, 1).unwrap();
        assert_eq!(file.path(), path.as_path());
        file.write_all(b"x\n").unwrap();
        file.flush().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "x\n");
        assert!(path.with_file_name("process.log.1").exists());
    }

    #[test]
    fn test_zero_backups_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("process.log");
        let mut file = RotatingFile::open(&path, 4, 0).unwrap();
        file.write_all(b"old\n").unwrap();
        file.write_all(b"new\n").unwrap();
        file.flush().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new\n");
        assert_eq!(backups_in(dir.path()), vec!["process.log"]);
    }

    #[test]
    fn test_verbosity_flags() {
        assert_eq!(Verbosity::from_flags(true, true), Verbosity::Verbose);
        assert_eq!(Verbosity::from_flags(false, true), Verbosity::Quiet);
        assert_eq!(Verbosity::from_flags(false, false).default_directive(), "info");
    }
}
