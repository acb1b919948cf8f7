//! Tracing setup.
//!
//! Logs go to stderr by default. With a log file configured, the previous
//! files are rotated (`router.log` → `.1` → `.2` → `.3`) and every line is
//! flushed as it is written.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Rotated log files kept next to the current one.
const KEEP_ROTATED: u32 = 3;

/// Filter used when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "mcp_router=info,warn";

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` overrides the default filter. Fails if the log file cannot be
/// opened or a subscriber is already installed.
pub fn init_tracing(log_file: Option<&Path>, json: bool) -> std::io::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false);

    let result = match log_file {
        Some(path) => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            rotate_log_file(path, KEEP_ROTATED);
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let writer = FlushingWriter::new(file);
            let builder = builder.with_writer(writer).with_ansi(false);
            if json {
                builder.json().try_init()
            } else {
                builder.try_init()
            }
        }
        None => {
            let builder = builder.with_writer(std::io::stderr);
            if json {
                builder.json().try_init()
            } else {
                builder.try_init()
            }
        }
    };
    result.map_err(|e| std::io::Error::other(e.to_string()))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?log_file,
        pid = std::process::id(),
        "mcp-router starting"
    );
    Ok(())
}

/// Rotate `base` → `base.1` → … → `base.{keep}`, deleting the oldest.
///
/// Missing files in the chain are skipped.
fn rotate_log_file(base: &Path, keep: u32) {
    let _ = std::fs::remove_file(format!("{}.{keep}", base.display()));

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base.display());
        let to = format!("{}.{}", base.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base.exists() {
        let _ = std::fs::rename(base, format!("{}.1", base.display()));
    }
}

/// File writer that flushes after every write so lines survive a crash.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<File>>,
}

impl FlushingWriter {
    fn new(file: File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut file = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = file.write(buf)?;
        file.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?
            .flush()
    }
}

impl<'a> MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_shifts_and_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("router.log");
        for (suffix, body) in [("", "current"), (".1", "one"), (".2", "two"), (".3", "three")] {
            std::fs::write(format!("{}{suffix}", base.display()), body).unwrap();
        }

        rotate_log_file(&base, 3);

        assert!(!base.exists());
        let read = |suffix: &str| std::fs::read_to_string(format!("{}{suffix}", base.display())).unwrap();
        assert_eq!(read(".1"), "current");
        assert_eq!(read(".2"), "one");
        assert_eq!(read(".3"), "two");
    }

    #[test]
    fn test_rotate_with_no_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("router.log");
        rotate_log_file(&base, 3);
        assert!(!base.exists());
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let file = OpenOptions::new().create(true).append(true).open(&path).unwrap();

        let mut writer = FlushingWriter::new(file).make_writer();
        writer.write_all(b"hello\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello\n");
    }
}
