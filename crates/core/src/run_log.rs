//! Process-wide tracing setup plus the per-sync NDJSON log file.
//!
//! Every event emitted while a [`RunLogGuard`] is alive is appended as one JSON
//! line to that sync's file. Between syncs the JSON layer writes nowhere.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};

use chrono::Utc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "REPODROP_LOG";
pub const LOG_DIR_ENV: &str = "REPODROP_LOG_DIR";

static RUN_SINK: RunSink = RunSink {
    active: Mutex::new(None),
};
static INIT: OnceLock<()> = OnceLock::new();

struct ActiveRun {
    run_id: String,
    file: BufWriter<File>,
}

struct RunSink {
    active: Mutex<Option<ActiveRun>>,
}

impl RunSink {
    fn lock(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn open(&self, run_id: &str, path: &Path) -> std::io::Result<()> {
        let mut active = self.lock();
        if let Some(run) = active.as_ref() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("run log for {} is still open", run.run_id),
            ));
        }
        let file = OpenOptions::new().create_new(true).write(true).open(path)?;
        *active = Some(ActiveRun {
            run_id: run_id.to_string(),
            file: BufWriter::new(file),
        });
        Ok(())
    }

    fn close(&self) -> std::io::Result<()> {
        let Some(mut run) = self.lock().take() else {
            return Ok(());
        };
        run.file.flush()?;
        run.file.get_ref().sync_all()
    }

    fn append(&self, line: &[u8]) -> std::io::Result<()> {
        match self.lock().as_mut() {
            Some(run) => run.file.write_all(line),
            None => Ok(()),
        }
    }
}

/// Collects one formatted event and hands it to the sink in a single write,
/// so the sink lock is never held while an event is being formatted.
struct EventLine {
    buf: Vec<u8>,
}

impl Write for EventLine {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for EventLine {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            let _ = RUN_SINK.append(&self.buf);
        }
    }
}

struct RunSinkWriter;

impl<'a> MakeWriter<'a> for RunSinkWriter {
    type Writer = EventLine;

    fn make_writer(&'a self) -> Self::Writer {
        EventLine { buf: Vec::new() }
    }
}

/// First parseable directive wins: `REPODROP_LOG`, then `RUST_LOG`, then `info`.
fn env_filter(repodrop_log: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    [repodrop_log, rust_log]
        .into_iter()
        .flatten()
        .find_map(|v| EnvFilter::try_new(v).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Installs the global subscriber once. With `stderr` set, human-readable
/// lines are mirrored to stderr as well.
pub fn init_logging(stderr: bool) {
    INIT.get_or_init(|| {
        let filter = env_filter(
            std::env::var(LOG_ENV).ok().as_deref(),
            std::env::var("RUST_LOG").ok().as_deref(),
        );
        let json = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_writer(RunSinkWriter);
        let console = stderr.then(|| {
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
        });

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(json)
            .with(console)
            .try_init();
    });
}

/// Keeps the run log open; dropping it flushes and fsyncs the file.
pub struct RunLogGuard {
    path: PathBuf,
}

impl RunLogGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLogGuard {
    fn drop(&mut self) {
        let _ = RUN_SINK.close();
    }
}

/// Opens `<log dir>/sync-<utc ts>-<run_id>.ndjson`. Only one run log is open
/// at a time; syncs never overlap.
pub fn start_run_log(run_id: &str, data_dir: &Path) -> std::io::Result<RunLogGuard> {
    init_logging(false);

    let dir = std::env::var_os(LOG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("logs"));
    std::fs::create_dir_all(&dir)?;

    let safe_id: String = run_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let path = dir.join(format!(
        "sync-{}-{safe_id}.ndjson",
        Utc::now().format("%Y%m%dT%H%M%SZ")
    ));

    RUN_SINK.open(run_id, &path)?;
    Ok(RunLogGuard { path })
}
