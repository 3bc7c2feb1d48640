//! Process-wide JSON logging, plus one NDJSON file per backup, restore, or export run.
//!
//! Every event emitted while a [`RunLogGuard`] is alive lands in that run's file. The guard
//! brackets the file with `run.start` and `run.finish` events carrying the run's kind and id.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Instant;

use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use tracing::{error, info};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{Error, Result};

pub const LOG_ENV: &str = "MSGBACKUP_LOG";
pub const LOG_DIR_ENV: &str = "MSGBACKUP_LOG_DIR";
const DEFAULT_FILTER: &str = "info";

static SINK: OnceLock<RunFile> = OnceLock::new();
static SUBSCRIBER: OnceLock<()> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunKind {
    /// Export plus archive upload of a full backup.
    Backup,
    /// Decoding a backup stream back into frames.
    Restore,
    /// Encoding frames into a backup stream without uploading it.
    Export,
}

impl RunKind {
    pub const ALL: [Self; 3] = [Self::Backup, Self::Restore, Self::Export];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Restore => "restore",
            Self::Export => "export",
        }
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::InvalidConfig {
                message: format!("unknown run kind: {s}"),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Succeeded,
    Failed,
}

impl RunStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

/// The single active run file, shared by every thread that logs.
#[derive(Debug, Default)]
struct RunFile {
    writer: Mutex<Option<BufWriter<File>>>,
}

impl RunFile {
    fn open(&self, path: &Path) -> io::Result<()> {
        let mut slot = self.writer.lock();
        if slot.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "another run log is active",
            ));
        }
        let file = OpenOptions::new().create_new(true).write(true).open(path)?;
        *slot = Some(BufWriter::new(file));
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        match self.writer.lock().take() {
            Some(mut w) => {
                w.flush()?;
                w.get_ref().sync_all()
            }
            None => Ok(()),
        }
    }
}

/// Discards output while no run is active.
struct RunFileWriter<'a>(MutexGuard<'a, Option<BufWriter<File>>>);

impl Write for RunFileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.as_mut() {
            Some(w) => w.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.as_mut().map_or(Ok(()), |w| w.flush())
    }
}

impl<'a> MakeWriter<'a> for RunFile {
    type Writer = RunFileWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        RunFileWriter(self.writer.lock())
    }
}

impl<'a> MakeWriter<'a> for &RunFile {
    type Writer = RunFileWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        (**self).make_writer()
    }
}

fn env_filter(explicit: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    explicit
        .or(rust_log)
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the process-wide subscriber. Events go nowhere until a run log is started.
pub fn init_logging() {
    SUBSCRIBER.get_or_init(|| {
        let sink = SINK.get_or_init(RunFile::default);
        let filter = env_filter(
            std::env::var(LOG_ENV).ok().as_deref(),
            std::env::var("RUST_LOG").ok().as_deref(),
        );
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_writer(sink);
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init();
    });
}

/// Open run log. Dropping it without [`RunLogGuard::finish`] records the run as failed.
pub struct RunLogGuard {
    kind: RunKind,
    run_id: String,
    path: PathBuf,
    started: Instant,
    finished: bool,
}

impl RunLogGuard {
    pub fn kind(&self) -> RunKind {
        self.kind
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records the outcome, then flushes and fsyncs the file.
    pub fn finish(mut self, status: RunStatus) -> io::Result<()> {
        self.finished = true;
        self.record_finish(status);
        close_sink()
    }

    fn record_finish(&self, status: RunStatus) {
        let duration_ms = self.started.elapsed().as_millis() as u64;
        match status {
            RunStatus::Succeeded => info!(
                event = "run.finish",
                kind = self.kind.as_str(),
                run_id = %self.run_id,
                status = status.as_str(),
                duration_ms,
                "run.finish"
            ),
            RunStatus::Failed => error!(
                event = "run.finish",
                kind = self.kind.as_str(),
                run_id = %self.run_id,
                status = status.as_str(),
                duration_ms,
                "run.finish"
            ),
        }
    }
}

impl Drop for RunLogGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.record_finish(RunStatus::Failed);
            let _ = close_sink();
        }
    }
}

fn close_sink() -> io::Result<()> {
    SINK.get().map_or(Ok(()), RunFile::close)
}

/// Opens `run-<kind>-<utc>-<run_id>.ndjson` under the log directory and records `run.start`.
pub fn start_run_log(kind: RunKind, run_id: &str, data_dir: &Path) -> io::Result<RunLogGuard> {
    init_logging();

    let dir = log_dir(data_dir);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!(
        "run-{}-{}-{}.ndjson",
        kind.as_str(),
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        sanitize_filename_component(run_id)
    ));

    SINK.get_or_init(RunFile::default).open(&path)?;
    info!(event = "run.start", kind = kind.as_str(), run_id, "run.start");

    Ok(RunLogGuard {
        kind,
        run_id: run_id.to_string(),
        path,
        started: Instant::now(),
        finished: false,
    })
}

fn log_dir(data_dir: &Path) -> PathBuf {
    std::env::var_os(LOG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("logs"))
}

pub(crate) fn sanitize_filename_component(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_events(path: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn field<'a>(event: &'a serde_json::Value, name: &str) -> &'a serde_json::Value {
        &event["fields"][name]
    }

    /// Other tests log concurrently into the same sink, so match on the event name.
    fn find<'a>(events: &'a [serde_json::Value], name: &str) -> &'a serde_json::Value {
        events
            .iter()
            .find(|e| field(e, "event") == name)
            .unwrap_or_else(|| panic!("no {name} event in {events:?}"))
    }

    #[test]
    fn filter_prefers_explicit_then_rust_log_then_default() {
        assert_eq!(env_filter(Some("debug"), Some("warn")).to_string(), "debug");
        assert_eq!(env_filter(None, Some("warn")).to_string(), "warn");
        assert_eq!(env_filter(None, None).to_string(), "info");
    }

    #[test]
    fn run_kinds_parse_from_their_names() {
        for kind in RunKind::ALL {
            assert_eq!(kind.as_str().parse::<RunKind>().unwrap(), kind);
        }
        assert!(matches!(
            "verify".parse::<RunKind>(),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn filename_components_are_sanitized() {
        assert_eq!(sanitize_filename_component("a/b c"), "a_b_c");
        assert_eq!(sanitize_filename_component("run-1.x"), "run-1.x");
    }

    // Both cases share the process-wide sink, so they run in sequence.
    #[test]
    fn run_log_brackets_events_and_records_the_outcome() {
        let temp = tempfile::tempdir().unwrap();

        let guard = start_run_log(RunKind::Export, "run/a", temp.path()).unwrap();
        assert_eq!(guard.path().parent(), Some(temp.path().join("logs").as_path()));
        let name = guard.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("run-export-"));
        assert!(name.ends_with("-run_a.ndjson"));
        assert!(start_run_log(RunKind::Restore, "other", temp.path()).is_err());

        tracing::warn!(event = "codec.decode.mac_mismatch", "codec.decode.mac_mismatch");
        let path = guard.path().to_path_buf();
        guard.finish(RunStatus::Succeeded).unwrap();

        let events = read_events(&path);
        let start = find(&events, "run.start");
        assert_eq!(field(start, "kind"), "export");
        assert_eq!(field(start, "run_id"), "run/a");
        find(&events, "codec.decode.mac_mismatch");
        let finish = find(&events, "run.finish");
        assert_eq!(field(finish, "status"), "succeeded");
        assert!(field(finish, "duration_ms").is_u64());
        for e in &events {
            assert!(e.get("timestamp").is_some());
            assert!(e.get("level").is_some());
        }

        let guard = start_run_log(RunKind::Restore, "run_b", temp.path()).unwrap();
        let path = guard.path().to_path_buf();
        drop(guard);
        let events = read_events(&path);
        let finish = find(&events, "run.finish");
        assert_eq!(field(finish, "status"), "failed");
        assert_eq!(finish["level"], "ERROR");
    }
}
