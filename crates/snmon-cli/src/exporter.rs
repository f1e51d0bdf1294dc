use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use anyhow::Result;
use chrono::{DateTime, Days, NaiveDate, Utc};
use snmon_core::{PollKind, PollSummary};
use tracing::{debug, warn};

const FILE_PREFIX: &str = "snmon-";
const FILE_SUFFIX: &str = ".jsonl";
const PRUNE_EVERY: Duration = Duration::from_secs(1800);

pub struct CycleExporter {
    out_dir: PathBuf,
    retention_days: u64,
    current_day: String,
    writer: BufWriter<File>,
    last_prune: Option<Instant>,
}

impl CycleExporter {
    pub fn new(out_dir: impl Into<PathBuf>, retention_days: u64) -> Result<Self> {
        let out_dir = out_dir.into();
        fs::create_dir_all(&out_dir)?;
        let day = day_of(Utc::now());
        let writer = Self::open_writer(&out_dir, &day)?;

        Ok(Self {
            out_dir,
            retention_days,
            current_day: day,
            writer,
            last_prune: None,
        })
    }

    fn open_writer(out_dir: &Path, day: &str) -> Result<BufWriter<File>> {
        let path = out_dir.join(format!("{FILE_PREFIX}{day}{FILE_SUFFIX}"));
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(BufWriter::new(file))
    }

    fn rotate_if_needed(&mut self, ts: DateTime<Utc>) -> Result<()> {
        let day = day_of(ts);
        if day != self.current_day {
            self.writer.flush()?;
            self.writer = Self::open_writer(&self.out_dir, &day)?;
            debug!(day = %day, "export file rotated");
            self.current_day = day;
        }
        Ok(())
    }

    pub fn write_cycle(&mut self, summary: &PollSummary, kind: PollKind) -> Result<()> {
        self.rotate_if_needed(summary.cycle_time)?;

        let exported = serde_json::json!({
            "ts": summary.cycle_time,
            "unix_ms": summary.cycle_time.timestamp_millis(),
            "kind": kind,
            "total": summary.total,
            "succeeded": summary.succeeded,
            "failed": summary.failed,
            "skipped": summary.skipped,
        });

        serde_json::to_writer(&mut self.writer, &exported)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;

        let latest_path = self.out_dir.join("latest.json");
        fs::write(latest_path, serde_json::to_vec_pretty(&exported)?)?;

        self.maybe_prune();
        Ok(())
    }

    fn maybe_prune(&mut self) {
        if self.last_prune.is_some_and(|at| at.elapsed() < PRUNE_EVERY) {
            return;
        }
        self.last_prune = Some(Instant::now());

        if let Err(err) = prune_old_log_files(&self.out_dir, self.retention_days, SystemTime::now()) {
            warn!(error = %err, dir = %self.out_dir.display(), "export pruning failed");
        }
    }
}

fn day_of(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d").to_string()
}

pub(crate) fn prune_old_log_files(out_dir: &Path, retention_days: u64, now: SystemTime) -> Result<()> {
    let today = DateTime::<Utc>::from(now).date_naive();
    let cutoff = today
        .checked_sub_days(Days::new(retention_days))
        .unwrap_or(today);

    for entry in fs::read_dir(out_dir)? {
        let path = entry?.path();
        let Some(file_name) = path.file_name().and_then(|v| v.to_str()) else {
            continue;
        };
        let Some(date_part) = file_name
            .strip_prefix(FILE_PREFIX)
            .and_then(|v| v.strip_suffix(FILE_SUFFIX))
        else {
            continue;
        };
        let Ok(file_date) = NaiveDate::parse_from_str(date_part, "%Y-%m-%d") else {
            continue;
        };

        if file_date < cutoff {
            debug!(file = %file_name, "pruning export file");
            let _ = fs::remove_file(&path);
        }
    }

    Ok(())
}
