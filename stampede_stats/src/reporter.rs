//! Periodic JSON lines report writer.
//!
//! The [`Reporter`] wakes once per bucket, snapshots its [`Recorder`] and
//! writes every resulting [`PerformanceStats`] as one JSON object per line. A
//! final, possibly short, bucket is written when shutdown is signalled.

use std::{
    fs::File,
    future::Future,
    io::{BufWriter, Write},
    path::Path,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::info;

use crate::{perf::PerformanceStats, recorder::Recorder};

/// Errors produced by [`Reporter`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// IO errors during write operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// The reporting bucket is zero.
    #[error("Reporting bucket must be non-zero")]
    ZeroBucket,
}

/// Writes [`PerformanceStats`] records one per line.
#[derive(Debug)]
pub struct Format<W: Write> {
    writer: W,
}

impl<W: Write> Format<W> {
    /// Create a new instance of `Format`
    #[must_use]
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write a single record.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails
    pub fn write_stats(&mut self, stats: &PerformanceStats) -> Result<(), Error> {
        serde_json::to_writer(&mut self.writer, stats)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    /// Flush any buffered data.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing fails
    pub fn flush(&mut self) -> Result<(), Error> {
        self.writer.flush()?;
        Ok(())
    }

    /// Give back the underlying writer.
    #[must_use]
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl Format<BufWriter<File>> {
    /// Create, truncating, the report file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn create(path: &Path) -> Result<Self, Error> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

#[derive(Debug)]
/// Drives periodic snapshots of a [`Recorder`] into a [`Format`].
pub struct Reporter<W: Write> {
    recorder: Recorder,
    bucket: Duration,
    format: Format<W>,
    epoch_ms: u64,
}

impl<W: Write> Reporter<W> {
    /// Create a new [`Reporter`]. Buckets are labelled in milliseconds since
    /// the Unix epoch, counted from the moment of creation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ZeroBucket`] if `bucket` is zero.
    pub fn new(recorder: Recorder, bucket: Duration, format: Format<W>) -> Result<Self, Error> {
        if bucket.is_zero() {
            return Err(Error::ZeroBucket);
        }
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        Ok(Self {
            recorder,
            bucket,
            format,
            epoch_ms,
        })
    }

    /// Label the first bucket `epoch_ms` rather than the wall clock.
    #[must_use]
    pub fn with_epoch(mut self, epoch_ms: u64) -> Self {
        self.epoch_ms = epoch_ms;
        self
    }

    /// Report until `shutdown` resolves, then write the final bucket and
    /// return the writer.
    ///
    /// # Errors
    ///
    /// Returns an error if a record cannot be written.
    pub async fn run<F>(mut self, shutdown: F) -> Result<W, Error>
    where
        F: Future<Output = ()>,
    {
        let start = Instant::now();
        let mut interval = time::interval_at(start + self.bucket, self.bucket);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last = start;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                now = interval.tick() => {
                    self.emit(start, last, now)?;
                    last = now;
                }
                () = &mut shutdown => {
                    let now = Instant::now();
                    if now > last {
                        self.emit(start, last, now)?;
                    }
                    info!("Reporter shutting down, {} results recorded", self.recorder.total_count());
                    self.format.flush()?;
                    return Ok(self.format.into_inner());
                }
            }
        }
    }

    fn emit(&mut self, start: Instant, from: Instant, to: Instant) -> Result<(), Error> {
        let offset = u64::try_from(from.duration_since(start).as_millis()).unwrap_or(u64::MAX);
        let timestamp = self.epoch_ms.saturating_add(offset);
        let snapshots = self
            .recorder
            .snapshot(timestamp, to.duration_since(from), to.duration_since(start));
        for stats in &snapshots {
            info!(
                stream = %stats.stream,
                interval_count = stats.interval_count,
                last_throughput = stats.last_throughput,
                avg_rt = stats.avg_rt,
                "bucket closed"
            );
            self.format.write_stats(stats)?;
        }
        self.format.flush()?;
        Ok(())
    }
}
