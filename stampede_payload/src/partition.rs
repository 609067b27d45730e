//! Partitioned dataset output.
//!
//! Events are written round-robin into a fixed number of files: the event
//! issued at index `i` lands in partition `i % partitions`. File names come
//! from a template in which `%NNN%` is replaced by the zero-padded partition
//! number.

use std::{
    fs::File,
    io::{self, BufWriter, Write},
    num::NonZeroUsize,
    path::PathBuf,
    thread,
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{
    dataset::{self, Format},
    event::Event,
    synth::{Handle, Synthesizer},
};

/// Placeholder replaced by the partition number in a path template.
pub const PLACEHOLDER: &str = "%NNN%";

/// Errors produced by [`Writer`] and [`generate_files`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A partition file could not be created or written.
    #[error("Partition file {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// More than one partition requested but the template has no placeholder.
    #[error("Template {0:?} must contain {PLACEHOLDER} to write more than one partition")]
    Template(String),
    /// An event could not be rendered.
    #[error(transparent)]
    Encode(#[from] dataset::Error),
    /// A per-worker handle could not be built.
    #[error(transparent)]
    Synth(#[from] crate::synth::Error),
    /// A writer thread panicked.
    #[error("Writer thread panicked")]
    Panicked,
}

/// Expand `template` for partition `partition`.
#[must_use]
pub fn path_for(template: &str, partition: usize) -> PathBuf {
    PathBuf::from(template.replace(PLACEHOLDER, &format!("{partition:03}")))
}

#[derive(Debug)]
struct Partition {
    path: PathBuf,
    out: Mutex<BufWriter<File>>,
}

/// A set of partition files, safe to write from several threads at once.
#[derive(Debug)]
pub struct Writer {
    format: Format,
    partitions: Vec<Partition>,
}

impl Writer {
    /// Create, truncating, one file per partition.
    ///
    /// # Errors
    ///
    /// Returns an error if the template cannot distinguish the partitions or
    /// a file cannot be created.
    pub fn create(template: &str, partitions: NonZeroUsize, format: Format) -> Result<Self, Error> {
        if partitions.get() > 1 && !template.contains(PLACEHOLDER) {
            return Err(Error::Template(template.to_string()));
        }
        let partitions = (0..partitions.get())
            .map(|i| {
                let path = path_for(template, i);
                let file = File::create(&path).map_err(|source| Error::Io {
                    path: path.clone(),
                    source,
                })?;
                debug!(path = %path.display(), "partition file created");
                Ok(Partition {
                    path,
                    out: Mutex::new(BufWriter::new(file)),
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(Self { format, partitions })
    }

    /// Write `event`, issued at `index`, to its partition.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be rendered or written.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write(&self, index: u64, event: &Event, timestamp: Duration) -> Result<(), Error> {
        let partition = &self.partitions[(index % self.partitions.len() as u64) as usize];
        let line = self.format.encode(event, Some(timestamp))?;
        let mut out = partition.out.lock();
        writeln!(out, "{line}").map_err(|source| Error::Io {
            path: partition.path.clone(),
            source,
        })
    }

    /// Paths of every partition, in partition order.
    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.partitions.iter().map(|p| &p.path)
    }

    /// Flush and close every partition. Every file is flushed even if an
    /// earlier one fails; the first failure is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if a partition cannot be flushed.
    pub fn finish(self) -> Result<(), Error> {
        let mut first = None;
        for partition in self.partitions {
            let mut out = partition.out.into_inner();
            if let Err(source) = out.flush() {
                first.get_or_insert(Error::Io {
                    path: partition.path,
                    source,
                });
            }
        }
        first.map_or(Ok(()), Err)
    }
}

/// Run `synth` to exhaustion on `threads` threads, writing every event into
/// `writer`. `stamp` maps an issue index to the event's timestamp. Returns the
/// number of events written.
///
/// The writer is flushed and closed whether or not generation succeeds.
///
/// # Errors
///
/// Returns the first error raised by any thread, or by the final flush.
pub fn generate_files<F>(
    synth: &std::sync::Arc<Synthesizer>,
    writer: Writer,
    threads: NonZeroUsize,
    stamp: F,
) -> Result<u64, Error>
where
    F: Fn(u64) -> Duration + Sync,
{
    let handles = (0..threads.get())
        .map(|t| synth.handle(u32::try_from(t).unwrap_or(u32::MAX)))
        .collect::<Result<Vec<Handle>, _>>()?;

    let writer_ref = &writer;
    let stamp = &stamp;
    let result = thread::scope(|scope| {
        let running: Vec<_> = handles
            .into_iter()
            .map(|mut handle| {
                scope.spawn(move || -> Result<u64, Error> {
                    let mut written = 0;
                    while let Some(issued) = handle.next_event() {
                        if let Err(err) = writer_ref.write(issued.index, &issued.event, stamp(issued.index)) {
                            handle.synthesizer().stop();
                            return Err(err);
                        }
                        written += 1;
                    }
                    Ok(written)
                })
            })
            .collect();
        let mut total = 0;
        let mut first = None;
        for thread in running {
            match thread.join() {
                Ok(Ok(n)) => total += n,
                Ok(Err(err)) => {
                    first.get_or_insert(err);
                }
                Err(_) => {
                    first.get_or_insert(Error::Panicked);
                }
            }
        }
        first.map_or(Ok(total), Err)
    });

    let paths: Vec<_> = writer.paths().cloned().collect();
    let flushed = writer.finish();
    let total = result?;
    flushed?;
    info!(events = total, partitions = paths.len(), "datagen complete");
    Ok(total)
}

#[cfg(test)]
mod test {
    use std::{fs, num::NonZeroUsize, sync::Arc, time::Duration};

    use tempfile::TempDir;

    use super::{Error, Writer, generate_files, path_for};
    use crate::{
        dataset::{Format, Parser},
        event::{Attribute, Datatype, EventType, Schema},
        mix::Mix,
        synth::Synthesizer,
    };

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::new(vec![
                EventType::new(
                    "Stock",
                    vec![
                        Attribute::new("symbol", Datatype::Text),
                        Attribute::new("price", Datatype::Double),
                    ],
                )
                .unwrap(),
                EventType::new("Quote", vec![Attribute::new("bid", Datatype::Float)]).unwrap(),
            ])
            .unwrap(),
        )
    }

    fn format() -> Format {
        Format {
            has_types: true,
            has_timestamps: true,
            ..Format::default()
        }
    }

    fn template(dir: &TempDir) -> String {
        format!("{}/events-%NNN%.csv", dir.path().display())
    }

    #[test]
    fn template_expansion() {
        assert_eq!(path_for("/tmp/x-%NNN%.csv", 7).to_str(), Some("/tmp/x-007.csv"));
        assert_eq!(path_for("/tmp/x.csv", 0).to_str(), Some("/tmp/x.csv"));
    }

    #[test]
    fn template_without_placeholder_rejected() {
        let dir = TempDir::new().unwrap();
        let template = format!("{}/events.csv", dir.path().display());
        let res = Writer::create(&template, NonZeroUsize::new(2).unwrap(), format());
        assert!(matches!(res, Err(Error::Template(_))));
    }

    #[test]
    fn missing_directory_is_io_error() {
        let res = Writer::create(
            "/nonexistent/stampede/%NNN%.csv",
            NonZeroUsize::new(1).unwrap(),
            format(),
        );
        assert!(matches!(res, Err(Error::Io { .. })));
    }

    // Two types at 70/30 in a deterministic mix, 1000 events, 4 partitions.
    #[test]
    fn deterministic_datagen_round_robin() {
        let dir = TempDir::new().unwrap();
        let schema = schema();
        let mix = Mix::new(
            vec![
                (Arc::clone(&schema.types()[0]), 70.0),
                (Arc::clone(&schema.types()[1]), 30.0),
            ],
            true,
            1,
        )
        .unwrap();
        let synth = Arc::new(Synthesizer::new(mix, 1_000, 9));
        let partitions = NonZeroUsize::new(4).unwrap();
        let writer = Writer::create(&template(&dir), partitions, format()).unwrap();
        let written = generate_files(
            &synth,
            writer,
            NonZeroUsize::new(3).unwrap(),
            Duration::from_millis,
        )
        .unwrap();
        assert_eq!(written, 1_000);

        let mut parser = Parser::new(format(), Arc::clone(&schema)).unwrap();
        let mut total = 0;
        for partition in 0..4 {
            let text = fs::read_to_string(path_for(&template(&dir), partition)).unwrap();
            let mut records: Vec<_> = text
                .lines()
                .enumerate()
                .map(|(n, line)| parser.parse(line, n as u64 + 1).unwrap().unwrap())
                .collect();
            assert_eq!(records.len(), 250);
            total += records.len();
            // Timestamps are the issue index, which fixes both the partition
            // and, under a deterministic mix, the type.
            records.sort_by_key(|r| r.timestamp);
            for record in records {
                let index = record.timestamp.unwrap().as_millis() as usize;
                assert_eq!(index % 4, partition);
                let expected = if index % 2 == 0 { "Stock" } else { "Quote" };
                assert_eq!(record.event.type_name(), expected);
            }
        }
        assert_eq!(total, 1_000);
    }

    #[test]
    fn stochastic_datagen_follows_weights() {
        let dir = TempDir::new().unwrap();
        let schema = schema();
        let mix = Mix::stochastic(
            vec![
                (Arc::clone(&schema.types()[0]), 70.0),
                (Arc::clone(&schema.types()[1]), 30.0),
            ],
            5,
        )
        .unwrap();
        let synth = Arc::new(Synthesizer::new(mix, 10_000, 9));
        let writer = Writer::create(&template(&dir), NonZeroUsize::new(2).unwrap(), format())
            .unwrap();
        generate_files(&synth, writer, NonZeroUsize::new(2).unwrap(), Duration::from_millis)
            .unwrap();

        let mut stock = 0usize;
        let mut all = 0usize;
        for partition in 0..2 {
            let text = fs::read_to_string(path_for(&template(&dir), partition)).unwrap();
            for line in text.lines() {
                all += 1;
                if line.starts_with("type:Stock") {
                    stock += 1;
                }
            }
        }
        assert_eq!(all, 10_000);
        let ratio = stock as f64 / all as f64;
        assert!((ratio - 0.7).abs() < 0.03, "ratio {ratio}");
    }
}
