//! Output sinks
//!
//! A sink is where workers hand off each stamped event. Protocol adapters for
//! particular engines live behind the [`Sink`] trait; the sinks here cover the
//! cases stampede needs on its own: dropping events after encoding them,
//! writing them to partition files, and looping them straight back to the
//! response listener.
//!
//! ## Metrics
//!
//! `bytes_written`: Encoded bytes handed off by the blackhole and loopback
//! sinks

use std::{
    fmt::Debug,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use metrics::counter;
use stampede_payload::{
    Event, Schema,
    converter::{self, Converter},
    dataset, partition,
};
use stampede_stats::{Resolution, Stream};
use tokio::{
    fs,
    io::{AsyncWriteExt, BufWriter},
    sync::Mutex as AsyncMutex,
};
use tracing::{debug, info};

use crate::{
    common::{self, MetricsBuilder},
    config,
    listener::Listener,
};

/// Errors produced by a [`Sink`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An event could not be converted to or from its wire message.
    #[error("Protocol failure: {0}")]
    Protocol(#[from] converter::Error),
    /// A partition file could not be written.
    #[error(transparent)]
    Partition(#[from] partition::Error),
    /// The sink has been closed.
    #[error("Sink is closed")]
    Closed,
}

#[async_trait]
/// Destination of emitted events.
pub trait Sink: Debug + Send + Sync {
    /// Hand off `event`, issued at `index`.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be delivered.
    async fn send(&self, index: u64, event: &Event) -> Result<(), Error>;

    /// Flush and release any resources. Sends after closing fail.
    ///
    /// # Errors
    ///
    /// Returns an error if buffered events cannot be flushed.
    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Build the sink described by `config`.
///
/// # Errors
///
/// Returns an error if partition files or the converter cannot be created.
pub fn build(
    config: &config::Sink,
    schema: &Arc<Schema>,
    resolution: Resolution,
    listener: &Listener,
) -> Result<Arc<dyn Sink>, Error> {
    let sink: Arc<dyn Sink> = match config {
        config::Sink::Blackhole => Arc::new(Blackhole::new(converter::Kind::default().build(Arc::clone(schema))?)),
        config::Sink::File {
            path_template,
            partitions,
            format,
        } => Arc::new(File::create(path_template, *partitions, format.clone(), resolution)?),
        config::Sink::Loopback { converter } => Arc::new(Loopback::new(
            converter.build(Arc::clone(schema))?,
            listener.clone(),
        )),
    };
    Ok(sink)
}

#[derive(Debug)]
/// Encodes every event and discards it.
pub struct Blackhole {
    converter: Arc<dyn Converter>,
    labels: Vec<(String, String)>,
}

impl Blackhole {
    /// Create a new [`Blackhole`] encoding with `converter`.
    #[must_use]
    pub fn new(converter: Arc<dyn Converter>) -> Self {
        Self {
            converter,
            labels: MetricsBuilder::new("sink", "blackhole").build(),
        }
    }
}

#[async_trait]
impl Sink for Blackhole {
    async fn send(&self, _index: u64, event: &Event) -> Result<(), Error> {
        let message = self.converter.to_message(event)?;
        counter!("bytes_written", &self.labels).increment(message.len() as u64);
        Ok(())
    }
}

#[derive(Debug)]
struct Partition {
    path: PathBuf,
    out: AsyncMutex<Option<BufWriter<fs::File>>>,
}

#[derive(Debug)]
/// Writes events round-robin by issue index into partition files. Every
/// partition has its own lock, so workers writing different partitions never
/// wait on each other.
pub struct File {
    format: dataset::Format,
    partitions: Vec<Partition>,
    resolution: Resolution,
}

impl File {
    /// Create, truncating, one file per partition of `template`.
    ///
    /// # Errors
    ///
    /// Returns an error if the template cannot distinguish the partitions or
    /// a file cannot be created.
    pub fn create(
        template: &str,
        partitions: NonZeroUsize,
        format: dataset::Format,
        resolution: Resolution,
    ) -> Result<Self, Error> {
        if partitions.get() > 1 && !template.contains(partition::PLACEHOLDER) {
            return Err(partition::Error::Template(template.to_string()).into());
        }
        let partitions = (0..partitions.get())
            .map(|i| {
                let path = partition::path_for(template, i);
                let file = std::fs::File::create(&path).map_err(|source| partition::Error::Io {
                    path: path.clone(),
                    source,
                })?;
                debug!(path = %path.display(), "partition file created");
                Ok(Partition {
                    path,
                    out: AsyncMutex::new(Some(BufWriter::new(fs::File::from_std(file)))),
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(Self {
            format,
            partitions,
            resolution,
        })
    }
}

fn io_error(path: &Path, source: std::io::Error) -> Error {
    Error::Partition(partition::Error::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[async_trait]
impl Sink for File {
    #[allow(clippy::cast_possible_truncation)]
    async fn send(&self, index: u64, event: &Event) -> Result<(), Error> {
        let partition = &self.partitions[(index % self.partitions.len() as u64) as usize];
        let timestamp = common::to_duration(event.timestamp, self.resolution);
        let mut line = self
            .format
            .encode(event, Some(timestamp))
            .map_err(partition::Error::from)?;
        line.push('\n');
        let mut out = partition.out.lock().await;
        let out = out.as_mut().ok_or(Error::Closed)?;
        out.write_all(line.as_bytes())
            .await
            .map_err(|source| io_error(&partition.path, source))
    }

    async fn close(&self) -> Result<(), Error> {
        let mut first = None;
        let mut paths = Vec::new();
        for partition in &self.partitions {
            let Some(mut out) = partition.out.lock().await.take() else {
                continue;
            };
            // Flushes the buffer before closing the file.
            if let Err(source) = out.shutdown().await {
                first.get_or_insert(io_error(&partition.path, source));
            }
            paths.push(partition.path.display().to_string());
        }
        if !paths.is_empty() {
            info!(?paths, "partition files closed");
        }
        first.map_or(Ok(()), Err)
    }
}

#[derive(Debug)]
/// Sends every event through its converter and back, then reports it to the
/// listener on the output stream named after the event type.
pub struct Loopback {
    converter: Arc<dyn Converter>,
    listener: Listener,
    labels: Vec<(String, String)>,
}

impl Loopback {
    /// Create a new [`Loopback`].
    #[must_use]
    pub fn new(converter: Arc<dyn Converter>, listener: Listener) -> Self {
        Self {
            converter,
            listener,
            labels: MetricsBuilder::new("sink", "loopback").build(),
        }
    }
}

#[async_trait]
impl Sink for Loopback {
    async fn send(&self, _index: u64, event: &Event) -> Result<(), Error> {
        let message = self.converter.to_message(event)?;
        counter!("bytes_written", &self.labels).increment(message.len() as u64);
        let received = self.converter.from_message(&message)?;
        let emitted = common::now(self.listener.recorder().resolution());
        self.listener
            .on_output(&Stream::output(received.type_name()), &received, Some(emitted));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{num::NonZeroUsize, sync::Arc};

    use stampede_payload::{
        Attribute, Datatype, Event, EventType, Schema, Value,
        converter::{Converter, Json, Kind},
        dataset, partition,
    };
    use stampede_stats::{Recorder, Resolution, Stream};

    use super::{Blackhole, Error, File, Loopback, Sink};
    use crate::listener::{Listener, TimestampMode};

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::new(vec![
                EventType::new("Trade", vec![Attribute::new("price", Datatype::Double)]).unwrap(),
            ])
            .unwrap(),
        )
    }

    fn trade(schema: &Schema, price: f64, timestamp: u64) -> Event {
        let mut event = Event::new(Arc::clone(schema.get("Trade").unwrap()), vec![Value::Double(price)]);
        event.timestamp = timestamp;
        event
    }

    #[tokio::test]
    async fn loopback_records_by_event_type() {
        let schema = schema();
        let listener = Listener::new(Recorder::new(Resolution::Millis), TimestampMode::Adapter);
        let sink = Loopback::new(Kind::Json.build(Arc::clone(&schema)).unwrap(), listener.clone());
        let now = crate::common::now(Resolution::Millis);
        for i in 0..3 {
            sink.send(i, &trade(&schema, 1.5, now)).await.unwrap();
        }
        let stats = listener.recorder().peek();
        let counters = stats.get(&Stream::output("Trade")).unwrap();
        assert_eq!(counters.total_count(), 3);
        assert!(counters.min_rt().unwrap() >= 0.0);
    }

    #[derive(Debug)]
    struct Broken;

    impl Converter for Broken {
        fn to_message(&self, _event: &Event) -> Result<Vec<u8>, stampede_payload::converter::Error> {
            Ok(b"not json".to_vec())
        }

        fn from_message(&self, message: &[u8]) -> Result<Event, stampede_payload::converter::Error> {
            Json::new(schema()).from_message(message)
        }
    }

    #[tokio::test]
    async fn protocol_failures_propagate() {
        let schema = schema();
        let listener = Listener::new(Recorder::new(Resolution::Millis), TimestampMode::EndToEnd);
        let sink = Loopback::new(Arc::new(Broken), listener.clone());
        let err = sink.send(0, &trade(&schema, 1.0, 0)).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(listener.recorder().total_count(), 0);
    }

    #[tokio::test]
    async fn blackhole_accepts_everything() {
        let schema = schema();
        let sink = Blackhole::new(Kind::Delimited.build(Arc::clone(&schema)).unwrap());
        sink.send(0, &trade(&schema, 2.0, 5)).await.unwrap();
        sink.close().await.unwrap();
    }

    #[tokio::test]
    async fn file_sink_partitions_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("out-%NNN%.csv").display().to_string();
        let format = dataset::Format {
            has_types: true,
            has_timestamps: true,
            ..dataset::Format::default()
        };
        let sink = File::create(&template, NonZeroUsize::new(2).unwrap(), format, Resolution::Millis).unwrap();
        let schema = schema();
        for i in 0..5 {
            sink.send(i, &trade(&schema, 1.0, 10 * i)).await.unwrap();
        }
        sink.close().await.unwrap();
        assert!(matches!(sink.send(5, &trade(&schema, 1.0, 0)).await, Err(Error::Closed)));

        let first = std::fs::read_to_string(partition::path_for(&template, 0)).unwrap();
        let second = std::fs::read_to_string(partition::path_for(&template, 1)).unwrap();
        assert_eq!(first.lines().count(), 3);
        assert_eq!(second.lines().count(), 2);
        assert_eq!(second.lines().next(), Some("type:Trade,10,1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn file_sink_takes_concurrent_writers() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("out-%NNN%.csv").display().to_string();
        let sink = Arc::new(
            File::create(&template, NonZeroUsize::new(4).unwrap(), dataset::Format::default(), Resolution::Millis)
                .unwrap(),
        );
        let schema = schema();
        let mut tasks = tokio::task::JoinSet::new();
        for worker in 0..4u64 {
            let sink = Arc::clone(&sink);
            let schema = Arc::clone(&schema);
            tasks.spawn(async move {
                for k in 0..250u64 {
                    sink.send(worker + 4 * k, &trade(&schema, 1.0, k)).await.unwrap();
                }
            });
        }
        while let Some(res) = tasks.join_next().await {
            res.unwrap();
        }
        sink.close().await.unwrap();
        for partition in 0..4 {
            let contents = std::fs::read_to_string(partition::path_for(&template, partition)).unwrap();
            assert_eq!(contents.lines().count(), 250);
        }
    }

    #[tokio::test]
    async fn file_sink_output_replays_text_with_separators() {
        let schema = Arc::new(
            Schema::new(vec![
                EventType::new("Note", vec![Attribute::new("body", Datatype::Text)]).unwrap(),
            ])
            .unwrap(),
        );
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("notes.csv").display().to_string();
        let format = dataset::Format {
            has_types: true,
            ..dataset::Format::default()
        };
        let sink = File::create(&template, NonZeroUsize::MIN, format.clone(), Resolution::Millis).unwrap();
        let event = Event::new(
            Arc::clone(schema.get("Note").unwrap()),
            vec![Value::Text("one, two\nthree".into())],
        );
        sink.send(0, &event).await.unwrap();
        sink.close().await.unwrap();

        let records: Vec<_> = dataset::Reader::open(std::path::Path::new(&template), format, schema)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event, event);
    }
}
