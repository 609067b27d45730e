//! Recorded event datasets.
//!
//! A dataset is a line oriented text file, one record per line. Fields are
//! split on a configurable separator. When the [`Format`] carries types a
//! record begins with a `type:<Name>` marker, when it carries timestamps the
//! next field is the record timestamp. Remaining fields are attribute values,
//! positional over the named type. Records of an unknown type, or without a
//! marker, are read as text into a type synthesized from the field count.
//!
//! A backslash escapes the separator, itself and line breaks (`\n`, `\r`)
//! inside a field. A backslash before any other character is kept as written.
//!
//! [`Replay`] reads a dataset back for a single worker, loops it the
//! configured number of times and assigns every record its offset from the
//! start of replay.

use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    num::NonZeroU32,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, PrimitiveDateTime, format_description::OwnedFormatItem};
use tracing::{debug, info};

use crate::event::{self, Event, EventType, Schema};

pub(crate) const TYPE_MARKER: &str = "type:";
const ESCAPE: char = '\\';
/// Minimum spacing inserted between the last record of one loop and the first
/// record of the next.
const MIN_LOOP_GAP: Duration = Duration::from_millis(1);

/// Errors produced by [`Reader`] and [`Replay`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The dataset could not be opened or read.
    #[error("Dataset {path}: {source}")]
    Io {
        /// Dataset path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// A record's values do not match its declared type.
    #[error("Line {line}: {source}")]
    Record {
        /// One-based line number.
        line: u64,
        /// Underlying parse error.
        #[source]
        source: event::Error,
    },
    /// A record's timestamp field could not be read.
    #[error("Line {line}: cannot parse timestamp {input:?}")]
    Timestamp {
        /// One-based line number.
        line: u64,
        /// Field text.
        input: String,
    },
    /// A line has no timestamp field although the format requires one.
    #[error("Line {line}: missing timestamp field")]
    MissingTimestamp {
        /// One-based line number.
        line: u64,
    },
    /// The configured date-time format is not a legal format description.
    #[error("Invalid date-time format {format:?}: {source}")]
    DateTimeFormat {
        /// The configured format.
        format: String,
        /// Underlying error.
        #[source]
        source: time::error::InvalidFormatDescription,
    },
    /// A replay pass produced no records before every loop completed.
    #[error("Dataset {path} exhausted after {completed} of {loops} loops")]
    Exhausted {
        /// Dataset path.
        path: PathBuf,
        /// Loops completed in full.
        completed: u32,
        /// Loops requested.
        loops: u32,
    },
    /// A timestamp could not be written in the configured format.
    #[error("Cannot format timestamp: {0}")]
    Format(#[from] time::error::Format),
    /// The separator collides with the escape syntax.
    #[error("Separator {0:?} must not be a backslash, a line break or alphanumeric")]
    Separator(char),
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Default)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
/// Unit of a record's timestamp field.
pub enum TimestampUnit {
    /// Milliseconds, integral or fractional.
    #[default]
    Milliseconds,
    /// Seconds, integral or fractional.
    Seconds,
    /// A calendar date-time in the given `time` format description, UTC unless
    /// the format carries an offset.
    DateTime {
        /// Format description, for example
        /// `[year]-[month]-[day] [hour]:[minute]:[second]`.
        format: String,
    },
}

fn default_separator() -> char {
    ','
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
/// Layout of a dataset's records.
pub struct Format {
    /// Field separator.
    #[serde(default = "default_separator")]
    pub separator: char,
    /// Records begin with a `type:<Name>` marker.
    #[serde(default)]
    pub has_types: bool,
    /// Records carry a timestamp field, after the type marker if any.
    #[serde(default)]
    pub has_timestamps: bool,
    /// Unit of the timestamp field.
    #[serde(default)]
    pub timestamp_unit: TimestampUnit,
}

impl Default for Format {
    fn default() -> Self {
        Self {
            separator: default_separator(),
            has_types: false,
            has_timestamps: false,
            timestamp_unit: TimestampUnit::default(),
        }
    }
}

impl Format {
    /// Check that the separator can be escaped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Separator`] for a backslash, a line break or an
    /// alphanumeric separator.
    pub fn validate(&self) -> Result<(), Error> {
        check_separator(self.separator)
    }

    /// Render `event` as one record, without a trailing newline. `timestamp`
    /// is written only if this format carries timestamps; a missing timestamp
    /// is written as zero.
    ///
    /// # Errors
    ///
    /// Returns an error if the date-time format is invalid or cannot render
    /// the timestamp.
    pub fn encode(&self, event: &Event, timestamp: Option<Duration>) -> Result<String, Error> {
        let mut fields = Vec::with_capacity(event.values.len() + 2);
        if self.has_types {
            fields.push(format!("{TYPE_MARKER}{}", event.type_name()));
        }
        if self.has_timestamps {
            let ts = timestamp.unwrap_or_default();
            fields.push(match &self.timestamp_unit {
                TimestampUnit::Milliseconds => ts.as_millis().to_string(),
                TimestampUnit::Seconds => ts.as_secs_f64().to_string(),
                TimestampUnit::DateTime { format } => {
                    (OffsetDateTime::UNIX_EPOCH + ts).format(&parse_format(format)?)?
                }
            });
        }
        fields.extend(event.values.iter().map(ToString::to_string));
        Ok(join_fields(fields.iter().map(String::as_str), self.separator))
    }
}

fn check_separator(separator: char) -> Result<(), Error> {
    if separator == ESCAPE || separator == '\n' || separator == '\r' || separator.is_alphanumeric() {
        return Err(Error::Separator(separator));
    }
    Ok(())
}

/// Join `fields` with `separator`, escaping each so that [`split_fields`]
/// returns them unchanged.
pub(crate) fn join_fields<'a>(fields: impl IntoIterator<Item = &'a str>, separator: char) -> String {
    let mut line = String::new();
    for (idx, field) in fields.into_iter().enumerate() {
        if idx > 0 {
            line.push(separator);
        }
        for c in field.chars() {
            match c {
                '\n' => line.push_str("\\n"),
                '\r' => line.push_str("\\r"),
                c if c == ESCAPE || c == separator => {
                    line.push(ESCAPE);
                    line.push(c);
                }
                c => line.push(c),
            }
        }
    }
    line
}

/// Split `line` on unescaped occurrences of `separator` and undo escapes.
pub(crate) fn split_fields(line: &str, separator: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        if c == separator {
            fields.push(std::mem::take(&mut field));
        } else if c == ESCAPE {
            match chars.next() {
                Some('n') => field.push('\n'),
                Some('r') => field.push('\r'),
                Some(next) if next == ESCAPE || next == separator => field.push(next),
                Some(next) => {
                    field.push(ESCAPE);
                    field.push(next);
                }
                None => field.push(ESCAPE),
            }
        } else {
            field.push(c);
        }
    }
    fields.push(field);
    fields
}

fn parse_format(format: &str) -> Result<OwnedFormatItem, Error> {
    time::format_description::parse(format)
        .map(|items| OwnedFormatItem::from(items.as_slice()))
        .map_err(|source| Error::DateTimeFormat {
            format: format.to_string(),
            source,
        })
}

#[derive(Debug, Clone, PartialEq)]
/// One parsed dataset record.
pub struct Record {
    /// The record's event, unstamped.
    pub event: Event,
    /// Timestamp field, as an offset from the Unix epoch or whatever origin
    /// the dataset uses.
    pub timestamp: Option<Duration>,
}

/// Parses records of one [`Format`] against a [`Schema`].
#[derive(Debug)]
pub struct Parser {
    format: Format,
    schema: Arc<Schema>,
    date_time: Option<OwnedFormatItem>,
    // Types synthesized for unknown records, by field count.
    synthesized: FxHashMap<usize, Arc<EventType>>,
}

impl Parser {
    /// Create a new [`Parser`].
    ///
    /// # Errors
    ///
    /// Returns an error if the format's date-time description is invalid.
    pub fn new(format: Format, schema: Arc<Schema>) -> Result<Self, Error> {
        format.validate()?;
        let date_time = match &format.timestamp_unit {
            TimestampUnit::DateTime { format } => Some(parse_format(format)?),
            _ => None,
        };
        Ok(Self {
            format,
            schema,
            date_time,
            synthesized: FxHashMap::default(),
        })
    }

    /// A parser for records without a timestamp field.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Separator`] if `separator` cannot be escaped.
    pub fn untimed(separator: char, has_types: bool, schema: Arc<Schema>) -> Result<Self, Error> {
        check_separator(separator)?;
        let mut parser = Self::fields(schema);
        parser.format.separator = separator;
        parser.format.has_types = has_types;
        Ok(parser)
    }

    /// A parser used only through [`Parser::event`], over fields split
    /// elsewhere.
    pub(crate) fn fields(schema: Arc<Schema>) -> Self {
        Self {
            format: Format::default(),
            schema,
            date_time: None,
            synthesized: FxHashMap::default(),
        }
    }

    /// Parse `line`, the `line_no`th line of its dataset. Returns `None` for a
    /// blank line.
    ///
    /// # Errors
    ///
    /// Returns an error if the timestamp or a typed value cannot be parsed.
    pub fn parse(&mut self, line: &str, line_no: u64) -> Result<Option<Record>, Error> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Ok(None);
        }
        let fields = split_fields(line, self.format.separator);
        let fields: Vec<&str> = fields.iter().map(String::as_str).collect();
        let mut rest = &fields[..];

        let mut name = None;
        if self.format.has_types
            && let Some(marker) = rest.first().and_then(|f| f.trim().strip_prefix(TYPE_MARKER))
        {
            name = Some(marker);
            rest = &rest[1..];
        }

        let mut timestamp = None;
        if self.format.has_timestamps {
            let Some(field) = rest.first() else {
                return Err(Error::MissingTimestamp { line: line_no });
            };
            timestamp = Some(self.timestamp(field, line_no)?);
            rest = &rest[1..];
        }

        Ok(Some(Record {
            event: self.event(name, rest, line_no)?,
            timestamp,
        }))
    }

    /// Build an event of type `name` from positional `fields`. An unknown or
    /// missing name yields a text type synthesized from the field count.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Record`] if a field does not match its datatype.
    pub fn event(
        &mut self,
        name: Option<&str>,
        fields: &[&str],
        line_no: u64,
    ) -> Result<Event, Error> {
        let known = name.and_then(|n| self.schema.get(n)).cloned();
        let kind = match known {
            Some(kind) => kind,
            None => Arc::clone(
                self.synthesized
                    .entry(fields.len())
                    .or_insert_with(|| Arc::new(EventType::text(fields.len()))),
            ),
        };
        let values = kind
            .parse_values(fields)
            .map_err(|source| Error::Record {
                line: line_no,
                source,
            })?;
        Ok(Event::new(kind, values))
    }

    fn timestamp(&self, field: &str, line_no: u64) -> Result<Duration, Error> {
        let field = field.trim();
        let invalid = || Error::Timestamp {
            line: line_no,
            input: field.to_string(),
        };
        match (&self.format.timestamp_unit, &self.date_time) {
            (TimestampUnit::Milliseconds, _) => {
                let ms: f64 = field.parse().map_err(|_| invalid())?;
                Duration::try_from_secs_f64(ms / 1_000.0).map_err(|_| invalid())
            }
            (TimestampUnit::Seconds, _) => {
                let secs: f64 = field.parse().map_err(|_| invalid())?;
                Duration::try_from_secs_f64(secs).map_err(|_| invalid())
            }
            (TimestampUnit::DateTime { .. }, Some(description)) => {
                let at = OffsetDateTime::parse(field, description)
                    .or_else(|_| {
                        PrimitiveDateTime::parse(field, description).map(PrimitiveDateTime::assume_utc)
                    })
                    .map_err(|_| invalid())?;
                let nanos = u64::try_from(at.unix_timestamp_nanos()).map_err(|_| invalid())?;
                Ok(Duration::from_nanos(nanos))
            }
            (TimestampUnit::DateTime { .. }, None) => Err(invalid()),
        }
    }
}

/// Iterates the records of a dataset.
#[derive(Debug)]
pub struct Reader<R> {
    lines: io::Lines<R>,
    parser: Parser,
    path: PathBuf,
    line_no: u64,
}

impl Reader<BufReader<File>> {
    /// Open the dataset at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the format is invalid.
    pub fn open(path: &Path, format: Format, schema: Arc<Schema>) -> Result<Self, Error> {
        let file = File::open(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::new(BufReader::new(file), path, format, schema)
    }
}

impl<R: BufRead> Reader<R> {
    /// Read records from `source`. `path` is used in error reports only.
    ///
    /// # Errors
    ///
    /// Returns an error if the format is invalid.
    pub fn new(source: R, path: &Path, format: Format, schema: Arc<Schema>) -> Result<Self, Error> {
        Ok(Self {
            lines: source.lines(),
            parser: Parser::new(format, schema)?,
            path: path.to_path_buf(),
            line_no: 0,
        })
    }
}

impl<R: BufRead> Iterator for Reader<R> {
    type Item = Result<Record, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(source) => {
                    return Some(Err(Error::Io {
                        path: self.path.clone(),
                        source,
                    }));
                }
            };
            self.line_no += 1;
            match self.parser.parse(&line, self.line_no) {
                Ok(Some(record)) => return Some(Ok(record)),
                Ok(None) => {}
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
/// How replayed records are placed in time.
pub enum Pacing {
    /// Offsets follow the records' own timestamps, relative to the first.
    Recorded,
    /// Records are spaced evenly at this many per second, across all workers.
    Rate(f64),
}

#[derive(Debug, Clone, PartialEq)]
/// A replayed record and when it is due.
pub struct Scheduled {
    /// Offset from the start of replay at which the record is due.
    pub at: Duration,
    /// Zero-based position across every loop, counting records of all
    /// workers.
    pub index: u64,
    /// The event to emit.
    pub event: Event,
}

/// Replays a dataset for one worker of several.
///
/// Worker `w` of `n` replays the records whose position within a pass is
/// congruent to `w` modulo `n`. Under [`Pacing::Recorded`] each loop is
/// shifted by the span of the dataset plus its mean record spacing, so
/// offsets keep increasing across loops.
#[derive(Debug)]
pub struct Replay {
    path: PathBuf,
    format: Format,
    schema: Arc<Schema>,
    loops: NonZeroU32,
    pacing: Pacing,
    worker: u32,
    workers: NonZeroU32,

    reader: Option<Reader<BufReader<File>>>,
    completed: u32,
    in_pass: u64,
    index: u64,
    first: Option<Duration>,
    last: Duration,
    loop_base: Duration,
}

impl Replay {
    /// Open a replay of `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the format is invalid.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        path: PathBuf,
        format: Format,
        schema: Arc<Schema>,
        loops: NonZeroU32,
        pacing: Pacing,
        worker: u32,
        workers: NonZeroU32,
    ) -> Result<Self, Error> {
        let reader = Reader::open(&path, format.clone(), Arc::clone(&schema))?;
        info!(path = %path.display(), loops = loops.get(), worker, "dataset replay opened");
        Ok(Self {
            path,
            format,
            schema,
            loops,
            pacing,
            worker,
            workers,
            reader: Some(reader),
            completed: 0,
            in_pass: 0,
            index: 0,
            first: None,
            last: Duration::ZERO,
            loop_base: Duration::ZERO,
        })
    }

    /// The next record due for this worker, `None` once every loop has
    /// completed.
    ///
    /// # Errors
    ///
    /// Returns an error if a record cannot be read, or [`Error::Exhausted`] if
    /// a pass yields no records.
    pub fn next_record(&mut self) -> Result<Option<Scheduled>, Error> {
        loop {
            if self.completed >= self.loops.get() {
                return Ok(None);
            }
            let mut reader = match self.reader.take() {
                Some(reader) => reader,
                None => Reader::open(&self.path, self.format.clone(), Arc::clone(&self.schema))?,
            };
            match reader.next() {
                Some(record) => {
                    self.reader = Some(reader);
                    let record = record?;
                    let position = self.in_pass;
                    let index = self.index;
                    self.in_pass += 1;
                    self.index += 1;

                    let stamp = record.timestamp.unwrap_or_default();
                    let first = *self.first.get_or_insert(stamp);
                    if self.completed == 0 {
                        self.last = self.last.max(stamp);
                    }
                    if position % u64::from(self.workers.get()) != u64::from(self.worker) {
                        continue;
                    }
                    let at = match self.pacing {
                        Pacing::Recorded => self.loop_base + stamp.saturating_sub(first),
                        Pacing::Rate(rate) => Duration::from_secs_f64(index as f64 / rate),
                    };
                    return Ok(Some(Scheduled {
                        at,
                        index,
                        event: record.event,
                    }));
                }
                None => self.end_pass()?,
            }
        }
    }

    fn end_pass(&mut self) -> Result<(), Error> {
        if self.in_pass == 0 {
            return Err(Error::Exhausted {
                path: self.path.clone(),
                completed: self.completed,
                loops: self.loops.get(),
            });
        }
        let span = self.last.saturating_sub(self.first.unwrap_or_default());
        let gap = if self.in_pass > 1 {
            span.checked_div(u32::try_from(self.in_pass - 1).unwrap_or(u32::MAX))
                .unwrap_or_default()
        } else {
            Duration::ZERO
        };
        self.loop_base += span + gap.max(MIN_LOOP_GAP);
        self.completed += 1;
        self.in_pass = 0;
        debug!(path = %self.path.display(), completed = self.completed, "replay loop complete");
        Ok(())
    }

    /// Loops completed in full so far.
    #[must_use]
    pub fn completed_loops(&self) -> u32 {
        self.completed
    }

    /// Records read so far, across all workers.
    #[must_use]
    pub fn records_read(&self) -> u64 {
        self.index
    }
}
