//! Conversion between [`Event`]s and wire messages.
//!
//! Every message carries the event type name, the event timestamp as an
//! unsigned integer in the run's resolution and the positional attribute
//! values. Messages naming a type absent from the [`Schema`] decode to a
//! text type synthesized from the value count.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    dataset::{self, Parser, TYPE_MARKER, join_fields, split_fields},
    event::{Event, Schema, Value},
};

/// Errors produced by a [`Converter`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Message is not valid UTF-8.
    #[error("Message is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    /// Message is missing a required field.
    #[error("Malformed message: {0}")]
    Malformed(&'static str),
    /// Timestamp field is not an unsigned integer.
    #[error("Invalid timestamp {0:?}")]
    Timestamp(String),
    /// Attribute values do not match the named type.
    #[error(transparent)]
    Dataset(#[from] dataset::Error),
    /// JSON encoding or decoding failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Converts events to and from wire messages.
pub trait Converter: std::fmt::Debug + Send + Sync {
    /// Encode `event`.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be represented.
    fn to_message(&self, event: &Event) -> Result<Vec<u8>, Error>;

    /// Decode one message.
    ///
    /// # Errors
    ///
    /// Returns an error if the message is malformed or its values do not match
    /// its type.
    fn from_message(&self, message: &[u8]) -> Result<Event, Error>;
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "snake_case")]
/// Selects a [`Converter`] implementation.
pub enum Kind {
    /// See [`Delimited`].
    #[default]
    Delimited,
    /// See [`Json`].
    Json,
}

impl Kind {
    /// Construct the converter for this kind.
    ///
    /// # Errors
    ///
    /// Returns an error if the converter cannot be built.
    pub fn build(self, schema: Arc<Schema>) -> Result<Arc<dyn Converter>, Error> {
        Ok(match self {
            Kind::Delimited => Arc::new(Delimited::new(',', schema)?),
            Kind::Json => Arc::new(Json::new(schema)),
        })
    }
}

/// One line of text: `type:<Name>`, the timestamp, then each value, joined by
/// a separator. Fields are escaped as in a dataset, so text holding the
/// separator or a line break survives the trip.
#[derive(Debug)]
pub struct Delimited {
    separator: char,
    parser: Mutex<Parser>,
}

impl Delimited {
    /// Create a new [`Delimited`] converter.
    ///
    /// # Errors
    ///
    /// Returns an error if `separator` cannot be escaped.
    pub fn new(separator: char, schema: Arc<Schema>) -> Result<Self, Error> {
        Ok(Self {
            separator,
            parser: Mutex::new(Parser::untimed(separator, true, schema)?),
        })
    }
}

impl Converter for Delimited {
    fn to_message(&self, event: &Event) -> Result<Vec<u8>, Error> {
        let head = [
            format!("{TYPE_MARKER}{}", event.type_name()),
            event.timestamp.to_string(),
        ];
        let values: Vec<String> = event.values.iter().map(ToString::to_string).collect();
        let fields = head.iter().chain(&values).map(String::as_str);
        Ok(join_fields(fields, self.separator).into_bytes())
    }

    fn from_message(&self, message: &[u8]) -> Result<Event, Error> {
        let line = std::str::from_utf8(message)?.trim_end_matches(['\r', '\n']);
        let fields = split_fields(line, self.separator);
        let mut fields = fields.iter().map(String::as_str);
        let name = fields
            .next()
            .and_then(|f| f.strip_prefix(TYPE_MARKER))
            .ok_or(Error::Malformed("type marker"))?;
        let ts = fields.next().ok_or(Error::Malformed("timestamp"))?;
        let timestamp = ts
            .trim()
            .parse()
            .map_err(|_| Error::Timestamp(ts.to_string()))?;
        let values: Vec<&str> = fields.collect();
        let mut event = self.parser.lock().event(Some(name), &values, 0)?;
        event.timestamp = timestamp;
        Ok(event)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Message<V> {
    #[serde(rename = "type")]
    kind: String,
    timestamp: u64,
    values: Vec<V>,
}

/// One JSON object per message:
/// `{"type": "<Name>", "timestamp": <u64>, "values": [...]}`.
#[derive(Debug)]
pub struct Json {
    parser: Mutex<Parser>,
}

impl Json {
    /// Create a new [`Json`] converter.
    #[must_use]
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            parser: Mutex::new(Parser::fields(schema)),
        }
    }
}

impl Converter for Json {
    fn to_message(&self, event: &Event) -> Result<Vec<u8>, Error> {
        let message = Message::<&Value> {
            kind: event.type_name().to_string(),
            timestamp: event.timestamp,
            values: event.values.iter().collect(),
        };
        Ok(serde_json::to_vec(&message)?)
    }

    fn from_message(&self, message: &[u8]) -> Result<Event, Error> {
        let message: Message<serde_json::Value> = serde_json::from_slice(message)?;
        let fields: Vec<String> = message
            .values
            .iter()
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        let fields: Vec<&str> = fields.iter().map(String::as_str).collect();
        let mut event = self
            .parser
            .lock()
            .event(Some(&message.kind), &fields, 0)?;
        event.timestamp = message.timestamp;
        Ok(event)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::{Converter, Delimited, Error, Json, Kind};
    use crate::event::{Attribute, Datatype, Event, EventType, Schema, Value};

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::new(vec![
                EventType::new(
                    "Stock",
                    vec![
                        Attribute::new("symbol", Datatype::Text),
                        Attribute::new("price", Datatype::Double),
                        Attribute::new("open", Datatype::Boolean),
                    ],
                )
                .unwrap(),
            ])
            .unwrap(),
        )
    }

    fn stock(schema: &Schema) -> Event {
        let mut event = Event::new(
            Arc::clone(schema.get("Stock").unwrap()),
            vec![
                Value::Text("ACME".into()),
                Value::Double(12.25),
                Value::Boolean(true),
            ],
        );
        event.timestamp = 1_700_000_000_123;
        event
    }

    #[test]
    fn delimited_layout() {
        let schema = schema();
        let converter = Delimited::new('|', Arc::clone(&schema)).unwrap();
        let message = converter.to_message(&stock(&schema)).unwrap();
        assert_eq!(message, b"type:Stock|1700000000123|ACME|12.25|true");
        assert_eq!(converter.from_message(&message).unwrap(), stock(&schema));
    }

    #[test]
    fn json_layout() {
        let schema = schema();
        let converter = Json::new(Arc::clone(&schema));
        let message = converter.to_message(&stock(&schema)).unwrap();
        let text = std::str::from_utf8(&message).unwrap();
        assert_eq!(
            text,
            r#"{"type":"Stock","timestamp":1700000000123,"values":["ACME",12.25,true]}"#
        );
        assert_eq!(converter.from_message(&message).unwrap(), stock(&schema));
    }

    #[test]
    fn unknown_type_decodes_as_text() {
        let converter = Kind::Delimited.build(schema()).unwrap();
        let event = converter.from_message(b"type:Trade,5,x,y").unwrap();
        assert_eq!(event.type_name(), "Type2");
        assert_eq!(event.timestamp, 5);
        assert_eq!(event.values, vec![Value::Text("x".into()), Value::Text("y".into())]);
    }

    #[test]
    fn malformed_messages_rejected() {
        let converter = Delimited::new(',', schema()).unwrap();
        assert!(matches!(
            converter.from_message(b"Stock,5,x"),
            Err(Error::Malformed("type marker"))
        ));
        assert!(matches!(
            converter.from_message(b"type:Stock,soon,x"),
            Err(Error::Timestamp(_))
        ));
        assert!(matches!(
            converter.from_message(b"type:Stock,5,ACME,pricey"),
            Err(Error::Dataset(_))
        ));
        assert!(matches!(
            Json::new(schema()).from_message(b"{}"),
            Err(Error::Json(_))
        ));
    }

    #[test]
    fn delimited_text_may_hold_the_separator() {
        let schema = Arc::new(
            Schema::new(vec![
                EventType::new(
                    "Note",
                    vec![
                        Attribute::new("body", Datatype::Text),
                        Attribute::new("tag", Datatype::Text),
                    ],
                )
                .unwrap(),
            ])
            .unwrap(),
        );
        let converter = Kind::Delimited.build(Arc::clone(&schema)).unwrap();
        for body in ["a,b", "trailing\\", "two\nlines", ",", "\\,"] {
            let event = Event::new(
                Arc::clone(schema.get("Note").unwrap()),
                vec![Value::Text(body.into()), Value::Text("t".into())],
            );
            let message = converter.to_message(&event).unwrap();
            assert!(!message.contains(&b'\n'));
            assert_eq!(converter.from_message(&message).unwrap(), event, "{body:?}");
        }
    }

    #[test]
    fn unescapable_separator_rejected() {
        for separator in ['\\', '\n', 'x', '7'] {
            assert!(matches!(
                Delimited::new(separator, schema()),
                Err(Error::Dataset(_))
            ));
        }
    }
}
