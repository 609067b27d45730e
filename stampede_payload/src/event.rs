//! Event schema and event values.
//!
//! An [`EventType`] is immutable once validated and shared by reference, via
//! [`Arc`], across every [`Event`] of that kind.

use std::{fmt, sync::Arc};

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::distribution;

/// Errors produced by [`EventType`] and [`Value`].
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// An attribute's distribution is invalid.
    #[error("Attribute {attribute} of {event_type}: {source}")]
    Distribution {
        /// Event type name.
        event_type: String,
        /// Attribute name.
        attribute: String,
        /// Underlying parameter error.
        #[source]
        source: distribution::Error,
    },
    /// Two attributes of one type share a name.
    #[error("Duplicate attribute {attribute} in event type {event_type}")]
    DuplicateAttribute {
        /// Event type name.
        event_type: String,
        /// Attribute name.
        attribute: String,
    },
    /// Event type names must not be empty.
    #[error("Event type name must not be empty")]
    EmptyName,
    /// Two event types in one schema share a name.
    #[error("Duplicate event type {0}")]
    DuplicateType(String),
    /// A textual field could not be read as the declared datatype.
    #[error("Cannot parse {input:?} as {datatype}")]
    Parse {
        /// Declared datatype.
        datatype: Datatype,
        /// Field text.
        input: String,
    },
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Hash, Clone, Copy)]
#[serde(rename_all = "snake_case")]
/// Declared datatype of an [`Attribute`].
pub enum Datatype {
    /// 32 bit signed integer
    Int,
    /// 64 bit signed integer
    Long,
    /// 32 bit float
    Float,
    /// 64 bit float
    Double,
    /// true or false
    Boolean,
    /// UTF-8 text
    Text,
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Datatype::Int => "int",
            Datatype::Long => "long",
            Datatype::Float => "float",
            Datatype::Double => "double",
            Datatype::Boolean => "boolean",
            Datatype::Text => "text",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(untagged)]
/// A single attribute value.
pub enum Value {
    /// See [`Datatype::Int`]
    Int(i32),
    /// See [`Datatype::Long`]
    Long(i64),
    /// See [`Datatype::Float`]
    Float(f32),
    /// See [`Datatype::Double`]
    Double(f64),
    /// See [`Datatype::Boolean`]
    Boolean(bool),
    /// See [`Datatype::Text`]
    Text(String),
}

impl Value {
    /// The zero value of `datatype`, used for attributes without a
    /// distribution.
    #[must_use]
    pub fn zero(datatype: Datatype) -> Self {
        match datatype {
            Datatype::Int => Value::Int(0),
            Datatype::Long => Value::Long(0),
            Datatype::Float => Value::Float(0.0),
            Datatype::Double => Value::Double(0.0),
            Datatype::Boolean => Value::Boolean(false),
            Datatype::Text => Value::Text(String::new()),
        }
    }

    /// Convert a sampled `f64` into a value of `datatype`. Integers round to
    /// nearest and saturate at the type bounds, booleans are true at or above
    /// one half.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_sample(datatype: Datatype, sample: f64) -> Self {
        match datatype {
            Datatype::Int => Value::Int(sample.round() as i32),
            Datatype::Long => Value::Long(sample.round() as i64),
            Datatype::Float => Value::Float(sample as f32),
            Datatype::Double => Value::Double(sample),
            Datatype::Boolean => Value::Boolean(sample >= 0.5),
            Datatype::Text => Value::Text(sample.to_string()),
        }
    }

    /// Read `input` as a value of `datatype`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] if `input` is not a legal `datatype` literal.
    pub fn parse(datatype: Datatype, input: &str) -> Result<Self, Error> {
        let trimmed = input.trim();
        let err = || Error::Parse {
            datatype,
            input: input.to_string(),
        };
        let value = match datatype {
            Datatype::Int => Value::Int(trimmed.parse().map_err(|_| err())?),
            Datatype::Long => Value::Long(trimmed.parse().map_err(|_| err())?),
            Datatype::Float => Value::Float(trimmed.parse().map_err(|_| err())?),
            Datatype::Double => Value::Double(trimmed.parse().map_err(|_| err())?),
            Datatype::Boolean => Value::Boolean(trimmed.parse().map_err(|_| err())?),
            Datatype::Text => Value::Text(input.to_string()),
        };
        Ok(value)
    }

    /// The datatype of this value.
    #[must_use]
    pub fn datatype(&self) -> Datatype {
        match self {
            Value::Int(_) => Datatype::Int,
            Value::Long(_) => Datatype::Long,
            Value::Float(_) => Datatype::Float,
            Value::Double(_) => Datatype::Double,
            Value::Boolean(_) => Datatype::Boolean,
            Value::Text(_) => Datatype::Text,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Text(v) => f.write_str(v),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
/// A named, typed attribute of an [`EventType`].
pub struct Attribute {
    /// Attribute name
    pub name: String,
    /// Declared datatype
    pub datatype: Datatype,
    /// Source of synthetic values. Attributes without one are left at
    /// [`Value::zero`].
    #[serde(default)]
    pub distribution: Option<distribution::Config>,
}

impl Attribute {
    /// Construct an attribute without a distribution.
    #[must_use]
    pub fn new(name: impl Into<String>, datatype: Datatype) -> Self {
        Self {
            name: name.into(),
            datatype,
            distribution: None,
        }
    }

    /// Attach a value distribution to this attribute.
    #[must_use]
    pub fn with_distribution(mut self, distribution: distribution::Config) -> Self {
        self.distribution = Some(distribution);
        self
    }
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
/// The schema of one kind of event.
pub struct EventType {
    /// Type name
    pub name: String,
    /// Ordered attributes; [`Event::values`] are positional over these.
    #[serde(default)]
    pub attributes: Vec<Attribute>,
}

impl EventType {
    /// Construct and validate a new [`EventType`].
    ///
    /// # Errors
    ///
    /// See [`EventType::validate`].
    pub fn new(name: impl Into<String>, attributes: Vec<Attribute>) -> Result<Self, Error> {
        let event_type = Self {
            name: name.into(),
            attributes,
        };
        event_type.validate()?;
        Ok(event_type)
    }

    /// A text-only type for records of unknown type with `fields` values. The
    /// name is derived from the field count, `TypeN`.
    #[must_use]
    pub fn text(fields: usize) -> Self {
        Self {
            name: format!("Type{fields}"),
            attributes: (0..fields)
                .map(|i| Attribute::new(format!("attr{i}"), Datatype::Text))
                .collect(),
        }
    }

    /// Check the type: name non-empty, attribute names unique, every
    /// distribution valid.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first violation found.
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::EmptyName);
        }
        let mut seen = FxHashSet::default();
        for attribute in &self.attributes {
            if !seen.insert(attribute.name.as_str()) {
                return Err(Error::DuplicateAttribute {
                    event_type: self.name.clone(),
                    attribute: attribute.name.clone(),
                });
            }
            if let Some(distribution) = attribute.distribution {
                distribution
                    .validate()
                    .map_err(|source| Error::Distribution {
                        event_type: self.name.clone(),
                        attribute: attribute.name.clone(),
                        source,
                    })?;
            }
        }
        Ok(())
    }

    /// Parse positional `fields` against this type's attributes. Missing
    /// trailing fields take their zero value, extra fields are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] if a field does not match its datatype.
    pub fn parse_values(&self, fields: &[&str]) -> Result<Vec<Value>, Error> {
        self.attributes
            .iter()
            .enumerate()
            .map(|(i, attribute)| match fields.get(i) {
                Some(field) => Value::parse(attribute.datatype, field),
                None => Ok(Value::zero(attribute.datatype)),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
/// The set of event types known to a run, addressable by name.
pub struct Schema {
    types: Vec<Arc<EventType>>,
    by_name: FxHashMap<String, Arc<EventType>>,
}

impl Schema {
    /// Validate `types` and index them by name.
    ///
    /// # Errors
    ///
    /// Returns an error if any type fails [`EventType::validate`] or two types
    /// share a name.
    pub fn new(types: Vec<EventType>) -> Result<Self, Error> {
        let mut schema = Self::default();
        for kind in types {
            kind.validate()?;
            let kind = Arc::new(kind);
            if schema
                .by_name
                .insert(kind.name.clone(), Arc::clone(&kind))
                .is_some()
            {
                return Err(Error::DuplicateType(kind.name.clone()));
            }
            schema.types.push(kind);
        }
        Ok(schema)
    }

    /// Look up a type by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<EventType>> {
        self.by_name.get(name)
    }

    /// All types in declaration order.
    #[must_use]
    pub fn types(&self) -> &[Arc<EventType>] {
        &self.types
    }
}

#[derive(Debug, Clone, PartialEq)]
/// A typed tuple: the event's type, positional values and a timestamp.
pub struct Event {
    /// The schema of this event.
    pub kind: Arc<EventType>,
    /// Values, positional over `kind.attributes`.
    pub values: Vec<Value>,
    /// Emission timestamp, in the resolution configured for the run. Zero
    /// until stamped.
    pub timestamp: u64,
}

impl Event {
    /// Construct a new, unstamped, [`Event`].
    #[must_use]
    pub fn new(kind: Arc<EventType>, values: Vec<Value>) -> Self {
        Self {
            kind,
            values,
            timestamp: 0,
        }
    }

    /// The name of this event's type.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.kind.name
    }
}
