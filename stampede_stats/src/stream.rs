//! Stream identity.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
/// Direction of a stream relative to the system under test.
pub enum Direction {
    /// Events flowing into the system under test.
    Input,
    /// Results flowing out of the system under test.
    Output,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// A named, directional, logical channel. Two streams with the same name and
/// different directions are distinct.
pub struct Stream {
    /// Stream name
    pub name: String,
    /// Stream direction
    pub direction: Direction,
}

impl Stream {
    /// An input stream called `name`.
    #[must_use]
    pub fn input(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: Direction::Input,
        }
    }

    /// An output stream called `name`.
    #[must_use]
    pub fn output(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: Direction::Output,
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = match self.direction {
            Direction::Input => "in",
            Direction::Output => "out",
        };
        write!(f, "{}:{}", dir, self.name)
    }
}

#[cfg(test)]
mod test {
    use rustc_hash::FxHashSet;

    use super::Stream;

    #[test]
    fn direction_is_part_of_identity() {
        let mut set = FxHashSet::default();
        set.insert(Stream::input("trades"));
        set.insert(Stream::output("trades"));
        set.insert(Stream::output("trades"));
        assert_eq!(set.len(), 2);
        assert_ne!(Stream::input("trades"), Stream::output("trades"));
        assert_eq!(Stream::output("trades").to_string(), "out:trades");
    }
}
