use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(BoardId);
id_newtype!(ListId);
id_newtype!(CardId);
id_newtype!(CommentId);

/// The three orderable entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Board,
    List,
    Card,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Board => "board",
            Self::List => "list",
            Self::Card => "card",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire value for "end of the target collection".
///
/// The server clamps it against the collection length at the moment it applies
/// the move, so a command issued while the target is still changing still lands
/// at the end.
pub const END_OF_COLLECTION: i64 = 1 << 30;

/// Where a moved entity should land among its new siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetIndex {
    At(usize),
    End,
}

impl TargetIndex {
    pub fn from_wire(value: i64) -> Self {
        if value >= END_OF_COLLECTION {
            Self::End
        } else {
            Self::At(value.max(0) as usize)
        }
    }

    pub fn to_wire(self) -> i64 {
        match self {
            Self::At(index) => (index as i64).min(END_OF_COLLECTION - 1),
            Self::End => END_OF_COLLECTION,
        }
    }

    /// Resolves against the collection length at apply time.
    pub fn resolve(self, len: usize) -> usize {
        match self {
            Self::At(index) => index.min(len),
            Self::End => len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_sentinel_round_trips_through_wire_value() {
        assert_eq!(TargetIndex::End.to_wire(), 1_073_741_824);
        assert_eq!(TargetIndex::from_wire(END_OF_COLLECTION), TargetIndex::End);
        assert_eq!(TargetIndex::from_wire(END_OF_COLLECTION + 5), TargetIndex::End);
    }

    #[test]
    fn negative_wire_index_clamps_to_front() {
        assert_eq!(TargetIndex::from_wire(-3), TargetIndex::At(0));
    }

    #[test]
    fn resolve_clamps_to_current_length() {
        assert_eq!(TargetIndex::At(9).resolve(4), 4);
        assert_eq!(TargetIndex::At(2).resolve(4), 2);
        assert_eq!(TargetIndex::End.resolve(4), 4);
        assert_eq!(TargetIndex::End.resolve(0), 0);
    }
}
