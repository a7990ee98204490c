//! Typed change events decoded from push-channel envelopes.

use serde::Deserialize;
use shared::{
    domain::{BoardId, CardId, EntityKind, ListId, TargetIndex, UserId},
    protocol::{Card, Comment, EventEnvelope, List},
};

use crate::error::DecodeError;

/// The five change kinds a notification can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Moved,
    Deleted,
    ParentUpdated,
}

/// A field-level change that can be applied without refetching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardPatch {
    Assignee(Option<UserId>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    ListCreated {
        board_id: BoardId,
        list: List,
    },
    CardCreated {
        board_id: BoardId,
        card: Card,
    },
    ListUpdated {
        board_id: BoardId,
        list_id: ListId,
    },
    CardUpdated {
        board_id: BoardId,
        card_id: CardId,
        patch: Option<CardPatch>,
    },
    ListMoved {
        board_id: BoardId,
        list_id: ListId,
        index: Option<TargetIndex>,
    },
    CardMoved {
        board_id: BoardId,
        card_id: CardId,
        target_list: Option<ListId>,
        index: Option<TargetIndex>,
    },
    BoardMoved {
        board_id: BoardId,
        index: Option<TargetIndex>,
    },
    ListDeleted {
        board_id: BoardId,
        list_id: ListId,
    },
    CardDeleted {
        board_id: BoardId,
        card_id: CardId,
    },
    BoardUpdated {
        board_id: BoardId,
    },
    CommentCreated {
        board_id: BoardId,
        card_id: CardId,
        list_id: Option<ListId>,
    },
}

impl ChangeEvent {
    pub fn board_id(&self) -> BoardId {
        match self {
            Self::ListCreated { board_id, .. }
            | Self::CardCreated { board_id, .. }
            | Self::ListUpdated { board_id, .. }
            | Self::CardUpdated { board_id, .. }
            | Self::ListMoved { board_id, .. }
            | Self::CardMoved { board_id, .. }
            | Self::BoardMoved { board_id, .. }
            | Self::ListDeleted { board_id, .. }
            | Self::CardDeleted { board_id, .. }
            | Self::BoardUpdated { board_id }
            | Self::CommentCreated { board_id, .. } => *board_id,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::ListCreated { .. } | Self::CardCreated { .. } => ChangeKind::Created,
            Self::ListUpdated { .. } | Self::CardUpdated { .. } => ChangeKind::Updated,
            Self::ListMoved { .. } | Self::CardMoved { .. } | Self::BoardMoved { .. } => {
                ChangeKind::Moved
            }
            Self::ListDeleted { .. } | Self::CardDeleted { .. } => ChangeKind::Deleted,
            Self::BoardUpdated { .. } | Self::CommentCreated { .. } => ChangeKind::ParentUpdated,
        }
    }

    /// Kind of the entity the event is about. Comments report their parent
    /// card.
    pub fn entity(&self) -> EntityKind {
        match self {
            Self::ListCreated { .. }
            | Self::ListUpdated { .. }
            | Self::ListMoved { .. }
            | Self::ListDeleted { .. } => EntityKind::List,
            Self::CardCreated { .. }
            | Self::CardUpdated { .. }
            | Self::CardMoved { .. }
            | Self::CardDeleted { .. }
            | Self::CommentCreated { .. } => EntityKind::Card,
            Self::BoardMoved { .. } | Self::BoardUpdated { .. } => EntityKind::Board,
        }
    }

    /// Wire name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ListCreated { .. } => "list.created",
            Self::CardCreated { .. } => "card.created",
            Self::ListUpdated { .. } => "list.updated",
            Self::CardUpdated { patch: None, .. } => "card.updated",
            Self::CardUpdated { patch: Some(_), .. } => "card.assignee_changed",
            Self::ListMoved { .. } => "list.moved",
            Self::CardMoved { .. } => "card.moved",
            Self::BoardMoved { .. } => "board.moved",
            Self::ListDeleted { .. } => "list.deleted",
            Self::CardDeleted { .. } => "card.deleted",
            Self::BoardUpdated { .. } => "board.updated",
            Self::CommentCreated { .. } => "comment.created",
        }
    }
}

#[derive(Deserialize)]
struct IdPayload {
    id: i64,
}

#[derive(Deserialize)]
struct MovePayload {
    id: i64,
    #[serde(default)]
    target_list_id: Option<ListId>,
    #[serde(default)]
    new_index: Option<i64>,
}

#[derive(Deserialize)]
struct AssigneePayload {
    id: CardId,
    #[serde(default)]
    assignee_id: Option<UserId>,
}

/// Decodes one `data:` frame of the board event stream.
pub fn decode_event(raw: &str) -> Result<ChangeEvent, DecodeError> {
    let envelope: EventEnvelope = serde_json::from_str(raw)?;
    from_envelope(envelope)
}

pub fn from_envelope(envelope: EventEnvelope) -> Result<ChangeEvent, DecodeError> {
    let EventEnvelope {
        kind,
        board_id,
        list_id,
        payload,
        ..
    } = envelope;

    let event = match kind.as_str() {
        "list.created" => ChangeEvent::ListCreated {
            board_id,
            list: payload_as(&kind, payload)?,
        },
        "card.created" => ChangeEvent::CardCreated {
            board_id,
            card: payload_as(&kind, payload)?,
        },
        "list.updated" => {
            let IdPayload { id } = payload_as(&kind, payload)?;
            ChangeEvent::ListUpdated {
                board_id,
                list_id: ListId(id),
            }
        }
        "card.updated" => {
            let IdPayload { id } = payload_as(&kind, payload)?;
            ChangeEvent::CardUpdated {
                board_id,
                card_id: CardId(id),
                patch: None,
            }
        }
        "card.assignee_changed" => {
            let AssigneePayload { id, assignee_id } = payload_as(&kind, payload)?;
            ChangeEvent::CardUpdated {
                board_id,
                card_id: id,
                patch: Some(CardPatch::Assignee(assignee_id)),
            }
        }
        "list.moved" => {
            let MovePayload { id, new_index, .. } = payload_as(&kind, payload)?;
            ChangeEvent::ListMoved {
                board_id,
                list_id: ListId(id),
                index: new_index.map(TargetIndex::from_wire),
            }
        }
        "card.moved" => {
            let MovePayload {
                id,
                target_list_id,
                new_index,
            } = payload_as(&kind, payload)?;
            ChangeEvent::CardMoved {
                board_id,
                card_id: CardId(id),
                target_list: target_list_id,
                index: new_index.map(TargetIndex::from_wire),
            }
        }
        "board.moved" => {
            let MovePayload { new_index, .. } = payload_as(&kind, payload)?;
            ChangeEvent::BoardMoved {
                board_id,
                index: new_index.map(TargetIndex::from_wire),
            }
        }
        "list.deleted" => {
            let IdPayload { id } = payload_as(&kind, payload)?;
            ChangeEvent::ListDeleted {
                board_id,
                list_id: ListId(id),
            }
        }
        "card.deleted" => {
            let IdPayload { id } = payload_as(&kind, payload)?;
            ChangeEvent::CardDeleted {
                board_id,
                card_id: CardId(id),
            }
        }
        "board.updated" => ChangeEvent::BoardUpdated { board_id },
        "comment.created" => {
            let comment: Comment = payload_as(&kind, payload)?;
            ChangeEvent::CommentCreated {
                board_id,
                card_id: comment.card_id,
                list_id,
            }
        }
        _ => return Err(DecodeError::UnknownType(kind)),
    };
    Ok(event)
}

fn payload_as<T: serde::de::DeserializeOwned>(
    kind: &str,
    payload: Option<serde_json::Value>,
) -> Result<T, DecodeError> {
    let value = payload.ok_or_else(|| DecodeError::MissingPayload {
        kind: kind.to_string(),
    })?;
    serde_json::from_value(value).map_err(|source| DecodeError::InvalidPayload {
        kind: kind.to_string(),
        source,
    })
}

#[cfg(test)]
#[path = "tests/events_tests.rs"]
mod tests;
