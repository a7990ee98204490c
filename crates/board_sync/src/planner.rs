//! Turns drag gestures and explicit move commands into discrete move plans.

use shared::{
    domain::{BoardId, CardId, EntityKind, ListId, TargetIndex},
    protocol::{MoveBoardRequest, MoveCardRequest, MoveListRequest},
};
use thiserror::Error;

use crate::model::{BoardDirectory, BoardModel};

/// Leading edge and extent of a sibling along the drag axis (top/height for
/// cards and boards, left/width for lists).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SiblingBounds {
    pub start: f64,
    pub extent: f64,
}

impl SiblingBounds {
    pub fn new(start: f64, extent: f64) -> Self {
        Self { start, extent }
    }

    pub fn midpoint(&self) -> f64 {
        self.start + self.extent / 2.0
    }
}

/// Index at which a dragged entity lands among `siblings` (in display order,
/// the dragged entity itself excluded).
///
/// The entity goes before the nearest sibling whose midpoint lies past the
/// pointer; with no such sibling it goes to the end. A pointer exactly on a
/// midpoint counts as past it.
pub fn drop_index(pointer: f64, siblings: &[SiblingBounds]) -> usize {
    let mut closest: Option<(usize, f64)> = None;
    for (index, sibling) in siblings.iter().enumerate() {
        let offset = pointer - sibling.midpoint();
        if offset < 0.0 && closest.map_or(true, |(_, best)| offset > best) {
            closest = Some((index, offset));
        }
    }
    closest.map_or(siblings.len(), |(index, _)| index)
}

/// What is being dragged and where it is hovering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DragSubject {
    Card { card: CardId, over_list: ListId },
    List { list: ListId },
    Board { board: BoardId },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DragGesture {
    pub subject: DragSubject,
    pub pointer: f64,
    pub siblings: Vec<SiblingBounds>,
}

/// A fully resolved move: entity, source parent, target parent and index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MovePlan {
    Card {
        card: CardId,
        from: ListId,
        to: ListId,
        index: TargetIndex,
    },
    List {
        list: ListId,
        from: BoardId,
        to: BoardId,
        index: TargetIndex,
    },
    Board {
        board: BoardId,
        index: TargetIndex,
    },
}

/// Identity of the moved entity, used to serialize gestures per entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: i64,
}

impl EntityRef {
    pub fn card(id: CardId) -> Self {
        Self {
            kind: EntityKind::Card,
            id: id.0,
        }
    }

    pub fn list(id: ListId) -> Self {
        Self {
            kind: EntityKind::List,
            id: id.0,
        }
    }

    pub fn board(id: BoardId) -> Self {
        Self {
            kind: EntityKind::Board,
            id: id.0,
        }
    }
}

impl MovePlan {
    pub fn entity(&self) -> EntityRef {
        match *self {
            Self::Card { card, .. } => EntityRef::card(card),
            Self::List { list, .. } => EntityRef::list(list),
            Self::Board { board, .. } => EntityRef::board(board),
        }
    }

    pub fn index(&self) -> TargetIndex {
        match *self {
            Self::Card { index, .. } | Self::List { index, .. } | Self::Board { index, .. } => {
                index
            }
        }
    }

    /// Raw id of the target parent as it appears in the echoed event; boards
    /// have no parent.
    pub fn target_parent(&self) -> Option<i64> {
        match *self {
            Self::Card { to, .. } => Some(to.0),
            Self::List { to, .. } => Some(to.0),
            Self::Board { .. } => None,
        }
    }

    /// Whether the plan takes a card out of `list` or into it.
    pub fn touches_list(&self, list: ListId) -> bool {
        matches!(*self, Self::Card { from, to, .. } if from == list || to == list)
    }

    /// Whether the plan affects the open board's model rather than the
    /// directory.
    pub fn is_board_scoped(&self) -> bool {
        !matches!(self, Self::Board { .. })
    }

    pub fn request(&self) -> MoveRequest {
        match *self {
            Self::Card {
                card, to, index, ..
            } => MoveRequest::Card {
                card,
                body: MoveCardRequest {
                    target_list_id: to,
                    new_index: index.to_wire(),
                },
            },
            Self::List {
                list, to, index, ..
            } => MoveRequest::List {
                list,
                body: MoveListRequest {
                    new_index: index.to_wire(),
                    target_board_id: to,
                },
            },
            Self::Board { board, index } => MoveRequest::Board {
                board,
                body: MoveBoardRequest {
                    new_index: index.to_wire(),
                },
            },
        }
    }
}

/// The authoritative request corresponding to a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveRequest {
    Card { card: CardId, body: MoveCardRequest },
    List { list: ListId, body: MoveListRequest },
    Board { board: BoardId, body: MoveBoardRequest },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("no board is open")]
    NoBoardOpen,
    #[error("{0:?} is not present locally")]
    Stale(EntityRef),
    #[error("target {kind} {id} is not loaded")]
    UnknownTarget { kind: EntityKind, id: i64 },
}

/// Plans a drag gesture against the current local state.
pub fn plan_drag(
    model: Option<&BoardModel>,
    directory: &BoardDirectory,
    gesture: &DragGesture,
) -> Result<MovePlan, PlanError> {
    let index = TargetIndex::At(drop_index(gesture.pointer, &gesture.siblings));
    match gesture.subject {
        DragSubject::Card { card, over_list } => {
            let model = model.ok_or(PlanError::NoBoardOpen)?;
            let from = model
                .list_of_card(card)
                .ok_or(PlanError::Stale(EntityRef::card(card)))?;
            if !model.cards().is_loaded(over_list) {
                return Err(PlanError::UnknownTarget {
                    kind: EntityKind::List,
                    id: over_list.0,
                });
            }
            Ok(MovePlan::Card {
                card,
                from,
                to: over_list,
                index,
            })
        }
        DragSubject::List { list } => {
            let model = model.ok_or(PlanError::NoBoardOpen)?;
            if !model.has_list(list) {
                return Err(PlanError::Stale(EntityRef::list(list)));
            }
            Ok(MovePlan::List {
                list,
                from: model.board_id(),
                to: model.board_id(),
                index,
            })
        }
        DragSubject::Board { board } => {
            if !directory.contains(board) {
                return Err(PlanError::Stale(EntityRef::board(board)));
            }
            Ok(MovePlan::Board { board, index })
        }
    }
}

/// Plans an explicit "move card to list" command. With [`TargetIndex::End`]
/// the card lands at the end of the target list as it stands when the service
/// applies the move.
pub fn plan_card_to_list(
    model: Option<&BoardModel>,
    card: CardId,
    target: ListId,
    index: TargetIndex,
) -> Result<MovePlan, PlanError> {
    let model = model.ok_or(PlanError::NoBoardOpen)?;
    let from = model
        .list_of_card(card)
        .ok_or(PlanError::Stale(EntityRef::card(card)))?;
    Ok(MovePlan::Card {
        card,
        from,
        to: target,
        index,
    })
}

/// Plans an explicit "move list to board" command, landing at the end of the
/// target board.
pub fn plan_list_to_board(
    model: Option<&BoardModel>,
    list: ListId,
    target: BoardId,
) -> Result<MovePlan, PlanError> {
    let model = model.ok_or(PlanError::NoBoardOpen)?;
    if !model.has_list(list) {
        return Err(PlanError::Stale(EntityRef::list(list)));
    }
    Ok(MovePlan::List {
        list,
        from: model.board_id(),
        to: target,
        index: TargetIndex::End,
    })
}

pub fn plan_board_move(
    directory: &BoardDirectory,
    board: BoardId,
    index: TargetIndex,
) -> Result<MovePlan, PlanError> {
    if !directory.contains(board) {
        return Err(PlanError::Stale(EntityRef::board(board)));
    }
    Ok(MovePlan::Board { board, index })
}
