//! Applies decoded change events to the local model.
//!
//! Each event is either patched in incrementally or routed to a resync of
//! the scope it affects. While a scope is resyncing, events touching it are
//! buffered and replayed in arrival order once the fresh data is installed.

use std::{collections::HashMap, time::Instant};

use shared::domain::{BoardId, ListId, TargetIndex};
use tracing::debug;

use crate::{
    collection::{Insertion, Relocation},
    events::{CardPatch, ChangeEvent},
    model::{BoardDirectory, BoardModel},
    optimistic::{MoveLog, MoveTicket},
    planner::EntityRef,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResyncScope {
    /// Lists and cards of the open board.
    Board,
    /// The cards of one list.
    ListCards(ListId),
}

/// Outcome of offering one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The open board's model changed.
    Applied,
    DirectoryChanged,
    /// Echo of an own move that left the model as it was.
    Confirmed(MoveTicket),
    Ignored,
    /// Held until a pending resync lands.
    Buffered,
    /// A fetch for this scope must be issued.
    Resync(ResyncScope),
    /// The board directory should be refetched.
    RefreshDirectory,
    /// Conflicts with an own in-flight move; the board is resynced once
    /// own moves settle.
    Deferred,
}

#[derive(Debug, Default)]
enum ScopeState {
    #[default]
    Live,
    Resyncing {
        buffer: Vec<(u64, ChangeEvent)>,
        refetch: bool,
    },
}

/// Borrowed session state an event is applied against.
pub struct ReconcileCtx<'a> {
    pub open_board: BoardId,
    pub model: Option<&'a mut BoardModel>,
    pub directory: &'a mut BoardDirectory,
    pub log: &'a mut MoveLog,
    pub now: Instant,
}

/// What to do once a scope's fetch has landed.
#[derive(Debug, PartialEq)]
pub enum Finished {
    /// Another gap was detected while fetching; fetch again and keep
    /// buffering.
    Refetch,
    /// Replay these events, in order, against the installed data.
    Replay(Vec<ChangeEvent>),
}

#[derive(Debug, Default)]
pub struct Reconciler {
    board: ScopeState,
    lists: HashMap<ListId, ScopeState>,
    seq: u64,
    deferred: bool,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops all scope state, e.g. when another board is opened.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_resyncing(&self, scope: ResyncScope) -> bool {
        match scope {
            ResyncScope::Board => matches!(self.board, ScopeState::Resyncing { .. }),
            ResyncScope::ListCards(list_id) => self.lists.contains_key(&list_id),
        }
    }

    /// Marks a scope as resyncing. Returns `true` when a fetch has to be
    /// issued, `false` when one already covers it.
    pub fn begin(&mut self, scope: ResyncScope) -> bool {
        match scope {
            ResyncScope::Board => match &mut self.board {
                ScopeState::Resyncing { refetch, .. } => {
                    *refetch = true;
                    false
                }
                ScopeState::Live => {
                    // A board fetch covers every list; pending list fetches
                    // hand their buffers over and are ignored when they land.
                    let mut buffer: Vec<(u64, ChangeEvent)> = self
                        .lists
                        .drain()
                        .flat_map(|(_, state)| match state {
                            ScopeState::Resyncing { buffer, .. } => buffer,
                            ScopeState::Live => Vec::new(),
                        })
                        .collect();
                    buffer.sort_by_key(|(seq, _)| *seq);
                    self.board = ScopeState::Resyncing {
                        buffer,
                        refetch: false,
                    };
                    true
                }
            },
            ResyncScope::ListCards(list_id) => {
                if self.is_resyncing(ResyncScope::Board) {
                    return false;
                }
                match self.lists.get_mut(&list_id) {
                    Some(ScopeState::Resyncing { refetch, .. }) => {
                        *refetch = true;
                        false
                    }
                    _ => {
                        self.lists.insert(
                            list_id,
                            ScopeState::Resyncing {
                                buffer: Vec::new(),
                                refetch: false,
                            },
                        );
                        true
                    }
                }
            }
        }
    }

    /// Ends a resync. `installed` tells whether fresh data was installed;
    /// after a failed fetch the buffer is replayed against the stale model.
    /// Returns `None` when the scope was not resyncing (a superseded fetch).
    pub fn finish(&mut self, scope: ResyncScope, installed: bool) -> Option<Finished> {
        let state = match scope {
            ResyncScope::Board => &mut self.board,
            ResyncScope::ListCards(list_id) => self.lists.get_mut(&list_id)?,
        };
        if let ScopeState::Resyncing { refetch, .. } = state {
            if installed && *refetch {
                *refetch = false;
                return Some(Finished::Refetch);
            }
        }
        let previous = std::mem::take(state);
        if let ResyncScope::ListCards(list_id) = scope {
            self.lists.remove(&list_id);
        }
        match previous {
            ScopeState::Resyncing { buffer, .. } => Some(Finished::Replay(
                buffer.into_iter().map(|(_, event)| event).collect(),
            )),
            ScopeState::Live => None,
        }
    }

    /// Asks for a board resync once own moves have settled.
    pub fn defer_resync(&mut self) {
        self.deferred = true;
    }

    /// Whether a conflicting event was seen and own moves have now settled.
    pub fn take_deferred(&mut self, own_moves_in_flight: bool) -> bool {
        if self.deferred && !own_moves_in_flight {
            self.deferred = false;
            return true;
        }
        false
    }

    /// Offers one event: buffers it if its scope is resyncing, applies it
    /// otherwise.
    pub fn offer(&mut self, event: ChangeEvent, ctx: &mut ReconcileCtx<'_>) -> Step {
        if let ChangeEvent::BoardMoved { board_id, index } = event {
            return apply_directory_move(ctx, board_id, index);
        }
        if event.board_id() != ctx.open_board {
            debug!(event = event.name(), board_id = event.board_id().0, "event for another board ignored");
            return Step::Ignored;
        }

        self.seq += 1;
        let seq = self.seq;
        if let ScopeState::Resyncing { buffer, .. } = &mut self.board {
            buffer.push((seq, event));
            return Step::Buffered;
        }
        if !self.lists.is_empty() {
            let resyncing = touched_lists(&event, ctx.model.as_deref())
                .into_iter()
                .find(|list_id| self.lists.contains_key(list_id));
            if let Some(list_id) = resyncing {
                if let Some(ScopeState::Resyncing { buffer, .. }) = self.lists.get_mut(&list_id) {
                    buffer.push((seq, event));
                    return Step::Buffered;
                }
            }
        }

        match self.apply(event, ctx) {
            Step::Resync(scope) => {
                if self.begin(scope) {
                    Step::Resync(scope)
                } else {
                    Step::Ignored
                }
            }
            step => step,
        }
    }

    /// Replays events after a resync landed.
    pub fn replay(&mut self, events: Vec<ChangeEvent>, ctx: &mut ReconcileCtx<'_>) -> Vec<Step> {
        events
            .into_iter()
            .map(|event| self.offer(event, ctx))
            .collect()
    }

    fn apply(&mut self, event: ChangeEvent, ctx: &mut ReconcileCtx<'_>) -> Step {
        let Some(model) = ctx.model.as_deref_mut() else {
            return Step::Resync(ResyncScope::Board);
        };

        match event {
            ChangeEvent::ListCreated { list, .. } => {
                if model.insert_list(list, usize::MAX) {
                    Step::Applied
                } else {
                    Step::Ignored
                }
            }
            ChangeEvent::CardCreated { card, .. } => {
                let list_id = card.list_id;
                match model.cards_mut().insert_at(list_id, card, usize::MAX) {
                    Insertion::Inserted(_) => Step::Applied,
                    Insertion::AlreadyPresent(_) => Step::Ignored,
                    Insertion::UnknownParent(_) => Step::Resync(ResyncScope::Board),
                }
            }
            ChangeEvent::ListUpdated { .. } | ChangeEvent::BoardUpdated { .. } => {
                Step::Resync(ResyncScope::Board)
            }
            ChangeEvent::CardUpdated {
                card_id,
                patch: Some(CardPatch::Assignee(assignee)),
                ..
            } => match model.cards_mut().find_mut(card_id) {
                Some(card) if card.assignee_id == assignee => Step::Ignored,
                Some(card) => {
                    card.assignee_id = assignee;
                    Step::Applied
                }
                None => Step::Resync(ResyncScope::Board),
            },
            ChangeEvent::CardUpdated {
                card_id,
                patch: None,
                ..
            } => match model.list_of_card(card_id) {
                Some(list_id) => Step::Resync(ResyncScope::ListCards(list_id)),
                None => Step::Resync(ResyncScope::Board),
            },
            ChangeEvent::CommentCreated {
                card_id, list_id, ..
            } => {
                let owner = model
                    .list_of_card(card_id)
                    .or(list_id.filter(|id| model.cards().is_loaded(*id)));
                match owner {
                    Some(list_id) => Step::Resync(ResyncScope::ListCards(list_id)),
                    None => Step::Ignored,
                }
            }
            ChangeEvent::ListMoved {
                board_id,
                list_id,
                index,
            } => {
                let entity = EntityRef::list(list_id);
                let echo = match own_move(ctx.log, &mut self.deferred, entity, Some(board_id.0), index, ctx.now) {
                    Ok(echo) => echo,
                    Err(step) => return step,
                };
                let Some(index) = index else {
                    return Step::Resync(ResyncScope::Board);
                };
                let step = match model.lists_mut().move_within(list_id, index.resolve(usize::MAX)) {
                    Some((from, to)) if from != to => Step::Applied,
                    Some(_) => Step::Ignored,
                    // Arrived from another board; only a snapshot carries it.
                    None => Step::Resync(ResyncScope::Board),
                };
                confirmed(step, echo)
            }
            ChangeEvent::CardMoved {
                card_id,
                target_list,
                index,
                ..
            } => {
                let entity = EntityRef::card(card_id);
                let echo = match own_move(
                    ctx.log,
                    &mut self.deferred,
                    entity,
                    target_list.map(|id| id.0),
                    index,
                    ctx.now,
                ) {
                    Ok(echo) => echo,
                    Err(step) => return step,
                };
                let (Some(target), Some(index)) = (target_list, index) else {
                    return Step::Resync(ResyncScope::Board);
                };
                let source = model.list_of_card(card_id);
                let step = match source {
                    Some(source) => match model.cards_mut().move_across(
                        source,
                        target,
                        card_id,
                        index.resolve(usize::MAX),
                    ) {
                        Relocation::Moved { .. } => Step::Applied,
                        Relocation::Unchanged(_) => Step::Ignored,
                        Relocation::Stale | Relocation::UnknownParent(_) => {
                            Step::Resync(ResyncScope::Board)
                        }
                    },
                    None if model.cards().is_loaded(target) => {
                        Step::Resync(ResyncScope::ListCards(target))
                    }
                    None => Step::Resync(ResyncScope::Board),
                };
                confirmed(step, echo)
            }
            ChangeEvent::ListDeleted { list_id, .. } => match model.remove_list(list_id) {
                Some(_) => Step::Applied,
                None => Step::Ignored,
            },
            ChangeEvent::CardDeleted { card_id, .. } => match model.cards_mut().remove(card_id) {
                Some(_) => Step::Applied,
                None => Step::Ignored,
            },
            ChangeEvent::BoardMoved { .. } => Step::Ignored,
        }
    }
}

/// Recognises echoes of own moves and moves that race one. `Ok` means the
/// event is applied, carrying the ticket when it echoes an own move; `Err`
/// is the final step when it must not be.
fn own_move(
    log: &mut MoveLog,
    deferred: &mut bool,
    entity: EntityRef,
    parent: Option<i64>,
    index: Option<TargetIndex>,
    now: Instant,
) -> Result<Option<MoveTicket>, Step> {
    if let Some(echo) = index.and_then(|index| log.match_echo(entity, parent, index, now)) {
        debug!(ticket = %echo.ticket, apply = echo.apply, "move echo matched");
        return if echo.apply {
            Ok(Some(echo.ticket))
        } else {
            Err(Step::Confirmed(echo.ticket))
        };
    }
    if log.in_flight(entity) {
        debug!(kind = %entity.kind, id = entity.id, "move event races an own move; deferring resync");
        *deferred = true;
        return Err(Step::Deferred);
    }
    Ok(None)
}

/// An echo that found everything in place is a plain confirmation.
fn confirmed(step: Step, echo: Option<MoveTicket>) -> Step {
    match (step, echo) {
        (Step::Ignored, Some(ticket)) => Step::Confirmed(ticket),
        (step, _) => step,
    }
}

fn apply_directory_move(ctx: &mut ReconcileCtx<'_>, board_id: BoardId, index: Option<TargetIndex>) -> Step {
    let entity = EntityRef::board(board_id);
    let Some(index) = index else {
        return Step::RefreshDirectory;
    };
    let echo = ctx.log.match_echo(entity, None, index, ctx.now);
    match echo {
        Some(echo) if !echo.apply => {
            debug!(ticket = %echo.ticket, "board move echo confirmed");
            return Step::Confirmed(echo.ticket);
        }
        Some(_) => {}
        None if ctx.log.in_flight(entity) => return Step::RefreshDirectory,
        None => {}
    }
    let step = match ctx.directory.move_within(board_id, index.resolve(usize::MAX)) {
        Some((from, to)) if from != to => Step::DirectoryChanged,
        Some(_) => Step::Ignored,
        None => Step::RefreshDirectory,
    };
    confirmed(step, echo.map(|echo| echo.ticket))
}

/// Lists whose contents an event reads or changes.
fn touched_lists(event: &ChangeEvent, model: Option<&BoardModel>) -> Vec<ListId> {
    let parent_of = |card_id| model.and_then(|model| model.list_of_card(card_id));
    match event {
        ChangeEvent::ListCreated { list, .. } => vec![list.id],
        ChangeEvent::CardCreated { card, .. } => vec![card.list_id],
        ChangeEvent::ListUpdated { list_id, .. }
        | ChangeEvent::ListMoved { list_id, .. }
        | ChangeEvent::ListDeleted { list_id, .. } => vec![*list_id],
        ChangeEvent::CardUpdated { card_id, .. } | ChangeEvent::CardDeleted { card_id, .. } => {
            parent_of(*card_id).into_iter().collect()
        }
        ChangeEvent::CardMoved {
            card_id,
            target_list,
            ..
        } => parent_of(*card_id).into_iter().chain(*target_list).collect(),
        ChangeEvent::CommentCreated {
            card_id, list_id, ..
        } => parent_of(*card_id).into_iter().chain(*list_id).collect(),
        ChangeEvent::BoardMoved { .. } | ChangeEvent::BoardUpdated { .. } => Vec::new(),
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
