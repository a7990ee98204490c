//! Optimistic application of move plans, their rollback, and the per-move
//! operation log that serializes gestures and recognises echoes.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    time::{Duration, Instant},
};

use shared::{
    domain::{BoardId, CardId, EntityKind, ListId, TargetIndex},
    protocol::{Card, List},
};
use tracing::debug;

use crate::{
    collection::{Insertion, Relocation, Slot},
    model::{BoardDirectory, BoardModel},
    planner::{EntityRef, MovePlan},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MoveTicket(pub u64);

impl fmt::Display for MoveTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveStatus {
    /// Waiting behind an in-flight move of the same entity.
    Queued,
    /// Applied locally, request sent.
    Pending,
    Confirmed,
    Failed,
}

/// What is needed to take an optimistic move back.
#[derive(Debug, Clone, PartialEq)]
pub enum UndoRecord {
    Cards {
        card: CardId,
        origin: Slot<ListId>,
        before: Vec<(ListId, Vec<CardId>)>,
        after: Vec<(ListId, Vec<CardId>)>,
    },
    /// The card left the open board.
    DetachedCard { card: Card, origin: Slot<ListId> },
    Lists {
        list: ListId,
        origin: usize,
        before: Vec<ListId>,
        after: Vec<ListId>,
    },
    /// The list (and its cards) left the open board.
    DetachedList {
        list: List,
        origin: usize,
        cards: Vec<Card>,
    },
    Boards {
        board: BoardId,
        origin: usize,
        before: Vec<BoardId>,
        after: Vec<BoardId>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Changed(UndoRecord),
    /// Already in place.
    Unchanged,
    /// The entity is gone locally.
    Stale,
}

/// Applies a plan to the local state as one transaction.
pub fn apply_plan(
    plan: &MovePlan,
    model: Option<&mut BoardModel>,
    directory: &mut BoardDirectory,
) -> Applied {
    match *plan {
        MovePlan::Card {
            card, to, index, ..
        } => match model {
            Some(model) => apply_card(model, card, to, index),
            None => Applied::Stale,
        },
        MovePlan::List {
            list, to, index, ..
        } => match model {
            Some(model) => apply_list(model, list, to, index),
            None => Applied::Stale,
        },
        MovePlan::Board { board, index } => {
            let before = directory.ids();
            match directory.move_within(board, index.resolve(usize::MAX)) {
                Some((from, to)) if from != to => Applied::Changed(UndoRecord::Boards {
                    board,
                    origin: from,
                    before,
                    after: directory.ids(),
                }),
                Some(_) => Applied::Unchanged,
                None => Applied::Stale,
            }
        }
    }
}

fn apply_card(model: &mut BoardModel, card: CardId, to: ListId, index: TargetIndex) -> Applied {
    // The source is wherever the card is now; a queued plan may be older
    // than the last move of its card.
    let Some(origin) = model.cards().slot_of(card) else {
        return Applied::Stale;
    };
    if !model.cards().is_loaded(to) {
        return match model.cards_mut().remove(card) {
            Some((origin, card)) => Applied::Changed(UndoRecord::DetachedCard { card, origin }),
            None => Applied::Stale,
        };
    }

    let touched: Vec<ListId> = if origin.parent == to {
        vec![to]
    } else {
        vec![origin.parent, to]
    };
    let before = touched.iter().map(|id| (*id, model.card_ids(*id))).collect();
    match model
        .cards_mut()
        .move_across(origin.parent, to, card, index.resolve(usize::MAX))
    {
        Relocation::Moved { .. } => Applied::Changed(UndoRecord::Cards {
            card,
            origin,
            before,
            after: touched.iter().map(|id| (*id, model.card_ids(*id))).collect(),
        }),
        Relocation::Unchanged(_) => Applied::Unchanged,
        Relocation::Stale | Relocation::UnknownParent(_) => Applied::Stale,
    }
}

fn apply_list(model: &mut BoardModel, list: ListId, to: BoardId, index: TargetIndex) -> Applied {
    if to != model.board_id() {
        return match model.remove_list(list) {
            Some((origin, list, cards)) => Applied::Changed(UndoRecord::DetachedList {
                list,
                origin,
                cards,
            }),
            None => Applied::Stale,
        };
    }
    let before = model.list_ids();
    match model.lists_mut().move_within(list, index.resolve(usize::MAX)) {
        Some((from, to)) if from != to => Applied::Changed(UndoRecord::Lists {
            list,
            origin: from,
            before,
            after: model.list_ids(),
        }),
        Some(_) => Applied::Unchanged,
        None => Applied::Stale,
    }
}

/// Takes an optimistic move back. Restores the pre-move order when the
/// affected collections are exactly as the move left them; otherwise moves
/// the entity back to its origin so concurrent changes survive. Returns
/// whether anything changed.
pub fn revert(undo: UndoRecord, model: Option<&mut BoardModel>, directory: &mut BoardDirectory) -> bool {
    match undo {
        UndoRecord::Boards {
            board,
            origin,
            before,
            after,
        } => {
            if directory.ids() == after {
                directory.reorder(&before);
                true
            } else {
                matches!(directory.move_within(board, origin), Some((from, to)) if from != to)
            }
        }
        undo => match model {
            Some(model) => revert_in_board(undo, model),
            None => false,
        },
    }
}

fn revert_in_board(undo: UndoRecord, model: &mut BoardModel) -> bool {
    match undo {
        UndoRecord::Cards {
            card,
            origin,
            before,
            after,
        } => {
            let untouched = after
                .iter()
                .all(|(list_id, ids)| model.card_ids(*list_id) == *ids);
            if untouched {
                for (list_id, ids) in &before {
                    model.restore_card_order(*list_id, ids);
                }
                return true;
            }
            match model.list_of_card(card) {
                Some(current) => model
                    .cards_mut()
                    .move_across(current, origin.parent, card, origin.index)
                    .changed(),
                None => false,
            }
        }
        UndoRecord::DetachedCard { card, origin } => matches!(
            model.cards_mut().insert_at(origin.parent, card, origin.index),
            Insertion::Inserted(_)
        ),
        UndoRecord::Lists {
            list,
            origin,
            before,
            after,
        } => {
            if model.list_ids() == after {
                model.restore_list_order(&before);
                true
            } else {
                matches!(model.lists_mut().move_within(list, origin), Some((from, to)) if from != to)
            }
        }
        UndoRecord::DetachedList {
            list,
            origin,
            cards,
        } => {
            let list_id = list.id;
            if !model.insert_list(list, origin) {
                return false;
            }
            model.cards_mut().replace_parent(list_id, cards);
            true
        }
        UndoRecord::Boards { .. } => false,
    }
}

#[derive(Debug, Clone)]
pub struct MoveEntry {
    pub ticket: MoveTicket,
    pub plan: MovePlan,
    pub epoch: u64,
    pub status: MoveStatus,
    pub undo: Option<UndoRecord>,
    /// Fresh data was installed while the move was in flight, so the local
    /// order may not match the service once it settles.
    pub overtaken: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Nothing else is in flight for the entity; apply and send now.
    Ready(MoveTicket),
    Queued(MoveTicket),
}

#[derive(Debug, Clone)]
struct ExpectedEcho {
    ticket: MoveTicket,
    entity: EntityRef,
    parent: Option<i64>,
    index: TargetIndex,
    expires_at: Option<Instant>,
    /// Confirmed before a snapshot was requested; that snapshot includes it.
    covered: bool,
    /// Already reflected by installed data; matching events are only consumed.
    absorbed: bool,
}

/// A move event recognised as the echo of an own move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoMatch {
    pub ticket: MoveTicket,
    /// Whether the event's position must still be applied. The echo carries
    /// the position the service settled on, which differs from the
    /// optimistic one when another move on the same collection ran first.
    pub apply: bool,
}

/// A finished move plus the next move of the same entity, now ready.
#[derive(Debug)]
pub struct Resolution {
    pub entry: MoveEntry,
    pub next: Option<MoveTicket>,
}

/// Tagged log of moves that are queued or in flight.
#[derive(Debug)]
pub struct MoveLog {
    next_ticket: u64,
    entries: HashMap<MoveTicket, MoveEntry>,
    active: HashMap<EntityRef, MoveTicket>,
    waiting: HashMap<EntityRef, VecDeque<MoveTicket>>,
    echoes: Vec<ExpectedEcho>,
    echo_ttl: Duration,
}

impl MoveLog {
    pub fn new(echo_ttl: Duration) -> Self {
        Self {
            next_ticket: 1,
            entries: HashMap::new(),
            active: HashMap::new(),
            waiting: HashMap::new(),
            echoes: Vec::new(),
            echo_ttl,
        }
    }

    pub fn admit(&mut self, plan: MovePlan, epoch: u64) -> Admission {
        let ticket = MoveTicket(self.next_ticket);
        self.next_ticket += 1;
        let entity = plan.entity();
        self.entries.insert(
            ticket,
            MoveEntry {
                ticket,
                plan,
                epoch,
                status: MoveStatus::Queued,
                undo: None,
                overtaken: false,
            },
        );
        if self.active.contains_key(&entity) {
            self.waiting.entry(entity).or_default().push_back(ticket);
            Admission::Queued(ticket)
        } else {
            self.active.insert(entity, ticket);
            Admission::Ready(ticket)
        }
    }

    pub fn entry(&self, ticket: MoveTicket) -> Option<&MoveEntry> {
        self.entries.get(&ticket)
    }

    /// Records the optimistic apply and the request going out; from here on
    /// a matching move event is this move's echo.
    pub fn dispatched(&mut self, ticket: MoveTicket, undo: Option<UndoRecord>) {
        let Some(entry) = self.entries.get_mut(&ticket) else {
            return;
        };
        entry.status = MoveStatus::Pending;
        entry.undo = undo;
        self.echoes.push(ExpectedEcho {
            ticket,
            entity: entry.plan.entity(),
            parent: entry.plan.target_parent(),
            index: entry.plan.index(),
            expires_at: None,
            covered: false,
            absorbed: false,
        });
    }

    /// Replaces the undo record after fresh data was installed under the
    /// move and marks it overtaken.
    pub fn rebased(&mut self, ticket: MoveTicket, undo: Option<UndoRecord>) {
        if let Some(entry) = self.entries.get_mut(&ticket) {
            entry.undo = undo;
            entry.overtaken = true;
        }
    }

    /// Drops a ready move that turned out stale before it was sent. Returns
    /// the next move of the same entity, if any.
    pub fn abandon(&mut self, ticket: MoveTicket) -> Option<MoveTicket> {
        let entry = self.entries.remove(&ticket)?;
        self.release(entry.plan.entity(), ticket)
    }

    /// Settles an in-flight move.
    pub fn resolve(&mut self, ticket: MoveTicket, succeeded: bool, now: Instant) -> Option<Resolution> {
        self.expire(now);
        let mut entry = self.entries.remove(&ticket)?;
        if succeeded {
            entry.status = MoveStatus::Confirmed;
            let expires_at = now + self.echo_ttl;
            for echo in self.echoes.iter_mut().filter(|echo| echo.ticket == ticket) {
                echo.expires_at = Some(expires_at);
            }
        } else {
            entry.status = MoveStatus::Failed;
            self.echoes.retain(|echo| echo.ticket != ticket);
        }
        let next = self.release(entry.plan.entity(), ticket);
        Some(Resolution { entry, next })
    }

    fn release(&mut self, entity: EntityRef, ticket: MoveTicket) -> Option<MoveTicket> {
        if self.active.get(&entity) != Some(&ticket) {
            return None;
        }
        self.active.remove(&entity);
        let queue = self.waiting.get_mut(&entity)?;
        let next = queue.pop_front();
        if queue.is_empty() {
            self.waiting.remove(&entity);
        }
        if let Some(next) = next {
            self.active.insert(entity, next);
        }
        next
    }

    /// Consumes the expected echo of an own move, if the event is one.
    pub fn match_echo(
        &mut self,
        entity: EntityRef,
        parent: Option<i64>,
        index: TargetIndex,
        now: Instant,
    ) -> Option<EchoMatch> {
        self.expire(now);
        let position = self
            .echoes
            .iter()
            .position(|echo| echo.entity == entity && echo.parent == parent && echo.index == index)?;
        let echo = self.echoes.remove(position);
        // A later own move of the same entity is in flight; its echo settles
        // the final position.
        let superseded = self
            .active
            .get(&entity)
            .is_some_and(|active| *active != echo.ticket);
        Some(EchoMatch {
            ticket: echo.ticket,
            apply: !echo.absorbed && !superseded,
        })
    }

    /// A snapshot of the board (or of the directory) was requested. Moves
    /// already confirmed are part of whatever it returns.
    pub fn snapshot_requested(&mut self, board_scoped: bool) {
        for echo in self.echoes.iter_mut() {
            if echo.expires_at.is_some() && is_board_scoped(echo.entity) == board_scoped {
                echo.covered = true;
            }
        }
    }

    /// The requested snapshot was installed; echoes it covers must not be
    /// applied again when they arrive.
    pub fn snapshot_installed(&mut self, board_scoped: bool) {
        for echo in self.echoes.iter_mut() {
            if echo.covered && is_board_scoped(echo.entity) == board_scoped {
                echo.absorbed = true;
            }
        }
    }

    pub fn in_flight(&self, entity: EntityRef) -> bool {
        self.active.contains_key(&entity)
    }

    pub fn has_board_scoped_in_flight(&self) -> bool {
        self.entries.values().any(|entry| entry.plan.is_board_scoped())
    }

    /// Board-scoped moves that are applied locally and awaiting the service,
    /// oldest first.
    pub fn pending_board_scoped(&self) -> Vec<MoveTicket> {
        let mut tickets: Vec<MoveTicket> = self
            .entries
            .values()
            .filter(|entry| entry.status == MoveStatus::Pending && entry.plan.is_board_scoped())
            .map(|entry| entry.ticket)
            .collect();
        tickets.sort();
        tickets
    }

    /// Same as [`Self::pending_board_scoped`] for board-directory moves.
    pub fn pending_directory(&self) -> Vec<MoveTicket> {
        let mut tickets: Vec<MoveTicket> = self
            .entries
            .values()
            .filter(|entry| entry.status == MoveStatus::Pending && !entry.plan.is_board_scoped())
            .map(|entry| entry.ticket)
            .collect();
        tickets.sort();
        tickets
    }

    /// Forgets every move scoped to the board that was open. Their requests
    /// keep running; completions for them are no longer recognised.
    pub fn supersede_board_scoped(&mut self) -> usize {
        let stale: Vec<MoveTicket> = self
            .entries
            .values()
            .filter(|entry| entry.plan.is_board_scoped())
            .map(|entry| entry.ticket)
            .collect();
        for ticket in &stale {
            self.entries.remove(ticket);
        }
        self.active.retain(|_, ticket| !stale.contains(ticket));
        self.waiting.retain(|entity, _| entity.kind == EntityKind::Board);
        self.echoes.retain(|echo| echo.entity.kind == EntityKind::Board);
        if !stale.is_empty() {
            debug!(count = stale.len(), "superseded board-scoped moves");
        }
        stale.len()
    }

    fn expire(&mut self, now: Instant) {
        self.echoes
            .retain(|echo| echo.expires_at.map_or(true, |deadline| deadline > now));
    }
}

fn is_board_scoped(entity: EntityRef) -> bool {
    entity.kind != EntityKind::Board
}

#[cfg(test)]
#[path = "tests/optimistic_tests.rs"]
mod tests;
