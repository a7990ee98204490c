//! The board session: which board is open, its model, and every reaction to
//! gestures, push messages and network completions.
//!
//! The session is synchronous. It never performs I/O itself; instead it
//! queues [`Effect`]s that the engine executes, and network results come back
//! in through the `on_*` methods tagged with the epoch they were issued in.

use std::time::{Duration, Instant};

use shared::{
    domain::{BoardId, CardId, ListId, TargetIndex},
    protocol::{Board, BoardSnapshot, Card},
};
use tracing::{debug, info, warn};

use crate::{
    error::TransportError,
    events::ChangeEvent,
    model::{directory_from, BoardDirectory, BoardModel, SessionView},
    optimistic::{apply_plan, revert, Admission, Applied, MoveLog, MoveTicket, Resolution},
    planner::{
        plan_board_move, plan_card_to_list, plan_drag, plan_list_to_board, DragGesture, EntityRef,
        MovePlan, MoveRequest, PlanError,
    },
    reconciler::{Finished, ReconcileCtx, Reconciler, ResyncScope, Step},
    subscriber::{SubscriberMessage, SubscriptionState},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeCause {
    Opened,
    Optimistic,
    Reconciled,
    Resync,
    Rollback,
    Closed,
}

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The view changed. `board_id` is `None` for directory-only changes.
    Changed {
        board_id: Option<BoardId>,
        cause: ChangeCause,
    },
    MoveConfirmed {
        ticket: MoveTicket,
        entity: EntityRef,
    },
    MoveFailed {
        ticket: MoveTicket,
        entity: EntityRef,
        message: String,
    },
    SubscriptionChanged {
        board_id: BoardId,
        state: SubscriptionState,
    },
    PossiblyStale {
        board_id: BoardId,
        stale: bool,
    },
    Notice(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchScope {
    Board(BoardId),
    ListCards(ListId),
    Directory,
}

#[derive(Debug, Clone)]
pub enum Fetched {
    Board(BoardSnapshot),
    ListCards(Vec<Card>),
    Directory(Vec<Board>),
}

/// Work the engine performs on the session's behalf.
#[derive(Debug, Clone)]
pub enum Effect {
    Subscribe { board_id: BoardId, epoch: u64 },
    Unsubscribe,
    SendMove { ticket: MoveTicket, request: MoveRequest },
    Fetch { epoch: u64, scope: FetchScope },
    Notify(SessionEvent),
}

#[derive(Debug)]
struct OpenBoard {
    board_id: BoardId,
    model: Option<BoardModel>,
    subscription: SubscriptionState,
    snapshot_requested: bool,
    possibly_stale: bool,
}

#[derive(Debug)]
pub struct BoardSession {
    epoch: u64,
    open: Option<OpenBoard>,
    directory: BoardDirectory,
    log: MoveLog,
    reconciler: Reconciler,
    outbox: Vec<Effect>,
}

impl BoardSession {
    pub fn new(echo_ttl: Duration) -> Self {
        Self {
            epoch: 0,
            open: None,
            directory: BoardDirectory::new(),
            log: MoveLog::new(echo_ttl),
            reconciler: Reconciler::new(),
            outbox: Vec::new(),
        }
    }

    /// Loads the board directory.
    pub fn start(&mut self) {
        self.fetch(FetchScope::Directory);
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn open_board_id(&self) -> Option<BoardId> {
        self.open.as_ref().map(|open| open.board_id)
    }

    pub fn subscription_state(&self) -> Option<SubscriptionState> {
        self.open.as_ref().map(|open| open.subscription)
    }

    pub fn model(&self) -> Option<&BoardModel> {
        self.open.as_ref().and_then(|open| open.model.as_ref())
    }

    pub fn directory(&self) -> &BoardDirectory {
        &self.directory
    }

    pub fn drain_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.outbox)
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            open_board: self.open_board_id(),
            board: self.model().map(BoardModel::view),
            directory: self.directory.as_slice().to_vec(),
            loading: self.open.as_ref().is_some_and(|open| {
                open.model.is_none() || self.reconciler.is_resyncing(ResyncScope::Board)
            }),
            possibly_stale: self.open.as_ref().is_some_and(|open| open.possibly_stale),
        }
    }

    /// Switches to `board_id`: drops the old subscription and everything
    /// scoped to the old board, then subscribes. The snapshot is fetched once
    /// the subscription is up, so no event falls between the two.
    pub fn open_board(&mut self, board_id: BoardId) {
        self.leave_board();
        self.epoch += 1;
        self.reconciler.begin(ResyncScope::Board);
        self.open = Some(OpenBoard {
            board_id,
            model: None,
            subscription: SubscriptionState::Closed,
            snapshot_requested: false,
            possibly_stale: false,
        });
        info!(board_id = board_id.0, epoch = self.epoch, "opening board");
        self.outbox.push(Effect::Subscribe {
            board_id,
            epoch: self.epoch,
        });
        self.changed(Some(board_id), ChangeCause::Opened);
    }

    pub fn close_board(&mut self) {
        let Some(board_id) = self.open_board_id() else {
            return;
        };
        self.leave_board();
        self.epoch += 1;
        info!(board_id = board_id.0, "board closed");
        self.changed(Some(board_id), ChangeCause::Closed);
    }

    fn leave_board(&mut self) {
        if self.open.take().is_some() {
            self.outbox.push(Effect::Unsubscribe);
            self.log.supersede_board_scoped();
        }
        self.reconciler.reset();
    }

    /// Full resync of the open board, or a directory reload when none is
    /// open.
    pub fn refresh(&mut self) {
        if self.open.is_some() {
            self.begin_resync(ResyncScope::Board);
        } else {
            self.fetch(FetchScope::Directory);
        }
    }

    pub fn drag(&mut self, gesture: &DragGesture) -> Option<MoveTicket> {
        let plan = plan_drag(self.model(), &self.directory, gesture);
        self.submit(plan)
    }

    pub fn move_card_to(
        &mut self,
        card: CardId,
        list: ListId,
        index: TargetIndex,
    ) -> Option<MoveTicket> {
        let plan = plan_card_to_list(self.model(), card, list, index);
        self.submit(plan)
    }

    pub fn move_list_to_board(&mut self, list: ListId, board: BoardId) -> Option<MoveTicket> {
        let plan = plan_list_to_board(self.model(), list, board);
        self.submit(plan)
    }

    pub fn move_board(&mut self, board: BoardId, index: TargetIndex) -> Option<MoveTicket> {
        let plan = plan_board_move(&self.directory, board, index);
        self.submit(plan)
    }

    fn submit(&mut self, plan: Result<MovePlan, PlanError>) -> Option<MoveTicket> {
        let plan = match plan {
            Ok(plan) => plan,
            Err(PlanError::Stale(entity)) => {
                debug!(kind = %entity.kind, id = entity.id, "gesture on vanished entity ignored");
                return None;
            }
            Err(err) => {
                self.notify(SessionEvent::Notice(format!("move not possible: {err}")));
                return None;
            }
        };
        let epoch = if plan.is_board_scoped() { self.epoch } else { 0 };
        match self.log.admit(plan, epoch) {
            Admission::Ready(ticket) => {
                self.launch(ticket);
                Some(ticket)
            }
            Admission::Queued(ticket) => {
                debug!(%ticket, "move queued behind in-flight move of the same entity");
                Some(ticket)
            }
        }
    }

    /// Applies a ready move optimistically and sends it. A move whose entity
    /// vanished meanwhile is dropped and the next one in line goes instead.
    fn launch(&mut self, ticket: MoveTicket) {
        let mut next = Some(ticket);
        while let Some(ticket) = next.take() {
            let Some(plan) = self.log.entry(ticket).map(|entry| entry.plan) else {
                break;
            };
            let model = self.open.as_mut().and_then(|open| open.model.as_mut());
            match apply_plan(&plan, model, &mut self.directory) {
                Applied::Stale => {
                    debug!(%ticket, "move target vanished before dispatch");
                    next = self.log.abandon(ticket);
                }
                applied => {
                    let undo = match applied {
                        Applied::Changed(undo) => Some(undo),
                        _ => None,
                    };
                    let changed = undo.is_some();
                    self.log.dispatched(ticket, undo);
                    self.outbox.push(Effect::SendMove {
                        ticket,
                        request: plan.request(),
                    });
                    if changed {
                        let board_id = plan.is_board_scoped().then(|| self.open_board_id()).flatten();
                        self.changed(board_id, ChangeCause::Optimistic);
                    }
                }
            }
        }
    }

    pub fn on_move_finished(&mut self, ticket: MoveTicket, result: Result<(), TransportError>, now: Instant) {
        let Some(Resolution { entry, next }) = self.log.resolve(ticket, result.is_ok(), now) else {
            debug!(%ticket, "completion of superseded move discarded");
            return;
        };
        match result {
            Ok(()) => {
                debug!(%ticket, "move confirmed");
                self.notify(SessionEvent::MoveConfirmed {
                    ticket,
                    entity: entry.plan.entity(),
                });
            }
            Err(err) => {
                if let Some(undo) = entry.undo {
                    let model = self.open.as_mut().and_then(|open| open.model.as_mut());
                    if revert(undo, model, &mut self.directory) {
                        let board_id = entry
                            .plan
                            .is_board_scoped()
                            .then(|| self.open_board_id())
                            .flatten();
                        self.changed(board_id, ChangeCause::Rollback);
                    }
                }
                if err.is_stale_reference() {
                    debug!(%ticket, "move referred to a deleted entity: {err}");
                } else {
                    warn!(%ticket, "move rejected: {err}");
                    self.notify(SessionEvent::MoveFailed {
                        ticket,
                        entity: entry.plan.entity(),
                        message: err.to_string(),
                    });
                }
            }
        }
        if entry.overtaken {
            // Fresh data landed under the move; only another fetch shows
            // where the service put everything.
            if entry.plan.is_board_scoped() {
                self.reconciler.defer_resync();
            } else {
                self.fetch(FetchScope::Directory);
            }
        }
        if let Some(next) = next {
            self.launch(next);
        }
        if self.open.is_some()
            && self
                .reconciler
                .take_deferred(self.log.has_board_scoped_in_flight())
        {
            info!("resyncing board after conflicting concurrent move");
            self.begin_resync(ResyncScope::Board);
        }
    }

    pub fn on_subscriber(&mut self, epoch: u64, message: SubscriberMessage, now: Instant) {
        if epoch != self.epoch {
            debug!(epoch, current = self.epoch, "message from superseded subscription dropped");
            return;
        }
        let Some(open) = self.open.as_mut() else {
            return;
        };
        let board_id = open.board_id;
        match message {
            SubscriberMessage::State { state, resumed } => {
                open.subscription = state;
                let first_snapshot = !open.snapshot_requested;
                self.notify(SessionEvent::SubscriptionChanged { board_id, state });
                match state {
                    SubscriptionState::Open if first_snapshot => self.request_first_snapshot(),
                    SubscriptionState::Open => {
                        // No resume tokens: anything may have been missed.
                        info!(board_id = board_id.0, resumed, "resyncing after (re)connect");
                        self.begin_resync(ResyncScope::Board);
                    }
                    SubscriptionState::Closed if first_snapshot => self.request_first_snapshot(),
                    SubscriptionState::Closed | SubscriptionState::Connecting => {}
                }
            }
            SubscriberMessage::Event(event) => self.reconcile(event, now),
            SubscriberMessage::PossiblyStale(stale) => self.set_possibly_stale(stale),
        }
    }

    fn request_first_snapshot(&mut self) {
        let Some(open) = self.open.as_mut() else {
            return;
        };
        open.snapshot_requested = true;
        let board_id = open.board_id;
        self.fetch(FetchScope::Board(board_id));
    }

    fn reconcile(&mut self, event: ChangeEvent, now: Instant) {
        let Some(open) = self.open.as_mut() else {
            return;
        };
        let mut ctx = ReconcileCtx {
            open_board: open.board_id,
            model: open.model.as_mut(),
            directory: &mut self.directory,
            log: &mut self.log,
            now,
        };
        let step = self.reconciler.offer(event, &mut ctx);
        self.after_steps(vec![step]);
    }

    fn after_steps(&mut self, steps: Vec<Step>) {
        let mut board_changed = false;
        let mut directory_changed = false;
        for step in steps {
            match step {
                Step::Applied => board_changed = true,
                Step::DirectoryChanged => directory_changed = true,
                Step::Resync(scope) => self.fetch_scope(scope),
                Step::RefreshDirectory => self.fetch(FetchScope::Directory),
                Step::Confirmed(_)
                | Step::Ignored
                | Step::Buffered
                | Step::Deferred => {}
            }
        }
        if board_changed {
            self.changed(self.open_board_id(), ChangeCause::Reconciled);
        }
        if directory_changed {
            self.changed(None, ChangeCause::Reconciled);
        }
    }

    fn begin_resync(&mut self, scope: ResyncScope) {
        if self.reconciler.begin(scope) {
            self.fetch_scope(scope);
        }
    }

    /// Issues the fetches of a scope the reconciler has marked resyncing.
    fn fetch_scope(&mut self, scope: ResyncScope) {
        match scope {
            ResyncScope::Board => {
                if let Some(board_id) = self.open_board_id() {
                    self.fetch(FetchScope::Board(board_id));
                    self.fetch(FetchScope::Directory);
                }
            }
            ResyncScope::ListCards(list_id) => self.fetch(FetchScope::ListCards(list_id)),
        }
    }

    pub fn on_fetch_finished(
        &mut self,
        epoch: u64,
        scope: FetchScope,
        result: Result<Fetched, TransportError>,
        now: Instant,
    ) {
        let resync_scope = match scope {
            FetchScope::Directory => {
                self.install_directory(result);
                return;
            }
            FetchScope::Board(board_id) => {
                if epoch != self.epoch || self.open_board_id() != Some(board_id) {
                    debug!(board_id = board_id.0, epoch, "superseded board snapshot discarded");
                    return;
                }
                ResyncScope::Board
            }
            FetchScope::ListCards(list_id) => {
                if epoch != self.epoch {
                    debug!(list_id = list_id.0, epoch, "superseded list fetch discarded");
                    return;
                }
                ResyncScope::ListCards(list_id)
            }
        };
        if !self.reconciler.is_resyncing(resync_scope) {
            debug!(?resync_scope, "fetch no longer needed");
            return;
        }
        let Some(open) = self.open.as_mut() else {
            return;
        };

        let outcome = match (resync_scope, result) {
            (ResyncScope::Board, Ok(Fetched::Board(snapshot))) => {
                open.model = Some(BoardModel::from_snapshot(snapshot));
                Ok(())
            }
            (ResyncScope::ListCards(list_id), Ok(Fetched::ListCards(cards))) => {
                if let Some(model) = open.model.as_mut() {
                    model.replace_list_cards(list_id, cards);
                }
                Ok(())
            }
            (_, Ok(_)) => Err("fetch answered with data for another scope".to_string()),
            (_, Err(err)) => Err(err.to_string()),
        };
        let installed = outcome.is_ok();
        if installed {
            if resync_scope == ResyncScope::Board {
                self.log.snapshot_installed(true);
            }
            self.rebase_pending_moves(resync_scope);
        }

        match self.reconciler.finish(resync_scope, installed) {
            Some(Finished::Refetch) => self.fetch_scope(resync_scope),
            Some(Finished::Replay(events)) if !installed && self.model().is_none() => {
                debug!(count = events.len(), "nothing to replay onto; next snapshot covers buffered events");
            }
            Some(Finished::Replay(events)) => {
                let steps = match self.open.as_mut() {
                    Some(open) => {
                        let mut ctx = ReconcileCtx {
                            open_board: open.board_id,
                            model: open.model.as_mut(),
                            directory: &mut self.directory,
                            log: &mut self.log,
                            now,
                        };
                        self.reconciler.replay(events, &mut ctx)
                    }
                    None => Vec::new(),
                };
                self.after_steps(steps);
            }
            None => {}
        }

        match outcome {
            Ok(()) => {
                if resync_scope == ResyncScope::Board {
                    self.set_possibly_stale(false);
                }
                self.changed(self.open_board_id(), ChangeCause::Resync);
            }
            Err(message) => {
                warn!(?resync_scope, "resync failed: {message}");
                self.set_possibly_stale(true);
                self.notify(SessionEvent::Notice(format!("could not refresh board: {message}")));
            }
        }
    }

    fn install_directory(&mut self, result: Result<Fetched, TransportError>) {
        match result {
            Ok(Fetched::Directory(boards)) => {
                self.directory = directory_from(boards);
                self.log.snapshot_installed(false);
                for ticket in self.log.pending_directory() {
                    self.rebase(ticket);
                }
                self.changed(None, ChangeCause::Resync);
            }
            Ok(_) => warn!("directory fetch answered with board data"),
            Err(err) => {
                warn!("board directory fetch failed: {err}");
                self.notify(SessionEvent::Notice(format!("could not load boards: {err}")));
            }
        }
    }

    /// Re-applies own in-flight moves that the installed data touches, so
    /// the view keeps showing them until they settle. The data may already
    /// include them and later moves too, so each one is followed by a board
    /// resync once it settles.
    fn rebase_pending_moves(&mut self, scope: ResyncScope) {
        for ticket in self.log.pending_board_scoped() {
            let touched = match scope {
                ResyncScope::Board => true,
                ResyncScope::ListCards(list_id) => self
                    .log
                    .entry(ticket)
                    .is_some_and(|entry| entry.plan.touches_list(list_id)),
            };
            if touched {
                self.rebase(ticket);
            }
        }
    }

    fn rebase(&mut self, ticket: MoveTicket) {
        let Some(plan) = self.log.entry(ticket).map(|entry| entry.plan) else {
            return;
        };
        let model = self.open.as_mut().and_then(|open| open.model.as_mut());
        let undo = match apply_plan(&plan, model, &mut self.directory) {
            Applied::Changed(undo) => {
                debug!(%ticket, "pending move re-applied on fresh data");
                Some(undo)
            }
            Applied::Unchanged | Applied::Stale => None,
        };
        self.log.rebased(ticket, undo);
    }

    fn set_possibly_stale(&mut self, stale: bool) {
        let Some(open) = self.open.as_mut() else {
            return;
        };
        if open.possibly_stale == stale {
            return;
        }
        open.possibly_stale = stale;
        let board_id = open.board_id;
        self.notify(SessionEvent::PossiblyStale { board_id, stale });
    }

    fn fetch(&mut self, scope: FetchScope) {
        match scope {
            FetchScope::Board(_) => self.log.snapshot_requested(true),
            FetchScope::Directory => self.log.snapshot_requested(false),
            FetchScope::ListCards(_) => {}
        }
        self.outbox.push(Effect::Fetch {
            epoch: self.epoch,
            scope,
        });
    }

    fn changed(&mut self, board_id: Option<BoardId>, cause: ChangeCause) {
        self.notify(SessionEvent::Changed { board_id, cause });
    }

    fn notify(&mut self, event: SessionEvent) {
        self.outbox.push(Effect::Notify(event));
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
