//! The sync engine task: owns the [`BoardSession`], executes its effects and
//! feeds network results back in, one input at a time.

use std::{sync::Arc, time::Instant};

use shared::domain::{BoardId, CardId, ListId, TargetIndex};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info};

use crate::{
    config::ClientSettings,
    error::{EngineClosed, TransportError},
    model::SessionView,
    optimistic::MoveTicket,
    planner::DragGesture,
    session::{BoardSession, Effect, FetchScope, Fetched, SessionEvent},
    subscriber::{spawn_subscriber, ReconnectPolicy, SubscriberMessage, Subscription},
    transport::{BoardService, PushSource},
};

const SESSION_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum Command {
    OpenBoard(BoardId),
    CloseBoard,
    Drag(DragGesture),
    MoveCardTo {
        card: CardId,
        list: ListId,
        index: TargetIndex,
    },
    MoveListToBoard {
        list: ListId,
        board: BoardId,
    },
    MoveBoard {
        board: BoardId,
        index: TargetIndex,
    },
    Refresh,
    Shutdown,
}

#[derive(Debug)]
enum EngineInput {
    Command(Command),
    Push {
        epoch: u64,
        message: SubscriberMessage,
    },
    MoveFinished {
        ticket: MoveTicket,
        result: Result<(), TransportError>,
    },
    FetchFinished {
        epoch: u64,
        scope: FetchScope,
        result: Result<Fetched, TransportError>,
    },
}

/// Cloneable front end of a running engine.
#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::Sender<EngineInput>,
    events: broadcast::Sender<SessionEvent>,
    view: watch::Receiver<SessionView>,
}

impl SyncHandle {
    async fn send(&self, command: Command) -> Result<(), EngineClosed> {
        self.tx
            .send(EngineInput::Command(command))
            .await
            .map_err(|_| EngineClosed)
    }

    pub async fn open_board(&self, board_id: BoardId) -> Result<(), EngineClosed> {
        self.send(Command::OpenBoard(board_id)).await
    }

    pub async fn close_board(&self) -> Result<(), EngineClosed> {
        self.send(Command::CloseBoard).await
    }

    pub async fn drag(&self, gesture: DragGesture) -> Result<(), EngineClosed> {
        self.send(Command::Drag(gesture)).await
    }

    pub async fn move_card_to(
        &self,
        card: CardId,
        list: ListId,
        index: TargetIndex,
    ) -> Result<(), EngineClosed> {
        self.send(Command::MoveCardTo { card, list, index }).await
    }

    pub async fn move_list_to_board(&self, list: ListId, board: BoardId) -> Result<(), EngineClosed> {
        self.send(Command::MoveListToBoard { list, board }).await
    }

    pub async fn move_board(&self, board: BoardId, index: TargetIndex) -> Result<(), EngineClosed> {
        self.send(Command::MoveBoard { board, index }).await
    }

    /// Full resync of the open board, or a directory reload.
    pub async fn refresh(&self) -> Result<(), EngineClosed> {
        self.send(Command::Refresh).await
    }

    pub async fn shutdown(&self) -> Result<(), EngineClosed> {
        self.send(Command::Shutdown).await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// The latest published view.
    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    pub fn watch_view(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }
}

/// Starts the engine. It loads the board directory right away and runs until
/// [`SyncHandle::shutdown`] is called.
pub fn spawn_engine(
    service: Arc<dyn BoardService>,
    push: Arc<dyn PushSource>,
    settings: &ClientSettings,
) -> (SyncHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(settings.event_buffer.max(1));
    let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
    let (view_tx, view_rx) = watch::channel(SessionView::default());

    let engine = Engine {
        session: BoardSession::new(settings.echo_ttl),
        service,
        push,
        policy: settings.reconnect_policy(),
        tx: tx.downgrade(),
        subscription: None,
        events: events.clone(),
        view: view_tx,
    };
    let task = tokio::spawn(engine.run(rx));
    let handle = SyncHandle {
        tx,
        events,
        view: view_rx,
    };
    (handle, task)
}

struct Engine {
    session: BoardSession,
    service: Arc<dyn BoardService>,
    push: Arc<dyn PushSource>,
    policy: ReconnectPolicy,
    tx: mpsc::WeakSender<EngineInput>,
    subscription: Option<Subscription>,
    events: broadcast::Sender<SessionEvent>,
    view: watch::Sender<SessionView>,
}

impl Engine {
    async fn run(mut self, mut rx: mpsc::Receiver<EngineInput>) {
        info!("sync engine started");
        self.session.start();
        self.flush();

        while let Some(input) = rx.recv().await {
            let now = Instant::now();
            match input {
                EngineInput::Command(Command::Shutdown) => break,
                EngineInput::Command(command) => self.command(command),
                EngineInput::Push { epoch, message } => {
                    self.session.on_subscriber(epoch, message, now)
                }
                EngineInput::MoveFinished { ticket, result } => {
                    self.session.on_move_finished(ticket, result, now)
                }
                EngineInput::FetchFinished {
                    epoch,
                    scope,
                    result,
                } => self.session.on_fetch_finished(epoch, scope, result, now),
            }
            self.flush();
        }

        self.subscription = None;
        info!("sync engine stopped");
    }

    fn command(&mut self, command: Command) {
        debug!(?command, "command");
        match command {
            Command::OpenBoard(board_id) => self.session.open_board(board_id),
            Command::CloseBoard => self.session.close_board(),
            Command::Drag(gesture) => {
                self.session.drag(&gesture);
            }
            Command::MoveCardTo { card, list, index } => {
                self.session.move_card_to(card, list, index);
            }
            Command::MoveListToBoard { list, board } => {
                self.session.move_list_to_board(list, board);
            }
            Command::MoveBoard { board, index } => {
                self.session.move_board(board, index);
            }
            Command::Refresh => self.session.refresh(),
            Command::Shutdown => {}
        }
    }

    /// Executes queued effects and republishes the view.
    fn flush(&mut self) {
        for effect in self.session.drain_effects() {
            match effect {
                Effect::Subscribe { board_id, epoch } => {
                    let Some(tx) = self.tx.upgrade() else {
                        continue;
                    };
                    self.subscription = Some(spawn_subscriber(
                        Arc::clone(&self.push),
                        board_id,
                        self.policy,
                        tx,
                        move |message| EngineInput::Push { epoch, message },
                    ));
                }
                Effect::Unsubscribe => {
                    if let Some(subscription) = self.subscription.take() {
                        debug!(board_id = subscription.board_id().0, "unsubscribed");
                    }
                }
                Effect::SendMove { ticket, request } => {
                    let Some(tx) = self.tx.upgrade() else {
                        continue;
                    };
                    let service = Arc::clone(&self.service);
                    tokio::spawn(async move {
                        let result = service.send_move(request).await;
                        let _ = tx.send(EngineInput::MoveFinished { ticket, result }).await;
                    });
                }
                Effect::Fetch { epoch, scope } => {
                    let Some(tx) = self.tx.upgrade() else {
                        continue;
                    };
                    let service = Arc::clone(&self.service);
                    tokio::spawn(async move {
                        let result = fetch(service.as_ref(), scope).await;
                        let _ = tx
                            .send(EngineInput::FetchFinished {
                                epoch,
                                scope,
                                result,
                            })
                            .await;
                    });
                }
                Effect::Notify(event) => {
                    let _ = self.events.send(event);
                }
            }
        }

        let view = self.session.view();
        self.view.send_if_modified(|current| {
            if *current == view {
                return false;
            }
            *current = view;
            true
        });
    }
}

async fn fetch(service: &dyn BoardService, scope: FetchScope) -> Result<Fetched, TransportError> {
    match scope {
        FetchScope::Board(board_id) => service.fetch_board(board_id).await.map(Fetched::Board),
        FetchScope::ListCards(list_id) => service
            .fetch_list_cards(list_id)
            .await
            .map(Fetched::ListCards),
        FetchScope::Directory => service.fetch_boards().await.map(Fetched::Directory),
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
