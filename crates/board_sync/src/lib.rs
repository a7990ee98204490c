//! Client-side synchronization of kanban boards: optimistic moves, push
//! reconciliation and resyncs against the board-data service.

pub mod collection;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod model;
pub mod optimistic;
pub mod planner;
pub mod reconciler;
pub mod session;
pub mod sse;
pub mod subscriber;
pub mod transport;

pub use config::{load_settings, load_settings_from, ClientSettings};
pub use engine::{spawn_engine, Command, SyncHandle};
pub use error::{DecodeError, EngineClosed, TransportError};
pub use model::{BoardView, ListView, SessionView};
pub use optimistic::MoveTicket;
pub use planner::{DragGesture, DragSubject, EntityRef, SiblingBounds};
pub use session::{ChangeCause, SessionEvent};
pub use subscriber::SubscriptionState;
pub use transport::{BoardService, HttpBoardService, PushSource};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod tests_support;
