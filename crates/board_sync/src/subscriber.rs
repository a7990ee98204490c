//! One live push subscription for the open board, with reconnects.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use shared::domain::BoardId;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{info, warn};

use crate::{
    events::{decode_event, ChangeEvent},
    transport::PushSource,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Closed,
    Connecting,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub stale_after_failures: u32,
}

impl ReconnectPolicy {
    /// Exponential backoff over consecutive failures; a dropped stream that
    /// had been open waits `initial_delay`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1 << exponent)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubscriberMessage {
    /// `resumed` is set when the stream had been open before, i.e. events
    /// may have been missed in between.
    State {
        state: SubscriptionState,
        resumed: bool,
    },
    Event(ChangeEvent),
    /// Reconnecting keeps failing (`true`) or has recovered (`false`).
    PossiblyStale(bool),
}

/// Handle to a running subscriber task. Dropping it closes the subscription.
#[derive(Debug)]
pub struct Subscription {
    board_id: BoardId,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn board_id(&self) -> BoardId {
        self.board_id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Starts the subscriber for `board_id`. Every message is passed through
/// `wrap` and sent on `tx`; the task ends when `tx` is closed or the
/// returned handle is dropped.
pub fn spawn_subscriber<T, F>(
    source: Arc<dyn PushSource>,
    board_id: BoardId,
    policy: ReconnectPolicy,
    tx: mpsc::Sender<T>,
    wrap: F,
) -> Subscription
where
    T: Send + 'static,
    F: Fn(SubscriberMessage) -> T + Send + Sync + 'static,
{
    let task = tokio::spawn(async move {
        let emit = |message: SubscriberMessage| tx.send(wrap(message));
        let mut failures: u32 = 0;
        let mut opened_before = false;
        let mut stale = false;

        loop {
            let connecting = SubscriberMessage::State {
                state: SubscriptionState::Connecting,
                resumed: opened_before,
            };
            if emit(connecting).await.is_err() {
                return;
            }

            match source.subscribe(board_id).await {
                Ok(mut stream) => {
                    failures = 0;
                    if stale {
                        stale = false;
                        if emit(SubscriberMessage::PossiblyStale(false)).await.is_err() {
                            return;
                        }
                    }
                    let open = SubscriberMessage::State {
                        state: SubscriptionState::Open,
                        resumed: opened_before,
                    };
                    if emit(open).await.is_err() {
                        return;
                    }
                    if opened_before {
                        info!(board_id = board_id.0, "event stream resumed");
                    }
                    opened_before = true;

                    while let Some(frame) = stream.next().await {
                        match frame {
                            Ok(raw) => match decode_event(&raw) {
                                Ok(event) => {
                                    if emit(SubscriberMessage::Event(event)).await.is_err() {
                                        return;
                                    }
                                }
                                Err(err) => {
                                    warn!(board_id = board_id.0, "dropping undecodable event: {err}");
                                }
                            },
                            Err(err) => {
                                warn!(board_id = board_id.0, "event stream failed: {err}");
                                break;
                            }
                        }
                    }
                    warn!(board_id = board_id.0, "event stream closed; reconnecting");
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    warn!(board_id = board_id.0, failures, "event stream connect failed: {err}");
                    if !stale && failures >= policy.stale_after_failures {
                        stale = true;
                        if emit(SubscriberMessage::PossiblyStale(true)).await.is_err() {
                            return;
                        }
                    }
                }
            }

            let closed = SubscriberMessage::State {
                state: SubscriptionState::Closed,
                resumed: false,
            };
            if emit(closed).await.is_err() {
                return;
            }
            tokio::time::sleep(policy.delay_for(failures)).await;
        }
    });
    Subscription { board_id, task }
}

#[cfg(test)]
#[path = "tests/subscriber_tests.rs"]
mod tests;
