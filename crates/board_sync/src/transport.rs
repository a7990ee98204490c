//! Seams to the board-data service and its push channel, plus the HTTP/SSE
//! implementation of both.

use std::{collections::VecDeque, pin::Pin, time::Duration};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::{header, Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{BoardId, ListId},
    error::ApiError,
    protocol::{Board, BoardSnapshot, Card, OkResponse},
};
use tracing::{debug, info};
use url::Url;

use crate::{config::ClientSettings, error::TransportError, planner::MoveRequest, sse::SseDecoder};

/// Raw event frames (the `data:` payload of each event) from one board
/// subscription. The stream ends when the connection drops.
pub type PushStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

#[async_trait]
pub trait BoardService: Send + Sync {
    /// The user's boards in server order.
    async fn fetch_boards(&self) -> Result<Vec<Board>, TransportError>;
    async fn fetch_board(&self, board_id: BoardId) -> Result<BoardSnapshot, TransportError>;
    async fn fetch_list_cards(&self, list_id: ListId) -> Result<Vec<Card>, TransportError>;
    async fn send_move(&self, request: MoveRequest) -> Result<(), TransportError>;
}

#[async_trait]
pub trait PushSource: Send + Sync {
    /// Opens the event stream of one board. Resolves once the service has
    /// accepted the subscription.
    async fn subscribe(&self, board_id: BoardId) -> Result<PushStream, TransportError>;
}

/// Talks JSON over HTTP to the board-data service and subscribes to its
/// server-sent event stream.
#[derive(Clone)]
pub struct HttpBoardService {
    http: Client,
    base: Url,
    session_cookie: Option<String>,
    request_timeout: Duration,
}

impl HttpBoardService {
    pub fn new(settings: &ClientSettings) -> Result<Self, TransportError> {
        let mut base = Url::parse(&settings.server_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        // No client-wide timeout: it would also cut the long-lived event
        // stream. Plain requests get one each.
        let http = Client::builder()
            .connect_timeout(settings.request_timeout)
            .build()?;
        Ok(Self {
            http,
            base,
            session_cookie: settings.session_cookie.clone(),
            request_timeout: settings.request_timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        Ok(self.base.join(path.trim_start_matches('/'))?)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.session_cookie {
            Some(cookie) => request.header(header::COOKIE, cookie),
            None => request,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, TransportError> {
        let url = self.endpoint(path)?;
        let response = self
            .authorize(self.http.get(url))
            .timeout(self.request_timeout)
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    async fn post_json<B: serde::Serialize + Sync>(&self, path: &str, body: &B) -> Result<(), TransportError> {
        let url = self.endpoint(path)?;
        let response = self
            .authorize(self.http.post(url))
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await?;
        let response = check_status(response).await?;
        let ok: OkResponse = response.json().await?;
        if ok.ok {
            Ok(())
        } else {
            Err(TransportError::Body("service answered ok=false".to_string()))
        }
    }
}

/// Turns non-2xx responses into the service's structured error.
async fn check_status(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::from_body(status.as_u16(), &body).into())
}

#[async_trait]
impl BoardService for HttpBoardService {
    async fn fetch_boards(&self) -> Result<Vec<Board>, TransportError> {
        self.get_json("api/boards").await
    }

    async fn fetch_board(&self, board_id: BoardId) -> Result<BoardSnapshot, TransportError> {
        self.get_json(&format!("api/boards/{board_id}/full")).await
    }

    async fn fetch_list_cards(&self, list_id: ListId) -> Result<Vec<Card>, TransportError> {
        self.get_json(&format!("api/lists/{list_id}/cards")).await
    }

    async fn send_move(&self, request: MoveRequest) -> Result<(), TransportError> {
        debug!(?request, "sending move");
        match request {
            MoveRequest::Card { card, body } => {
                self.post_json(&format!("api/cards/{card}/move"), &body).await
            }
            MoveRequest::List { list, body } => {
                self.post_json(&format!("api/lists/{list}/move"), &body).await
            }
            MoveRequest::Board { board, body } => {
                self.post_json(&format!("api/boards/{board}/move"), &body).await
            }
        }
    }
}

#[async_trait]
impl PushSource for HttpBoardService {
    async fn subscribe(&self, board_id: BoardId) -> Result<PushStream, TransportError> {
        let url = self.endpoint(&format!("api/boards/{board_id}/events"))?;
        let response = self
            .authorize(self.http.get(url))
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        let response = check_status(response).await?;
        info!(board_id = board_id.0, "event stream connected");

        let bytes = Box::pin(response.bytes_stream());
        let frames = futures::stream::unfold(
            (bytes, SseDecoder::new(), VecDeque::<String>::new()),
            |(mut bytes, mut decoder, mut ready)| async move {
                loop {
                    if let Some(frame) = ready.pop_front() {
                        return Some((Ok(frame), (bytes, decoder, ready)));
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => ready.extend(decoder.push(&chunk)),
                        Some(Err(err)) => {
                            return Some((Err(TransportError::from(err)), (bytes, decoder, ready)))
                        }
                        None => return None,
                    }
                }
            },
        );
        Ok(frames.boxed())
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
