use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Json,
    },
    routing::{get, post},
    Router,
};
use shared::{
    domain::{CardId, TargetIndex, END_OF_COLLECTION},
    error::ErrorCode,
    protocol::MoveCardRequest,
};
use tokio::{
    net::TcpListener,
    sync::{broadcast, Mutex},
};
use tokio_stream::wrappers::BroadcastStream;

use super::*;
use crate::tests_support::{board, card_at, list_at, snapshot};

#[derive(Clone)]
struct MockState {
    moves: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
    cookies: Arc<Mutex<Vec<String>>>,
    events: broadcast::Sender<String>,
}

async fn boards() -> Json<Vec<Board>> {
    Json(vec![board(2), board(1)])
}

async fn board_full(Path(id): Path<i64>) -> impl IntoResponse {
    if id == 404 {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "board not found"})),
        )
            .into_response();
    }
    Json(snapshot(
        id,
        vec![list_at(10, id, 1024)],
        vec![card_at(1, 10, 2048), card_at(2, 10, 1024)],
    ))
    .into_response()
}

async fn list_cards(Path(id): Path<i64>) -> Json<Vec<Card>> {
    Json(vec![card_at(7, id, 0)])
}

async fn move_card(
    State(state): State<MockState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    if let Some(cookie) = headers.get("cookie").and_then(|v| v.to_str().ok()) {
        state.cookies.lock().await.push(cookie.to_string());
    }
    if id == 404 {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "not found"})),
        )
            .into_response();
    }
    state.moves.lock().await.push((format!("card/{id}"), body));
    Json(serde_json::json!({"ok": true})).into_response()
}

async fn events(
    State(state): State<MockState>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events.subscribe();
    let heartbeat = futures::stream::once(async { Ok(Event::default().comment("ping")) });
    let frames = BroadcastStream::new(rx)
        .filter_map(|item| async move { item.ok().map(|data| Ok(Event::default().data(data))) });
    Sse::new(heartbeat.chain(frames))
}

async fn spawn_board_server() -> (String, MockState) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (events_tx, _) = broadcast::channel(16);
    let state = MockState {
        moves: Arc::new(Mutex::new(Vec::new())),
        cookies: Arc::new(Mutex::new(Vec::new())),
        events: events_tx,
    };
    let app = Router::new()
        .route("/api/boards", get(boards))
        .route("/api/boards/:id/full", get(board_full))
        .route("/api/boards/:id/events", get(events))
        .route("/api/lists/:id/cards", get(list_cards))
        .route("/api/cards/:id/move", post(move_card))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

fn service(server_url: String) -> HttpBoardService {
    let settings = ClientSettings {
        server_url,
        session_cookie: Some("session=abc".to_string()),
        ..ClientSettings::default()
    };
    HttpBoardService::new(&settings).expect("service")
}

#[tokio::test]
async fn fetches_directory_and_snapshot() {
    let (server_url, _state) = spawn_board_server().await;
    let service = service(server_url);

    let boards = service.fetch_boards().await.expect("boards");
    assert_eq!(
        boards.iter().map(|b| b.id).collect::<Vec<_>>(),
        vec![BoardId(2), BoardId(1)]
    );

    let snapshot = service.fetch_board(BoardId(5)).await.expect("snapshot");
    assert_eq!(snapshot.board.id, BoardId(5));
    assert_eq!(snapshot.cards[&ListId(10)].len(), 2);

    let cards = service.fetch_list_cards(ListId(10)).await.expect("cards");
    assert_eq!(cards[0].id, CardId(7));
}

#[tokio::test]
async fn move_posts_wire_body_with_session_cookie() {
    let (server_url, state) = spawn_board_server().await;
    let service = service(server_url);

    service
        .send_move(MoveRequest::Card {
            card: CardId(3),
            body: MoveCardRequest {
                target_list_id: ListId(10),
                new_index: TargetIndex::End.to_wire(),
            },
        })
        .await
        .expect("move");

    let moves = state.moves.lock().await;
    assert_eq!(moves.len(), 1);
    assert_eq!(moves[0].0, "card/3");
    assert_eq!(moves[0].1["target_list_id"], 10);
    assert_eq!(moves[0].1["new_index"], END_OF_COLLECTION);
    assert_eq!(state.cookies.lock().await.as_slice(), ["session=abc"]);
}

#[tokio::test]
async fn error_body_maps_to_api_error() {
    let (server_url, _state) = spawn_board_server().await;
    let service = service(server_url);

    let err = service
        .send_move(MoveRequest::Card {
            card: CardId(404),
            body: MoveCardRequest {
                target_list_id: ListId(10),
                new_index: 0,
            },
        })
        .await
        .expect_err("missing card");

    assert!(err.is_stale_reference());
    match err {
        TransportError::Api(api) => {
            assert_eq!(api.code, ErrorCode::NotFound);
            assert_eq!(api.message, "not found");
        }
        other => panic!("unexpected error {other:?}"),
    }

    let err = service.fetch_board(BoardId(404)).await.expect_err("missing board");
    assert!(matches!(err, TransportError::Api(api) if api.message == "board not found"));
}

#[tokio::test]
async fn event_stream_yields_data_frames_and_skips_heartbeats() {
    let (server_url, state) = spawn_board_server().await;
    let service = service(server_url);

    let mut stream = service.subscribe(BoardId(1)).await.expect("subscribe");
    state
        .events
        .send(r#"{"type":"card.deleted","board_id":1,"payload":{"id":4}}"#.to_string())
        .expect("listener");
    state
        .events
        .send(r#"{"type":"list.deleted","board_id":1,"payload":{"id":9}}"#.to_string())
        .expect("listener");

    let first = stream.next().await.expect("frame").expect("ok frame");
    let second = stream.next().await.expect("frame").expect("ok frame");
    assert!(first.contains("card.deleted"));
    assert!(second.contains("list.deleted"));
}

#[tokio::test]
async fn unreachable_service_is_a_network_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let service = service(format!("http://{addr}"));

    let err = service.fetch_boards().await.expect_err("nothing listening");
    assert!(matches!(err, TransportError::Network(_)));
}
