//! Fixture builders shared by the unit test suites.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{BoardId, CardId, ListId},
    protocol::{Board, BoardSnapshot, Card, List},
};

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0)
        .single()
        .expect("valid timestamp")
}

pub fn board(id: i64) -> Board {
    Board {
        id: BoardId(id),
        title: format!("board {id}"),
        color: String::new(),
        created_at: epoch(),
        created_by: None,
        via_group: false,
    }
}

pub fn list_at(id: i64, board_id: i64, pos: i64) -> List {
    List {
        id: ListId(id),
        board_id: BoardId(board_id),
        title: format!("list {id}"),
        color: String::new(),
        pos,
        created_at: epoch(),
    }
}

pub fn list(id: i64, board_id: i64) -> List {
    list_at(id, board_id, id * 1024)
}

pub fn card_at(id: i64, list_id: i64, pos: i64) -> Card {
    Card {
        id: CardId(id),
        list_id: ListId(list_id),
        title: format!("card {id}"),
        description: String::new(),
        description_is_md: false,
        color: String::new(),
        pos,
        due_at: None,
        assignee_id: None,
        created_at: epoch(),
    }
}

pub fn card(id: i64, list_id: i64) -> Card {
    card_at(id, list_id, 0)
}

pub fn snapshot(board_id: i64, lists: Vec<List>, cards: Vec<Card>) -> BoardSnapshot {
    let mut by_list: HashMap<ListId, Vec<Card>> = HashMap::new();
    for card in cards {
        by_list.entry(card.list_id).or_default().push(card);
    }
    BoardSnapshot {
        board: board(board_id),
        lists,
        cards: by_list,
    }
}

/// Snapshot whose lists and cards are ordered exactly as given.
pub fn ordered_snapshot(board_id: i64, layout: &[(i64, &[i64])]) -> BoardSnapshot {
    let mut lists = Vec::new();
    let mut cards = Vec::new();
    for (list_pos, (list_id, card_ids)) in layout.iter().enumerate() {
        lists.push(list_at(*list_id, board_id, list_pos as i64 * 1024));
        for (card_pos, card_id) in card_ids.iter().enumerate() {
            cards.push(card_at(*card_id, *list_id, card_pos as i64 * 1024));
        }
    }
    snapshot(board_id, lists, cards)
}
