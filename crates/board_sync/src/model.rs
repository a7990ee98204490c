use std::collections::HashMap;

use shared::{
    domain::{BoardId, CardId, ListId},
    protocol::{Board, BoardSnapshot, Card, List},
};
use tracing::debug;

use crate::collection::{CollectionSet, OrderedCollection};

/// The user's boards in display order.
pub type BoardDirectory = OrderedCollection<Board>;

/// Builds the directory from the service's board listing, which is already in
/// server order.
pub fn directory_from(boards: Vec<Board>) -> BoardDirectory {
    OrderedCollection::from_ordered(boards)
}

/// Local ordered state of the open board: its lists and, per list, its cards.
#[derive(Debug, Clone)]
pub struct BoardModel {
    board: Board,
    lists: OrderedCollection<List>,
    cards: CollectionSet<Card>,
}

impl BoardModel {
    /// Rebuilds the model from a full snapshot, ordering siblings by the
    /// service's sparse `(pos, id)` key.
    pub fn from_snapshot(snapshot: BoardSnapshot) -> Self {
        let BoardSnapshot {
            board,
            mut lists,
            mut cards,
        } = snapshot;
        lists.retain(|list| list.board_id == board.id);
        lists.sort_by_key(|list| (list.pos, list.id));
        let lists = OrderedCollection::from_ordered(lists);

        let mut card_set = CollectionSet::new();
        for list in lists.iter() {
            let mut members = cards.remove(&list.id).unwrap_or_default();
            members.sort_by_key(|card| (card.pos, card.id));
            card_set.replace_parent(list.id, members);
        }
        for orphan in cards.keys() {
            debug!(board_id = board.id.0, list_id = orphan.0, "snapshot cards for unknown list dropped");
        }

        Self {
            board,
            lists,
            cards: card_set,
        }
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    pub fn board_id(&self) -> BoardId {
        self.board.id
    }

    pub fn lists(&self) -> &OrderedCollection<List> {
        &self.lists
    }

    pub fn lists_mut(&mut self) -> &mut OrderedCollection<List> {
        &mut self.lists
    }

    pub fn cards(&self) -> &CollectionSet<Card> {
        &self.cards
    }

    pub fn cards_mut(&mut self) -> &mut CollectionSet<Card> {
        &mut self.cards
    }

    pub fn has_list(&self, list_id: ListId) -> bool {
        self.lists.contains(list_id)
    }

    pub fn list_of_card(&self, card_id: CardId) -> Option<ListId> {
        self.cards.parent_of(card_id)
    }

    /// Card ids of one list in order; empty when the list is not loaded.
    pub fn card_ids(&self, list_id: ListId) -> Vec<CardId> {
        self.cards
            .get(list_id)
            .map(OrderedCollection::ids)
            .unwrap_or_default()
    }

    pub fn list_ids(&self) -> Vec<ListId> {
        self.lists.ids()
    }

    /// Adds a list at `index` with an empty card collection. `false` when the
    /// list is already present.
    pub fn insert_list(&mut self, list: List, index: usize) -> bool {
        let list_id = list.id;
        if self.lists.insert_at(list, index).is_err() {
            return false;
        }
        self.cards.ensure_parent(list_id);
        true
    }

    /// Removes a list together with its cards.
    pub fn remove_list(&mut self, list_id: ListId) -> Option<(usize, List, Vec<Card>)> {
        let (index, list) = self.lists.remove(list_id)?;
        let cards = self
            .cards
            .drop_parent(list_id)
            .map(|collection| collection.iter().cloned().collect())
            .unwrap_or_default();
        Some((index, list, cards))
    }

    /// Replaces one list's cards wholesale, e.g. after a list-scoped resync.
    pub fn replace_list_cards(&mut self, list_id: ListId, mut cards: Vec<Card>) -> bool {
        if !self.lists.contains(list_id) {
            return false;
        }
        cards.sort_by_key(|card| (card.pos, card.id));
        self.cards.replace_parent(list_id, cards);
        true
    }

    /// Rearranges a list to exactly `order`, pulling cards out of whichever
    /// list currently holds them. Ids no longer on the board are skipped.
    pub fn restore_card_order(&mut self, list_id: ListId, order: &[CardId]) -> bool {
        if !self.lists.contains(list_id) {
            return false;
        }
        let cards: Vec<Card> = order
            .iter()
            .filter_map(|id| self.cards.find(*id).cloned())
            .collect();
        self.cards.replace_parent(list_id, cards);
        true
    }

    /// Rearranges lists to `order`; lists not named keep their relative
    /// order after the named ones.
    pub fn restore_list_order(&mut self, order: &[ListId]) {
        self.lists.reorder(order);
    }

    pub fn view(&self) -> BoardView {
        let lists = self
            .lists
            .iter()
            .map(|list| ListView {
                list: list.clone(),
                cards: self
                    .cards
                    .get(list.id)
                    .map(|collection| collection.iter().cloned().collect())
                    .unwrap_or_default(),
            })
            .collect();
        BoardView {
            board: self.board.clone(),
            lists,
        }
    }

    /// Order-only fingerprint of the whole board, for comparisons in tests and
    /// rollback decisions.
    pub fn layout(&self) -> Vec<(ListId, Vec<CardId>)> {
        self.lists
            .iter()
            .map(|list| (list.id, self.card_ids(list.id)))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListView {
    pub list: List,
    pub cards: Vec<Card>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoardView {
    pub board: Board,
    pub lists: Vec<ListView>,
}

/// What the presentation layer reads: the open board (if loaded) plus the
/// board directory and freshness flags.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionView {
    pub open_board: Option<BoardId>,
    pub board: Option<BoardView>,
    pub directory: Vec<Board>,
    pub loading: bool,
    pub possibly_stale: bool,
}

impl SessionView {
    pub fn card_order(&self) -> HashMap<ListId, Vec<CardId>> {
        self.board
            .iter()
            .flat_map(|board| board.lists.iter())
            .map(|list| (list.list.id, list.cards.iter().map(|card| card.id).collect()))
            .collect()
    }

    pub fn list_order(&self) -> Vec<ListId> {
        self.board
            .iter()
            .flat_map(|board| board.lists.iter())
            .map(|list| list.list.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::{card_at, list_at, snapshot};

    #[test]
    fn snapshot_order_follows_sparse_positions() {
        let model = BoardModel::from_snapshot(snapshot(
            1,
            vec![list_at(20, 1, 3000), list_at(10, 1, 1000)],
            vec![
                card_at(3, 10, 2048),
                card_at(1, 10, 1024),
                card_at(2, 10, 1024),
                card_at(9, 20, 5),
            ],
        ));

        assert_eq!(model.list_ids(), vec![ListId(10), ListId(20)]);
        assert_eq!(model.card_ids(ListId(10)), vec![CardId(1), CardId(2), CardId(3)]);
        assert_eq!(model.card_ids(ListId(20)), vec![CardId(9)]);
    }

    #[test]
    fn lists_without_cards_are_still_loaded() {
        let model = BoardModel::from_snapshot(snapshot(1, vec![list_at(10, 1, 0)], vec![]));
        assert!(model.cards().is_loaded(ListId(10)));
        assert!(model.card_ids(ListId(10)).is_empty());
    }

    #[test]
    fn remove_list_detaches_its_cards() {
        let mut model = BoardModel::from_snapshot(snapshot(
            1,
            vec![list_at(10, 1, 0), list_at(11, 1, 1)],
            vec![card_at(1, 10, 0), card_at(2, 11, 0)],
        ));

        let (index, _, cards) = model.remove_list(ListId(10)).expect("removed");

        assert_eq!(index, 0);
        assert_eq!(cards.len(), 1);
        assert_eq!(model.list_of_card(CardId(1)), None);
        assert_eq!(model.list_of_card(CardId(2)), Some(ListId(11)));
    }
}
