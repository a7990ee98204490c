use std::time::Duration;

use shared::domain::{CardId, UserId};

use super::*;
use crate::{
    model::directory_from,
    optimistic::{apply_plan, Admission, Applied},
    planner::MovePlan,
    tests_support::{board, card, list, ordered_snapshot},
};

struct Fixture {
    model: Option<BoardModel>,
    directory: BoardDirectory,
    log: MoveLog,
    reconciler: Reconciler,
    now: Instant,
}

impl Fixture {
    fn new(layout: &[(i64, &[i64])]) -> Self {
        Self {
            model: Some(BoardModel::from_snapshot(ordered_snapshot(1, layout))),
            directory: directory_from(vec![board(1), board(2), board(3)]),
            log: MoveLog::new(Duration::from_secs(5)),
            reconciler: Reconciler::new(),
            now: Instant::now(),
        }
    }

    fn offer(&mut self, event: ChangeEvent) -> Step {
        let mut ctx = ReconcileCtx {
            open_board: BoardId(1),
            model: self.model.as_mut(),
            directory: &mut self.directory,
            log: &mut self.log,
            now: self.now,
        };
        self.reconciler.offer(event, &mut ctx)
    }

    fn replay(&mut self, events: Vec<ChangeEvent>) -> Vec<Step> {
        let mut ctx = ReconcileCtx {
            open_board: BoardId(1),
            model: self.model.as_mut(),
            directory: &mut self.directory,
            log: &mut self.log,
            now: self.now,
        };
        self.reconciler.replay(events, &mut ctx)
    }

    /// Applies and dispatches an own move the way the session does.
    fn own_move(&mut self, plan: MovePlan) -> MoveTicket {
        let Admission::Ready(ticket) = self.log.admit(plan, 1) else {
            panic!("entity already busy");
        };
        let undo = match apply_plan(&plan, self.model.as_mut(), &mut self.directory) {
            Applied::Changed(undo) => Some(undo),
            _ => None,
        };
        self.log.dispatched(ticket, undo);
        ticket
    }

    fn ids(&self, list_id: i64) -> Vec<i64> {
        self.model
            .as_ref()
            .expect("model loaded")
            .card_ids(ListId(list_id))
            .iter()
            .map(|id| id.0)
            .collect()
    }

    fn layout(&self) -> Vec<(ListId, Vec<CardId>)> {
        self.model.as_ref().expect("model loaded").layout()
    }
}

fn card_moved(card_id: i64, target: i64, index: usize) -> ChangeEvent {
    ChangeEvent::CardMoved {
        board_id: BoardId(1),
        card_id: CardId(card_id),
        target_list: Some(ListId(target)),
        index: Some(TargetIndex::At(index)),
    }
}

fn card_created(card_id: i64, list_id: i64) -> ChangeEvent {
    ChangeEvent::CardCreated {
        board_id: BoardId(1),
        card: card(card_id, list_id),
    }
}

fn card_deleted(card_id: i64) -> ChangeEvent {
    ChangeEvent::CardDeleted {
        board_id: BoardId(1),
        card_id: CardId(card_id),
    }
}

#[test]
fn deleting_a_card_that_is_not_loaded_is_a_no_op() {
    let mut fx = Fixture::new(&[(10, &[1, 2])]);
    let before = fx.layout();

    assert_eq!(fx.offer(card_deleted(5)), Step::Ignored);
    assert_eq!(fx.layout(), before);
}

#[test]
fn creation_and_deletion_are_idempotent() {
    let mut fx = Fixture::new(&[(10, &[1, 2])]);

    assert_eq!(fx.offer(card_created(3, 10)), Step::Applied);
    let once = fx.layout();
    assert_eq!(fx.offer(card_created(3, 10)), Step::Ignored);
    assert_eq!(fx.layout(), once);

    assert_eq!(fx.offer(card_deleted(1)), Step::Applied);
    let deleted_once = fx.layout();
    assert_eq!(fx.offer(card_deleted(1)), Step::Ignored);
    assert_eq!(fx.layout(), deleted_once);
    assert_eq!(fx.ids(10), vec![2, 3]);
}

#[test]
fn own_move_echo_confirms_without_reapplying() {
    let mut fx = Fixture::new(&[(10, &[1, 2, 3])]);
    let ticket = fx.own_move(MovePlan::Card {
        card: CardId(1),
        from: ListId(10),
        to: ListId(10),
        index: TargetIndex::At(2),
    });
    assert_eq!(fx.ids(10), vec![2, 3, 1]);

    assert_eq!(fx.offer(card_moved(1, 10, 2)), Step::Confirmed(ticket));
    assert_eq!(fx.ids(10), vec![2, 3, 1]);
}

#[test]
fn echo_lands_at_service_position_after_interleaved_foreign_move() {
    let mut fx = Fixture::new(&[(10, &[1, 2, 3])]);
    fx.own_move(MovePlan::Card {
        card: CardId(3),
        from: ListId(10),
        to: ListId(10),
        index: TargetIndex::At(0),
    });
    assert_eq!(fx.ids(10), vec![3, 1, 2]);

    // The service ran the foreign move first, then ours.
    assert_eq!(fx.offer(card_moved(2, 10, 0)), Step::Applied);
    assert_eq!(fx.ids(10), vec![2, 3, 1]);
    assert_eq!(fx.offer(card_moved(3, 10, 0)), Step::Applied);
    assert_eq!(fx.ids(10), vec![3, 2, 1]);
}

#[test]
fn directory_echo_lands_at_service_position() {
    let mut fx = Fixture::new(&[(10, &[1])]);
    fx.own_move(MovePlan::Board {
        board: BoardId(3),
        index: TargetIndex::At(0),
    });
    assert_eq!(fx.directory.ids(), vec![BoardId(3), BoardId(1), BoardId(2)]);

    let foreign = ChangeEvent::BoardMoved {
        board_id: BoardId(2),
        index: Some(TargetIndex::At(0)),
    };
    assert_eq!(fx.offer(foreign), Step::DirectoryChanged);
    let echo = ChangeEvent::BoardMoved {
        board_id: BoardId(3),
        index: Some(TargetIndex::At(0)),
    };
    assert_eq!(fx.offer(echo.clone()), Step::DirectoryChanged);
    assert_eq!(fx.directory.ids(), vec![BoardId(3), BoardId(2), BoardId(1)]);

    let mut fx = Fixture::new(&[(10, &[1])]);
    let ticket = fx.own_move(MovePlan::Board {
        board: BoardId(3),
        index: TargetIndex::At(0),
    });
    assert_eq!(fx.offer(echo), Step::Confirmed(ticket));
}

#[test]
fn foreign_move_of_a_busy_entity_defers_a_board_resync() {
    let mut fx = Fixture::new(&[(10, &[1, 2, 3]), (11, &[])]);
    let ticket = fx.own_move(MovePlan::Card {
        card: CardId(1),
        from: ListId(10),
        to: ListId(10),
        index: TargetIndex::At(2),
    });

    assert_eq!(fx.offer(card_moved(1, 11, 0)), Step::Deferred);
    assert_eq!(fx.ids(10), vec![2, 3, 1]);
    assert!(!fx.reconciler.take_deferred(true));

    fx.log.resolve(ticket, true, fx.now);
    assert!(fx.reconciler.take_deferred(fx.log.has_board_scoped_in_flight()));
    assert!(!fx.reconciler.take_deferred(false));
}

#[test]
fn foreign_moves_apply_incrementally() {
    let mut fx = Fixture::new(&[(10, &[1, 2, 3]), (11, &[4])]);

    assert_eq!(fx.offer(card_moved(3, 11, 0)), Step::Applied);
    assert_eq!(fx.ids(10), vec![1, 2]);
    assert_eq!(fx.ids(11), vec![3, 4]);

    assert_eq!(
        fx.offer(ChangeEvent::ListMoved {
            board_id: BoardId(1),
            list_id: ListId(10),
            index: Some(TargetIndex::End),
        }),
        Step::Applied
    );
    assert_eq!(
        fx.model.as_ref().expect("model").list_ids(),
        vec![ListId(11), ListId(10)]
    );
}

#[test]
fn end_sentinel_lands_after_current_members() {
    let mut fx = Fixture::new(&[(10, &[1]), (20, &[5, 6, 7, 8])]);

    let step = fx.offer(ChangeEvent::CardMoved {
        board_id: BoardId(1),
        card_id: CardId(1),
        target_list: Some(ListId(20)),
        index: Some(TargetIndex::End),
    });

    assert_eq!(step, Step::Applied);
    assert_eq!(fx.ids(20), vec![5, 6, 7, 8, 1]);
}

#[test]
fn move_without_index_triggers_board_resync_and_buffers() {
    let mut fx = Fixture::new(&[(10, &[1, 2])]);

    let step = fx.offer(ChangeEvent::CardMoved {
        board_id: BoardId(1),
        card_id: CardId(1),
        target_list: Some(ListId(10)),
        index: None,
    });
    assert_eq!(step, Step::Resync(ResyncScope::Board));
    assert_eq!(fx.offer(card_created(3, 10)), Step::Buffered);
    assert_eq!(fx.offer(card_deleted(2)), Step::Buffered);

    let finished = fx.reconciler.finish(ResyncScope::Board, true);

    assert_eq!(
        finished,
        Some(Finished::Replay(vec![card_created(3, 10), card_deleted(2)]))
    );
}

#[test]
fn events_buffered_across_a_resync_are_replayed_not_lost_or_doubled() {
    let mut fx = Fixture::new(&[(10, &[1, 2])]);
    assert!(fx.reconciler.begin(ResyncScope::Board));
    fx.offer(card_created(9, 10));
    fx.offer(card_deleted(1));
    fx.offer(card_moved(2, 10, 0));

    // The snapshot already contains card 9 but predates the deletion.
    fx.model = Some(BoardModel::from_snapshot(ordered_snapshot(1, &[(10, &[1, 2, 9])])));
    let Some(Finished::Replay(events)) = fx.reconciler.finish(ResyncScope::Board, true) else {
        panic!("expected replay");
    };
    let steps = fx.replay(events);

    assert_eq!(steps, vec![Step::Ignored, Step::Applied, Step::Ignored]);
    assert_eq!(fx.ids(10), vec![2, 9]);
}

#[test]
fn content_update_resyncs_only_the_owning_list() {
    let mut fx = Fixture::new(&[(10, &[1, 2]), (11, &[3])]);

    assert_eq!(
        fx.offer(ChangeEvent::CardUpdated {
            board_id: BoardId(1),
            card_id: CardId(2),
            patch: None,
        }),
        Step::Resync(ResyncScope::ListCards(ListId(10)))
    );
    assert_eq!(fx.offer(card_deleted(1)), Step::Buffered);
    assert_eq!(fx.offer(card_deleted(3)), Step::Applied);
    assert!(fx.reconciler.is_resyncing(ResyncScope::ListCards(ListId(10))));

    let finished = fx.reconciler.finish(ResyncScope::ListCards(ListId(10)), true);
    assert_eq!(finished, Some(Finished::Replay(vec![card_deleted(1)])));
    assert!(!fx.reconciler.is_resyncing(ResyncScope::ListCards(ListId(10))));
}

#[test]
fn board_resync_subsumes_pending_list_resync() {
    let mut fx = Fixture::new(&[(10, &[1, 2]), (11, &[3])]);
    assert!(fx.reconciler.begin(ResyncScope::ListCards(ListId(10))));
    assert_eq!(fx.offer(card_deleted(1)), Step::Buffered);

    assert!(fx.reconciler.begin(ResyncScope::Board));
    assert!(!fx.reconciler.begin(ResyncScope::ListCards(ListId(11))));
    assert_eq!(fx.offer(card_deleted(3)), Step::Buffered);

    assert_eq!(fx.reconciler.finish(ResyncScope::ListCards(ListId(10)), true), None);
    assert_eq!(
        fx.reconciler.finish(ResyncScope::Board, true),
        Some(Finished::Replay(vec![card_deleted(1), card_deleted(3)]))
    );
}

#[test]
fn second_gap_during_resync_requests_another_fetch() {
    let mut fx = Fixture::new(&[(10, &[1])]);
    assert!(fx.reconciler.begin(ResyncScope::Board));
    assert!(!fx.reconciler.begin(ResyncScope::Board));
    fx.offer(card_deleted(1));

    assert_eq!(fx.reconciler.finish(ResyncScope::Board, true), Some(Finished::Refetch));
    assert!(fx.reconciler.is_resyncing(ResyncScope::Board));
    assert_eq!(
        fx.reconciler.finish(ResyncScope::Board, true),
        Some(Finished::Replay(vec![card_deleted(1)]))
    );
}

#[test]
fn failed_fetch_still_releases_the_buffer() {
    let mut fx = Fixture::new(&[(10, &[1])]);
    assert!(fx.reconciler.begin(ResyncScope::Board));
    assert!(!fx.reconciler.begin(ResyncScope::Board));
    fx.offer(card_deleted(1));

    assert_eq!(
        fx.reconciler.finish(ResyncScope::Board, false),
        Some(Finished::Replay(vec![card_deleted(1)]))
    );
    assert!(!fx.reconciler.is_resyncing(ResyncScope::Board));
}

#[test]
fn assignee_change_is_patched_in_place() {
    let mut fx = Fixture::new(&[(10, &[1, 2])]);

    let step = fx.offer(ChangeEvent::CardUpdated {
        board_id: BoardId(1),
        card_id: CardId(2),
        patch: Some(CardPatch::Assignee(Some(UserId(8)))),
    });

    assert_eq!(step, Step::Applied);
    let model = fx.model.as_ref().expect("model");
    assert_eq!(
        model.cards().find(CardId(2)).and_then(|c| c.assignee_id),
        Some(UserId(8))
    );
}

#[test]
fn list_creation_appends_and_cards_for_unknown_list_resync() {
    let mut fx = Fixture::new(&[(10, &[1])]);

    assert_eq!(
        fx.offer(ChangeEvent::ListCreated {
            board_id: BoardId(1),
            list: list(12, 1),
        }),
        Step::Applied
    );
    assert_eq!(fx.offer(card_created(4, 12)), Step::Applied);
    assert_eq!(fx.ids(12), vec![4]);
    assert_eq!(fx.offer(card_created(5, 99)), Step::Resync(ResyncScope::Board));
}

#[test]
fn events_for_other_boards_are_ignored_except_directory_moves() {
    let mut fx = Fixture::new(&[(10, &[1])]);
    let before = fx.layout();

    let foreign = ChangeEvent::CardDeleted {
        board_id: BoardId(2),
        card_id: CardId(1),
    };
    assert_eq!(fx.offer(foreign), Step::Ignored);
    assert_eq!(fx.layout(), before);

    let moved = ChangeEvent::BoardMoved {
        board_id: BoardId(3),
        index: Some(TargetIndex::At(0)),
    };
    assert_eq!(fx.offer(moved), Step::DirectoryChanged);
    assert_eq!(
        fx.directory.ids(),
        vec![BoardId(3), BoardId(1), BoardId(2)]
    );
}

#[test]
fn comment_on_known_card_refreshes_its_list() {
    let mut fx = Fixture::new(&[(10, &[1]), (11, &[2])]);

    assert_eq!(
        fx.offer(ChangeEvent::CommentCreated {
            board_id: BoardId(1),
            card_id: CardId(2),
            list_id: Some(ListId(11)),
        }),
        Step::Resync(ResyncScope::ListCards(ListId(11)))
    );
    assert_eq!(
        fx.offer(ChangeEvent::CommentCreated {
            board_id: BoardId(1),
            card_id: CardId(42),
            list_id: None,
        }),
        Step::Ignored
    );
}
