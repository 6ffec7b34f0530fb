//! Snapshot differ: turns two consecutive master snapshots into an ordered
//! list of replication events.
//!
//! Ordering within a tick is closes, then modifies, then opens: freed margin
//! from closes may be needed before new positions fit, and modifies can
//! never conflict with opens. Within each category events are sorted by
//! ascending master ticket so a tick's output is deterministic.

use broker::types::Position;

use crate::master::snapshot::MasterSnapshot;

/// One replication event derived from the master diff.
#[derive(Debug, Clone, PartialEq)]
pub enum CopyEvent {
    Opened(Position),
    Closed {
        master_ticket: u64,
        /// The position as last observed before it disappeared.
        last: Position,
    },
    Modified(Position),
}

impl CopyEvent {
    pub fn master_ticket(&self) -> u64 {
        match self {
            CopyEvent::Opened(p) => p.ticket,
            CopyEvent::Closed { master_ticket, .. } => *master_ticket,
            CopyEvent::Modified(p) => p.ticket,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CopyEvent::Opened(_) => "opened",
            CopyEvent::Closed { .. } => "closed",
            CopyEvent::Modified(_) => "modified",
        }
    }
}

/// Diff `current` against `previous`.
///
/// - `Closed` for tickets present before and gone now.
/// - `Modified` for tickets present in both with changed SL or TP.
/// - `Opened` for tickets that are new.
pub fn diff(previous: &MasterSnapshot, current: &MasterSnapshot) -> Vec<CopyEvent> {
    let mut closed: Vec<&Position> = previous
        .positions
        .values()
        .filter(|p| !current.positions.contains_key(&p.ticket))
        .collect();

    let mut modified: Vec<&Position> = current
        .positions
        .values()
        .filter(|p| {
            previous
                .positions
                .get(&p.ticket)
                .is_some_and(|prev| p.sltp_differs(prev))
        })
        .collect();

    let mut opened: Vec<&Position> = current
        .positions
        .values()
        .filter(|p| !previous.positions.contains_key(&p.ticket))
        .collect();

    closed.sort_by_key(|p| p.ticket);
    modified.sort_by_key(|p| p.ticket);
    opened.sort_by_key(|p| p.ticket);

    let mut events = Vec::with_capacity(closed.len() + modified.len() + opened.len());

    events.extend(closed.into_iter().map(|p| CopyEvent::Closed {
        master_ticket: p.ticket,
        last: p.clone(),
    }));
    events.extend(modified.into_iter().map(|p| CopyEvent::Modified(p.clone())));
    events.extend(opened.into_iter().map(|p| CopyEvent::Opened(p.clone())));

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker::types::Side;

    fn mk_position(ticket: u64, sl: f64, tp: f64) -> Position {
        Position {
            ticket,
            symbol: "EURUSD".to_string(),
            side: Side::Buy,
            volume: 1.0,
            price_open: 1.1,
            sl,
            tp,
            magic: 0,
            opened_at: 0,
        }
    }

    fn snapshot(positions: Vec<Position>) -> MasterSnapshot {
        MasterSnapshot {
            positions: positions.into_iter().map(|p| (p.ticket, p)).collect(),
            pending_orders: 0,
            captured_at_ms: 0,
        }
    }

    #[test]
    fn identical_snapshots_produce_nothing() {
        let s = snapshot(vec![mk_position(1, 0.0, 0.0), mk_position(2, 1.0, 2.0)]);
        assert!(diff(&s, &s.clone()).is_empty());
    }

    #[test]
    fn new_ticket_is_opened() {
        let prev = snapshot(vec![]);
        let curr = snapshot(vec![mk_position(101, 0.0, 0.0)]);

        let events = diff(&prev, &curr);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], CopyEvent::Opened(p) if p.ticket == 101));
    }

    #[test]
    fn vanished_ticket_is_closed_with_last_state() {
        let prev = snapshot(vec![mk_position(101, 1.05, 0.0)]);
        let curr = snapshot(vec![]);

        let events = diff(&prev, &curr);
        assert_eq!(events.len(), 1);
        match &events[0] {
            CopyEvent::Closed { master_ticket, last } => {
                assert_eq!(*master_ticket, 101);
                assert_eq!(last.sl, 1.05);
            }
            other => panic!("expected Closed, got {:?}", other),
        }
    }

    #[test]
    fn sl_or_tp_change_is_modified() {
        let prev = snapshot(vec![mk_position(303, 0.0, 1.20)]);

        let curr = snapshot(vec![mk_position(303, 1.10, 1.20)]);
        let events = diff(&prev, &curr);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], CopyEvent::Modified(p) if p.sl == 1.10));

        // Volume/price changes without SL/TP movement are not modifications.
        let mut same_levels = mk_position(303, 0.0, 1.20);
        same_levels.price_open = 9.9;
        let curr = snapshot(vec![same_levels]);
        assert!(diff(&prev, &curr).is_empty());
    }

    #[test]
    fn closes_precede_modifies_precede_opens() {
        let prev = snapshot(vec![mk_position(1, 0.0, 0.0), mk_position(2, 0.0, 0.0)]);
        let curr = snapshot(vec![mk_position(2, 1.5, 0.0), mk_position(3, 0.0, 0.0)]);

        let kinds: Vec<_> = diff(&prev, &curr).iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["closed", "modified", "opened"]);
    }

    #[test]
    fn categories_are_sorted_by_ticket() {
        let prev = snapshot(vec![
            mk_position(9, 0.0, 0.0),
            mk_position(3, 0.0, 0.0),
            mk_position(7, 0.0, 0.0),
        ]);
        let curr = snapshot(vec![
            mk_position(12, 0.0, 0.0),
            mk_position(4, 0.0, 0.0),
        ]);

        let tickets: Vec<_> = diff(&prev, &curr)
            .iter()
            .map(CopyEvent::master_ticket)
            .collect();
        // closes 3,7,9 then opens 4,12
        assert_eq!(tickets, vec![3, 7, 9, 4, 12]);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use broker::types::Side;
    use proptest::prelude::*;
    use std::collections::{HashMap, HashSet};

    fn arb_snapshot() -> impl Strategy<Value = MasterSnapshot> {
        prop::collection::vec((1u64..50, 0.0f64..2.0, 0.0f64..2.0), 0..12).prop_map(|entries| {
            let mut positions = HashMap::new();
            for (ticket, sl, tp) in entries {
                positions.insert(
                    ticket,
                    Position {
                        ticket,
                        symbol: "EURUSD".to_string(),
                        side: Side::Buy,
                        volume: 1.0,
                        price_open: 1.1,
                        sl,
                        tp,
                        magic: 0,
                        opened_at: 0,
                    },
                );
            }
            MasterSnapshot {
                positions,
                pending_orders: 0,
                captured_at_ms: 0,
            }
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        #[test]
        fn diff_invariants(prev in arb_snapshot(), curr in arb_snapshot()) {
            let events = diff(&prev, &curr);

            // --- Each master ticket appears at most once ---
            let mut seen = HashSet::new();
            for e in &events {
                prop_assert!(seen.insert(e.master_ticket()), "duplicate ticket in diff output");
            }

            // --- Category membership matches set algebra ---
            for e in &events {
                let t = e.master_ticket();
                match e {
                    CopyEvent::Opened(_) => {
                        prop_assert!(curr.positions.contains_key(&t) && !prev.positions.contains_key(&t));
                    }
                    CopyEvent::Closed { .. } => {
                        prop_assert!(prev.positions.contains_key(&t) && !curr.positions.contains_key(&t));
                    }
                    CopyEvent::Modified(p) => {
                        prop_assert!(prev.positions.contains_key(&t) && curr.positions.contains_key(&t));
                        prop_assert!(p.sltp_differs(&prev.positions[&t]));
                    }
                }
            }

            // --- Ordering: closes, then modifies, then opens; ascending tickets within each ---
            let ranks: Vec<u8> = events.iter().map(|e| match e {
                CopyEvent::Closed { .. } => 0,
                CopyEvent::Modified(_) => 1,
                CopyEvent::Opened(_) => 2,
            }).collect();
            prop_assert!(ranks.windows(2).all(|w| w[0] <= w[1]), "category order violated");

            for w in events.windows(2) {
                let same_kind = std::mem::discriminant(&w[0]) == std::mem::discriminant(&w[1]);
                if same_kind {
                    prop_assert!(w[0].master_ticket() < w[1].master_ticket());
                }
            }

            // --- Completeness: every departed and arrived ticket is reported ---
            let reported: HashSet<u64> = events.iter().map(CopyEvent::master_ticket).collect();
            for t in prev.positions.keys() {
                if !curr.positions.contains_key(t) {
                    prop_assert!(reported.contains(t), "missing close for {t}");
                }
            }
            for t in curr.positions.keys() {
                if !prev.positions.contains_key(t) {
                    prop_assert!(reported.contains(t), "missing open for {t}");
                }
            }
        }
    }
}
