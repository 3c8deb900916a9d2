// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use berth_core::test_support::slots;

fn candidate(id: &str, enqueued_at_ms: u64) -> PendingCandidate {
    PendingCandidate {
        id: SessionId::new(id),
        enqueued_at_ms,
        priority: 0,
        total_slots: slots(&[("cpu", 2_000)]),
        starts_at_ms: None,
        dependencies: Vec::new(),
        owner_scope: Scope::Keypair(format!("ak-{id}")),
    }
}

fn view() -> QueueView {
    QueueView {
        now_ms: 10_000,
        retries: HashMap::new(),
        hol_block_threshold: 2,
        hol_overtake_window: 5,
        fits: HashMap::new(),
        blocked: HashMap::new(),
        shares: HashMap::new(),
    }
}

#[test]
fn fifo_attempts_only_the_head() {
    let pending = vec![candidate("s-2", 200), candidate("s-1", 100), candidate("s-3", 300)];
    let ranked = FifoPolicy.rank(&pending, &view());
    // Oldest first, and strictly nothing behind the barrier.
    assert_eq!(ranked, vec![SessionId::new("s-1")]);
}

#[test]
fn fifo_defers_head_past_threshold() {
    let pending = vec![candidate("s-1", 100), candidate("s-2", 200), candidate("s-3", 300)];
    let mut v = view();
    v.retries.insert(SessionId::new("s-1"), 2);

    let ranked = FifoPolicy.rank(&pending, &v);
    // The blocked head is bypassed; the next candidate becomes the barrier,
    // and the deferred head stays attemptable at the tail.
    assert_eq!(ranked, vec![SessionId::new("s-2"), SessionId::new("s-1")]);
}

#[test]
fn fifo_head_returns_to_front_after_overtake_window() {
    let pending = vec![candidate("s-1", 100), candidate("s-2", 200)];
    let mut v = view();
    // threshold 2, window 5: retries 2..6 are the bypass phase, 7 is the
    // fresh head attempt.
    v.retries.insert(SessionId::new("s-1"), 7);

    let ranked = FifoPolicy.rank(&pending, &v);
    assert_eq!(ranked, vec![SessionId::new("s-1")]);
}

#[test]
fn fifo_bypass_updates_bump_deferred_heads() {
    let pending = vec![candidate("s-1", 100), candidate("s-2", 200)];
    let mut v = view();
    v.retries.insert(SessionId::new("s-1"), 3);

    let updates = FifoPolicy.bypass_updates(&SessionId::new("s-2"), &pending, &v);
    assert_eq!(updates, vec![(SessionId::new("s-1"), 4)]);

    // Placing the oldest bumps nobody.
    let updates = FifoPolicy.bypass_updates(&SessionId::new("s-1"), &pending, &v);
    assert!(updates.is_empty());
}

#[test]
fn fifo_orders_by_starts_at_before_enqueue_time() {
    let mut early_start = candidate("s-2", 200);
    early_start.starts_at_ms = Some(1_000);
    let pending = vec![candidate("s-1", 100), early_start];
    // s-1 has no starts_at (sorts as 0), so it still precedes.
    let ranked = FifoPolicy.rank(&pending, &view());
    assert_eq!(ranked[0], SessionId::new("s-1"));
}

#[test]
fn future_starts_at_excludes_candidate() {
    let mut future = candidate("s-1", 100);
    future.starts_at_ms = Some(99_999);
    let pending = vec![future, candidate("s-2", 200)];
    let ranked = FifoPolicy.rank(&pending, &view());
    assert_eq!(ranked, vec![SessionId::new("s-2")]);
}

#[test]
fn past_starts_at_is_eligible_now() {
    let mut past = candidate("s-1", 100);
    past.starts_at_ms = Some(5);
    assert!(past.eligible_at(10_000));
}

#[test]
fn dependency_blocked_candidates_are_invisible() {
    let pending = vec![candidate("s-1", 100), candidate("s-2", 200)];
    let mut v = view();
    v.blocked.insert(SessionId::new("s-1"), true);
    let ranked = FifoPolicy.rank(&pending, &v);
    assert_eq!(ranked, vec![SessionId::new("s-2")]);
}

#[test]
fn drf_prefers_lowest_dominant_share() {
    let pending = vec![candidate("s-a", 100), candidate("s-b", 200)];
    let mut v = view();
    v.shares.insert(SessionId::new("s-a"), 0.4);
    v.shares.insert(SessionId::new("s-b"), 0.1);

    let ranked = DrfPolicy.rank(&pending, &v);
    assert_eq!(ranked, vec![SessionId::new("s-b"), SessionId::new("s-a")]);
}

#[test]
fn drf_breaks_ties_by_enqueue_time() {
    let pending = vec![candidate("s-b", 200), candidate("s-a", 100)];
    let mut v = view();
    v.shares.insert(SessionId::new("s-a"), 0.3);
    v.shares.insert(SessionId::new("s-b"), 0.3);

    let ranked = DrfPolicy.rank(&pending, &v);
    assert_eq!(ranked, vec![SessionId::new("s-a"), SessionId::new("s-b")]);
}

#[test]
fn priority_ranks_high_first_fifo_within() {
    let mut low = candidate("s-low", 100);
    low.priority = 1;
    let mut high_late = candidate("s-high-late", 300);
    high_late.priority = 9;
    let mut high_early = candidate("s-high-early", 200);
    high_early.priority = 9;

    let ranked = PriorityPolicy.rank(&[low, high_late, high_early], &view());
    assert_eq!(
        ranked,
        vec![
            SessionId::new("s-high-early"),
            SessionId::new("s-high-late"),
            SessionId::new("s-low"),
        ]
    );
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    fn arb_candidates() -> impl Strategy<Value = Vec<PendingCandidate>> {
        proptest::collection::vec((0u64..1_000, proptest::option::of(0u64..20_000)), 0..12)
            .prop_map(|entries| {
                entries
                    .into_iter()
                    .enumerate()
                    .map(|(i, (enqueued_at_ms, starts_at_ms))| {
                        let mut c = candidate(&format!("s-{i}"), enqueued_at_ms);
                        c.starts_at_ms = starts_at_ms;
                        c
                    })
                    .collect()
            })
    }

    proptest! {
        /// Every policy ranks a subset of the eligible pending sessions,
        /// with no duplicates, under arbitrary retry counters.
        #[test]
        fn rank_is_a_set_of_eligible_candidates(
            pending in arb_candidates(),
            retry_seed in proptest::collection::vec(0u32..10, 0..12),
        ) {
            let mut v = view();
            for (candidate, retries) in pending.iter().zip(retry_seed) {
                v.retries.insert(candidate.id.clone(), retries);
            }

            for policy in [
                Box::new(FifoPolicy) as Box<dyn SessionSelector>,
                Box::new(DrfPolicy),
                Box::new(PriorityPolicy),
            ] {
                let ranked = policy.rank(&pending, &v);
                let mut seen = std::collections::HashSet::new();
                for id in &ranked {
                    prop_assert!(seen.insert(id.clone()), "{} ranked twice", id);
                    let c = pending.iter().find(|c| &c.id == id);
                    prop_assert!(c.is_some(), "{} not pending", id);
                    prop_assert!(
                        c.is_some_and(|c| c.eligible_at(v.now_ms)),
                        "{} not eligible yet",
                        id
                    );
                }
            }
        }
    }
}

#[test]
fn fits_group_capacity_sums_free_slots() {
    let c = PendingCandidate {
        total_slots: slots(&[("cpu", 4_000)]),
        ..candidate("s-1", 100)
    };
    let free = vec![slots(&[("cpu", 2_000)]), slots(&[("cpu", 2_000)])];
    assert!(fits_group_capacity(&c, &free));
    let free = vec![slots(&[("cpu", 2_000)]), slots(&[("cpu", 1_000)])];
    assert!(!fits_group_capacity(&c, &free));
}
