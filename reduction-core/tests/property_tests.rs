//! Property-based tests for reduction invariants
//!
//! These tests use proptest to verify critical invariants:
//! - Split conservation: shares sum to the total to the cent
//! - Last-writer-wins: delivery order does not change the aggregate
//! - Funding conservation: a leaf never counts more than it needs
//! - Hold bound: a shard never holds more than it has
//! - Deterministic replay: same journal → same state

use chrono::Utc;
use proptest::prelude::*;
use reduction_core::{
    config::TreeConfig,
    entity::NullSink,
    reduction::Reduction,
    split::{distribute, share_count, split_by_cap, split_with_fan_out},
    storage::MemoryJournal,
    AccountId, Amount, Command, Config, DepositShard, Entity, FundingLeaf, LeafCommand, RootId,
    Runtime, ShardCommand, ShardId, TreeId,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Strategy for generating positive amounts in cents
fn cents_strategy() -> impl Strategy<Value = i64> {
    1i64..10_000_000i64
}

fn claimant(n: usize) -> TreeId {
    RootId::new(AccountId::new("acct"), "wd")
        .unwrap()
        .trunk()
        .child(n)
}

fn shard(n: usize) -> ShardId {
    ShardId::new(AccountId::new("acct"), format!("dep{}", n)).unwrap()
}

#[derive(Debug, Clone)]
enum ShardOp {
    Withdraw(usize, i64),
    Cancel(usize),
}

fn shard_op_strategy() -> impl Strategy<Value = ShardOp> {
    prop_oneof![
        (1usize..6, 1i64..5_000).prop_map(|(c, a)| ShardOp::Withdraw(c, a)),
        (1usize..6).prop_map(ShardOp::Cancel),
    ]
}

fn to_command(op: &ShardOp) -> ShardCommand {
    match op {
        ShardOp::Withdraw(c, a) => ShardCommand::Withdraw {
            claimant: claimant(*c),
            amount: Amount::from_cents(*a),
        },
        ShardOp::Cancel(c) => ShardCommand::CancelWithdrawal {
            claimant: claimant(*c),
        },
    }
}

fn apply<E: Entity>(state: &mut E, id: &E::Id, command: &E::Command) {
    if let Ok(events) = state.decide(id, command, &TreeConfig::default()) {
        for event in &events {
            state.evolve(event, Utc::now());
        }
    }
}

proptest! {
    /// Property: shares cover the total exactly, none exceeds the cap,
    /// and exactly `Tc mod N` shares carry the extra cent
    #[test]
    fn prop_split_conserves_total(total in cents_strategy(), cap in 1i64..1_000_000i64) {
        let total_amount = Amount::from_cents(total);
        let cap_amount = Amount::from_cents(cap);
        let shares = split_by_cap(total_amount, cap_amount).unwrap();
        let n = share_count(total_amount, cap_amount).unwrap();

        prop_assert_eq!(shares.len(), n);
        prop_assert_eq!(n as i64, (total + cap - 1) / cap);
        prop_assert_eq!(shares.iter().sum::<Amount>(), total_amount);
        prop_assert!(shares.iter().all(|s| *s <= cap_amount));

        let base = total / n as i64;
        let extra = shares.iter().filter(|s| s.cents().unwrap() == base + 1).count();
        prop_assert_eq!(extra as i64, total % n as i64);
        // remainder-bearing shares come first
        prop_assert!(shares.windows(2).all(|w| w[0] >= w[1]));
    }

    /// Property: fan-out bounds the number of children without losing cents
    #[test]
    fn prop_fan_out_bound(total in cents_strategy(), fan_out in 2usize..50) {
        let total_amount = Amount::from_cents(total);
        let shares = split_with_fan_out(total_amount, Amount::from_cents(2_500), fan_out).unwrap();
        prop_assert!(shares.len() <= fan_out);
        prop_assert_eq!(shares.iter().sum::<Amount>(), total_amount);
    }

    /// Property: distribute yields shares differing by at most one cent
    #[test]
    fn prop_distribute_is_even(total in 0i64..1_000_000, n in 1usize..200) {
        let shares = distribute(Amount::from_cents(total), n).unwrap();
        let max = shares.iter().max().unwrap().cents().unwrap();
        let min = shares.iter().min().unwrap().cents().unwrap();
        prop_assert!(max - min <= 1);
    }

    /// Property: the aggregate depends only on the newest report per child
    #[test]
    fn prop_last_writer_wins_order_independent(
        reports in prop::collection::vec((0u8..6, 0i64..100_000, 1u64..64), 1..40)
            .prop_shuffle()
    ) {
        let mut seen = HashSet::new();
        let reports: Vec<_> = reports
            .into_iter()
            .filter(|(child, _, seq)| seen.insert((*child, *seq)))
            .collect();

        let mut forward: Reduction<u8> = Reduction::open();
        for (child, amount, seq) in &reports {
            forward.apply(*child, Amount::from_cents(*amount), *seq);
        }

        let mut backward: Reduction<u8> = Reduction::open();
        for (child, amount, seq) in reports.iter().rev() {
            backward.apply(*child, Amount::from_cents(*amount), *seq);
            // duplicates are harmless
            backward.apply(*child, Amount::from_cents(*amount), *seq);
        }

        let mut newest: BTreeMap<u8, (u64, i64)> = BTreeMap::new();
        for (child, amount, seq) in &reports {
            let entry = newest.entry(*child).or_insert((*seq, *amount));
            if *seq > entry.0 {
                *entry = (*seq, *amount);
            }
        }
        let expected: Amount = newest.values().map(|(_, a)| Amount::from_cents(*a)).sum();

        prop_assert_eq!(forward.aggregate(), expected);
        prop_assert_eq!(backward.aggregate(), expected);
    }

    /// Property: funded == Σ contributions and never exceeds what is needed
    #[test]
    fn prop_leaf_funding_conservation(
        needed in 1i64..2_500,
        grants in prop::collection::vec((1usize..5, 0i64..3_000), 1..30)
    ) {
        let id = claimant(1);
        let mut leaf = FundingLeaf::default();
        apply(&mut leaf, &id, &LeafCommand::Create {
            parent: Some(RootId::new(AccountId::new("acct"), "wd").unwrap().trunk()),
            amount: Amount::from_cents(needed),
        });

        for (s, offer) in grants {
            if leaf.funded {
                break;
            }
            // a shard grants at most what the leaf asked it to hold
            let held = leaf.contributions.get(&shard(s)).copied().unwrap_or(Amount::ZERO);
            let ask = leaf.amount_needed - leaf.amount_funded + held;
            let granted = Amount::from_cents(offer).min(ask).max(held);
            apply(&mut leaf, &id, &LeafCommand::DepositFound { shard: shard(s), amount: granted });

            prop_assert_eq!(leaf.amount_funded, leaf.contributions.values().copied().sum::<Amount>());
            prop_assert!(leaf.amount_funded <= leaf.amount_needed);
            prop_assert_eq!(leaf.funded, leaf.amount_funded == leaf.amount_needed);
        }
    }

    /// Property: holds never exceed the shard's amount
    #[test]
    fn prop_shard_holds_bounded(
        deposit in 1i64..2_500,
        ops in prop::collection::vec(shard_op_strategy(), 1..50)
    ) {
        let id = shard(1);
        let mut state = DepositShard::default();
        apply(&mut state, &id, &ShardCommand::ModifyAmount { amount: Amount::from_cents(deposit) });

        for op in &ops {
            apply(&mut state, &id, &to_command(op));
            prop_assert!(state.held() <= state.current_amount);
            prop_assert!(!state.available().is_negative());
            prop_assert!(state.holds.values().all(|h| h.is_positive()));
        }
    }

    /// Property: entity state is deterministically rebuilt from its journal
    #[test]
    fn prop_deterministic_replay(
        deposit in 1i64..10_000,
        ops in prop::collection::vec(shard_op_strategy(), 1..20)
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let journal = Arc::new(MemoryJournal::new());
            let config = Config::in_memory();
            let id = shard(1);

            let runtime = Runtime::new(&config, journal.clone(), Arc::new(NullSink)).unwrap();
            runtime
                .dispatch(Command::Shard {
                    id: id.clone(),
                    command: ShardCommand::ModifyAmount { amount: Amount::from_cents(deposit) },
                })
                .await
                .unwrap();
            for op in &ops {
                let _ = runtime
                    .dispatch(Command::Shard { id: id.clone(), command: to_command(op) })
                    .await;
            }
            let before = runtime.shard(&id).await.unwrap();
            runtime.shutdown().await;

            let rebuilt = Runtime::new(&config, journal, Arc::new(NullSink)).unwrap();
            let after = rebuilt.shard(&id).await.unwrap();
            prop_assert_eq!(before, after);
            rebuilt.shutdown().await;
            Ok(())
        })?;
    }
}
