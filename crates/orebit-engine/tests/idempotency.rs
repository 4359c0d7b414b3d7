//! Applying a ledger key any number of times has the effect of applying it once

use chrono::{TimeZone, Utc};
use orebit_core::{LedgerDelta, ManualClock, SourceKind, UserId};
use orebit_engine::{RetryConfig, RetryPolicy, RewardLedger};
use orebit_storage::{Fault, MemoryRemoteStore, RemoteStore, StoreOp};
use proptest::prelude::*;
use std::sync::Arc;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn repeated_apply_credits_once(
        xp in 1u64..10_000,
        coins in 0i64..1_000_000_000,
        repeats in 1usize..12,
        lost in 0u32..3,
    ) {
        let (total_xp, balance, entries) = runtime().block_on(async {
            let store = Arc::new(MemoryRemoteStore::new());
            let now = Utc.with_ymd_and_hms(2026, 9, 1, 0, 0, 0).unwrap();
            let clock = Arc::new(ManualClock::new(now));
            let ledger = RewardLedger::new(
                store.clone(),
                RetryPolicy::new(RetryConfig::default()),
                clock,
                chrono::Duration::seconds(60),
                8,
            );
            let user = UserId::from("prop");
            store.ensure_user(&user, now).await.unwrap();
            if lost > 0 {
                store.inject(StoreOp::CommitLedger, Fault::LoseResponse { times: lost });
            }

            let delta = LedgerDelta {
                xp,
                balance: coins,
                ..Default::default()
            };
            for _ in 0..repeats {
                let _ = ledger
                    .apply(&user, SourceKind::Achievement, "prop-rule", delta.clone())
                    .await;
            }

            let record = store.get_user_state(&user).await.unwrap();
            (record.total_xp, record.balance, store.ledger_for(&user).len())
        });

        prop_assert_eq!(total_xp, xp);
        prop_assert_eq!(balance, coins as u64);
        prop_assert_eq!(entries, 1);
    }
}
