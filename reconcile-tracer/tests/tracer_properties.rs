//! Property-based tests for race detection.
//!
//! - Single survivor: however many api fetches start on one key and in
//!   whatever order, exactly one stays pending and it is the latest-started.

use proptest::prelude::*;
use reconcile_tracer::{NewOperation, OperationKind, OperationTracer, TracerConfig};
use reconcile_types::Timestamp;
use std::time::Duration;

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

mod concurrent_fetch_properties {
    use super::*;

    proptest! {
        #[test]
        fn latest_started_fetch_survives(offsets in prop::collection::hash_set(0u64..50_000, 2..8)) {
            let (survivors, latest) = block_on(async {
                let tracer = OperationTracer::new(TracerConfig::default());
                let now = Timestamp::now();
                let mut latest = None;
                let mut newest_at = Timestamp::from_millis(0);

                for offset in &offsets {
                    let at = now - Duration::from_millis(*offset);
                    let id = tracer
                        .start_operation(
                            NewOperation::new(OperationKind::ApiFetch, "k").started_at(at),
                        )
                        .await;
                    if at > newest_at {
                        newest_at = at;
                        latest = Some(id);
                    }
                }

                let survivors: Vec<_> = tracer
                    .active_operations()
                    .await
                    .into_iter()
                    .map(|t| t.id)
                    .collect();
                (survivors, latest)
            });

            prop_assert_eq!(survivors.len(), 1);
            prop_assert_eq!(Some(survivors[0]), latest);
        }
    }
}
