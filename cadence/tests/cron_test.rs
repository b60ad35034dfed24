//! Cron parsing and leader-elected scheduling
//!
//! This test verifies that:
//! 1. Expressions parse to the expected field sets and next times
//! 2. Invalid expressions are rejected as invalid arguments
//! 3. Two orchestrators sharing a lock elect exactly one cron leader

use cadence::prelude::*;
use cadence::{LeaderConfig, LeaderScheduler};
use chrono::{TimeZone, Utc};
use std::time::Duration;

#[test]
fn test_quarter_hour_round_trip() {
    let expression = CronExpression::parse("*/15 * * * *").unwrap();
    assert_eq!(expression.fields().minutes, vec![0, 15, 30, 45]);
    assert_eq!(expression.fields().hours.len(), 24);

    let after = Utc.with_ymd_and_hms(2024, 1, 1, 0, 7, 0).unwrap();
    assert_eq!(
        expression.next_execution(after).unwrap(),
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 15, 0).unwrap()
    );
}

#[test]
fn test_next_execution_examples() {
    let cases = [
        // weekdays at 09:30
        ("30 9 * * 1-5", (2024, 3, 8, 10, 0), (2024, 3, 11, 9, 30)),
        // first of the month at midnight
        ("0 0 1 * *", (2024, 1, 31, 12, 0), (2024, 2, 1, 0, 0)),
        // leap day
        ("0 12 29 2 *", (2024, 3, 1, 0, 0), (2028, 2, 29, 12, 0)),
        // lists and ranges with steps
        ("5,10 0-6/3 * * *", (2024, 1, 1, 0, 10), (2024, 1, 1, 3, 5)),
    ];

    for (expression, (y, mo, d, h, mi), (ey, emo, ed, eh, emi)) in cases {
        let parsed = CronExpression::parse(expression).unwrap();
        let after = Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap();
        let expected = Utc.with_ymd_and_hms(ey, emo, ed, eh, emi, 0).unwrap();
        assert_eq!(parsed.next_execution(after).unwrap(), expected, "{}", expression);
    }
}

#[test]
fn test_invalid_expressions() {
    for expression in ["", "* * * *", "60 * * * *", "* 24 * * *", "*/0 * * * *", "a b c d e"] {
        assert!(
            matches!(CronExpression::parse(expression), Err(Error::InvalidArgument(_))),
            "{:?} should be rejected",
            expression
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_one_cron_leader_across_orchestrators() {
    let lock: Arc<dyn DistributedLock> = Arc::new(InMemoryLock::new());
    let config = LeaderConfig::default()
        .with_lock_ttl(Duration::from_secs(3))
        .with_refresh_interval(Duration::from_secs(1))
        .with_retry_delay(Duration::from_secs(1));

    let leaders: Vec<Arc<LeaderScheduler>> = (0..2)
        .map(|_| {
            Arc::new(LeaderScheduler::with_config(
                Arc::new(MinuteScheduler::new()),
                Arc::clone(&lock),
                config.clone(),
            ))
        })
        .collect();
    let orchestrators: Vec<Orchestrator> = leaders
        .iter()
        .map(|leader| {
            Orchestrator::builder()
                .with_scheduler(Arc::clone(leader) as Arc<dyn CronScheduler>)
                .build()
        })
        .collect();

    for orchestrator in &orchestrators {
        orchestrator
            .register_cron_event("heartbeat", "* * * * *", "heartbeat", serde_json::Value::Null)
            .unwrap();
        orchestrator.start().await.unwrap();
    }
    tokio::time::sleep(Duration::from_secs(5)).await;

    let leading = leaders.iter().filter(|leader| leader.is_leader()).count();
    assert_eq!(leading, 1);
    assert!(orchestrators[0].is_cron_job_scheduled("heartbeat").unwrap());

    orchestrators[0].stop().await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(leaders[1].is_leader());
    orchestrators[1].stop().await.unwrap();
}
