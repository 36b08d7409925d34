mod common;

use common::{monday, schedule, Fixture};
use relay_engine::{EngineError, LogLevel, ScheduleRequest, ServiceState};
use std::time::Duration;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

#[tokio::test(start_paused = true)]
async fn monday_schedule_turns_on_and_off() {
    let rule = schedule(1, vec![1], "08:00", "18:00");
    let fx = Fixture::with_schedules(monday(7, 59, 0), vec![rule.clone()]);
    fx.service.init().await.unwrap();
    assert_eq!(fx.service.get_status().trigger_count, 1);

    fx.advance(MINUTE + Duration::from_secs(1)).await;
    assert_eq!(fx.actuators.level(1), Some(true));

    let pending = fx.service.pending_deactivations();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].due_at, monday(18, 0, 0));
    assert_eq!(pending[0].origin_rule_id, rule.id);

    fx.advance(10 * HOUR).await;
    assert_eq!(fx.actuators.level(1), Some(false));
    assert!(fx.service.pending_deactivations().is_empty());

    let logs = fx.store.logs();
    assert_eq!(logs.len(), 2);
    assert!(logs[0].message.contains("ON"));
    assert!(logs[0].message.contains(&format!("schedule {} start", rule.id)));
    assert!(logs[1].message.contains("OFF"));
    assert!(logs.iter().all(|l| l.level == LogLevel::Info));

    let state = &fx.service.actuator_states()[0];
    assert!(!state.level);
    assert_eq!(state.last_changed_at, monday(18, 0, 0));

    // Nothing fires again until next Monday
    fx.advance(24 * HOUR).await;
    assert_eq!(fx.store.logs().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn overnight_schedule_wraps_midnight() {
    let rule = schedule(2, vec![1], "22:00", "06:00");
    let fx = Fixture::with_schedules(monday(21, 0, 0), vec![rule]);
    fx.service.init().await.unwrap();

    fx.advance(HOUR + Duration::from_secs(1)).await;
    assert_eq!(fx.actuators.level(2), Some(true));
    assert_eq!(
        fx.service.pending_deactivations()[0].due_at,
        monday(6, 0, 0) + chrono::Duration::days(1)
    );

    fx.advance(8 * HOUR).await;
    assert_eq!(fx.actuators.level(2), Some(false));
}

#[tokio::test(start_paused = true)]
async fn multi_day_schedule_gets_one_trigger_per_day() {
    let fx = Fixture::with_schedules(
        monday(7, 0, 0),
        vec![
            schedule(1, vec![1, 2, 3], "08:00", "08:30"),
            schedule(2, vec![0], "09:00", "10:00"),
        ],
    );
    fx.service.init().await.unwrap();

    let status = fx.service.get_status();
    assert_eq!(status.schedule_count, 2);
    assert_eq!(status.trigger_count, 4);

    // Monday and Tuesday firings of the first schedule
    fx.advance(26 * HOUR).await;
    let ons = fx
        .store
        .logs()
        .iter()
        .filter(|l| l.message.contains("Actuator 1 ON"))
        .count();
    assert_eq!(ons, 2);
}

#[tokio::test(start_paused = true)]
async fn restart_twice_keeps_one_trigger_set() {
    let fx = Fixture::with_schedules(
        monday(7, 0, 0),
        vec![
            schedule(1, vec![1, 2], "08:00", "09:00"),
            schedule(3, vec![1], "08:00", "08:15"),
        ],
    );
    fx.service.init().await.unwrap();
    let once = fx.service.get_status();

    fx.service.restart().await.unwrap();
    fx.service.restart().await.unwrap();
    let twice = fx.service.get_status();
    assert_eq!(once, twice);
    assert_eq!(twice.trigger_count, 3);

    fx.advance(HOUR + Duration::from_secs(1)).await;
    let logs = fx.store.logs();
    assert_eq!(logs.len(), 2, "each schedule fired once: {logs:?}");
    assert_eq!(fx.actuators.write_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn trigger_due_during_restart_window_never_fires() {
    let rule = schedule(1, vec![1], "08:00", "09:00");
    let fx = Fixture::with_schedules(monday(7, 59, 0), vec![rule.clone()]);
    fx.service.init().await.unwrap();

    tokio::time::sleep(Duration::from_millis(59_900)).await;
    fx.service.stop().await.unwrap();
    assert_eq!(fx.service.state(), ServiceState::Stopped);

    // Rule removed while stopped; the old trigger must not survive into the new session
    fx.service.delete_schedule(&rule.id).await.unwrap();
    fx.service.init().await.unwrap();
    assert_eq!(fx.service.get_status().trigger_count, 0);

    fx.advance(HOUR).await;
    assert_eq!(fx.actuators.level(1), Some(false));
    assert_eq!(fx.actuators.write_count(), 0);
    assert!(fx.store.logs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn overlapping_schedule_takeover_is_audited() {
    let outer = schedule(1, vec![1], "08:00", "10:00");
    let inner = schedule(1, vec![1], "09:00", "09:30");
    let fx = Fixture::with_schedules(monday(7, 59, 0), vec![outer.clone(), inner.clone()]);
    fx.service.init().await.unwrap();

    fx.advance(HOUR + Duration::from_secs(1)).await;
    let pending = fx.service.pending_deactivations();
    assert_eq!(pending[0].origin_rule_id, inner.id);
    assert_eq!(pending[0].due_at, monday(9, 30, 0));
    assert_eq!(fx.actuators.write_count(), 1);

    let logs = fx.store.logs();
    assert_eq!(logs.len(), 2);
    assert!(logs[0].message.contains(&outer.id));
    assert!(logs[1].message.contains("already ON"));
    assert!(logs[1].message.contains(&format!("schedule {} start", inner.id)));
    assert!(fx.service.actuator_states()[0].last_reason.contains(&inner.id));

    // Last writer wins: the inner end turns the actuator off, the outer end is gone
    fx.advance(HOUR).await;
    assert_eq!(fx.actuators.level(1), Some(false));
    let logs = fx.store.logs();
    assert_eq!(logs.len(), 3);
    assert!(logs[2].message.contains(&format!("schedule {} end", inner.id)));
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_pending_deactivation_and_keeps_level() {
    let rule = schedule(1, vec![1], "08:00", "09:00");
    let fx = Fixture::with_schedules(monday(7, 59, 0), vec![rule]);
    fx.service.init().await.unwrap();

    fx.advance(2 * MINUTE).await;
    assert_eq!(fx.actuators.level(1), Some(true));
    assert_eq!(fx.service.get_status().pending_timer_count, 1);

    fx.service.stop().await.unwrap();
    let status = fx.service.get_status();
    assert!(!status.running);
    assert_eq!(status.pending_timer_count, 0);
    assert_eq!(status.trigger_count, 0);

    fx.advance(2 * HOUR).await;
    assert_eq!(fx.actuators.level(1), Some(true));
    assert_eq!(fx.store.logs().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn invalid_schedule_is_rejected_without_blocking_others() {
    let bad = schedule(1, vec![1], "24:00", "06:00");
    let good = schedule(2, vec![1], "08:00", "09:00");
    let fx = Fixture::with_schedules(monday(7, 0, 0), vec![bad.clone(), good]);
    fx.service.init().await.unwrap();

    assert_eq!(fx.service.get_status().trigger_count, 1);
    let logs = fx.store.logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].level, LogLevel::Warn);
    assert!(logs[0].message.contains(&bad.id));

    fx.advance(HOUR + MINUTE).await;
    assert_eq!(fx.actuators.level(2), Some(true));
    assert_eq!(fx.actuators.level(1), Some(false));
}

#[tokio::test(start_paused = true)]
async fn failed_write_is_logged_and_other_actuators_proceed() {
    let fx = Fixture::with_schedules(
        monday(7, 59, 0),
        vec![
            schedule(1, vec![1], "08:00", "09:00"),
            schedule(2, vec![1], "08:00", "09:00"),
        ],
    );
    fx.actuators.set_faulty(1, true);
    fx.service.init().await.unwrap();

    fx.advance(2 * MINUTE).await;
    assert_eq!(fx.actuators.level(2), Some(true));

    let states = fx.service.actuator_states();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].actuator_id, 2);

    // No auto-off is armed for a write that never happened
    let pending = fx.service.pending_deactivations();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].actuator_id, 2);

    let logs = fx.store.logs();
    assert_eq!(logs.len(), 2);
    assert_eq!(
        logs.iter().filter(|l| l.level == LogLevel::Error).count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn audit_log_failure_does_not_stop_transitions() {
    let rule = schedule(1, vec![1], "08:00", "08:05");
    let fx = Fixture::with_schedules(monday(7, 59, 0), vec![rule]);
    fx.store.set_log_failing(true);
    fx.service.init().await.unwrap();

    fx.advance(2 * MINUTE).await;
    assert_eq!(fx.actuators.level(1), Some(true));
    fx.advance(5 * MINUTE).await;
    assert_eq!(fx.actuators.level(1), Some(false));
    assert!(fx.store.logs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unreachable_store_blocks_init() {
    let fx = Fixture::with_schedules(monday(7, 0, 0), vec![schedule(1, vec![1], "08:00", "09:00")]);
    fx.store.set_unavailable(true);

    let err = fx.service.init().await.unwrap_err();
    assert!(matches!(err, EngineError::Persistence(_)));
    let status = fx.service.get_status();
    assert_eq!(status.state, ServiceState::Stopped);
    assert!(!status.running);

    fx.store.set_unavailable(false);
    fx.service.init().await.unwrap();
    assert!(fx.service.get_status().running);
    assert!(matches!(
        fx.service.init().await,
        Err(EngineError::AlreadyRunning)
    ));
}

#[tokio::test(start_paused = true)]
async fn crud_changes_apply_through_restart() {
    let fx = Fixture::with_schedules(monday(7, 0, 0), Vec::new());
    fx.service.init().await.unwrap();
    assert_eq!(fx.service.get_status().trigger_count, 0);

    let created = fx
        .service
        .create_schedule(ScheduleRequest {
            actuator_id: 1,
            days: vec![1, 2],
            start_time: "08:00".into(),
            end_time: "09:00".into(),
            enabled: true,
        })
        .await
        .unwrap();
    assert_eq!(fx.service.get_status().trigger_count, 2);

    let invalid = fx
        .service
        .create_schedule(ScheduleRequest {
            actuator_id: 9,
            days: vec![1],
            start_time: "08:00".into(),
            end_time: "09:00".into(),
            enabled: true,
        })
        .await;
    assert!(matches!(invalid, Err(EngineError::Configuration(_))));
    assert_eq!(fx.service.list_schedules().await.unwrap().len(), 1);

    fx.service
        .update_schedule(
            &created.id,
            ScheduleRequest {
                actuator_id: 1,
                days: vec![1],
                start_time: "07:30".into(),
                end_time: "07:45".into(),
                enabled: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(fx.service.get_status().trigger_count, 1);

    fx.service
        .set_schedule_enabled(&created.id, false)
        .await
        .unwrap();
    assert_eq!(fx.service.get_status().trigger_count, 0);
    assert_eq!(fx.service.get_status().schedule_count, 1);

    fx.service.delete_schedule(&created.id).await.unwrap();
    assert_eq!(fx.service.get_status().schedule_count, 0);
    assert!(matches!(
        fx.service.delete_schedule(&created.id).await,
        Err(EngineError::NotFound(_))
    ));

    fx.advance(2 * HOUR).await;
    assert_eq!(fx.actuators.write_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn manual_override_goes_through_executor() {
    let fx = Fixture::with_schedules(monday(7, 0, 0), Vec::new());
    assert!(matches!(
        fx.service.set_actuator(3, true).await,
        Err(EngineError::NotRunning)
    ));

    fx.service.init().await.unwrap();
    fx.service.set_actuator(3, true).await.unwrap();
    assert_eq!(fx.actuators.level(3), Some(true));
    assert!(fx.service.actuator_level(3).unwrap());
    assert!(matches!(
        fx.service.set_actuator(9, true).await,
        Err(EngineError::Configuration(_))
    ));

    let logs = fx.store.logs();
    assert_eq!(logs.len(), 1);
    assert!(logs[0].message.contains("manual"));
}
