use super::*;
use crate::link::ChannelLink;
use assert_matches::assert_matches;
use std::time::Duration;
use tokio::sync::mpsc;

struct RecordingSink {
    tx: mpsc::UnboundedSender<u8>,
}

impl StatusSink for RecordingSink {
    fn broadcast(&self, frame: &Frame) {
        assert_eq!(frame.header.code, RRCode::Status);
        let _ = self.tx.send(frame.header.modifier);
    }
}

fn admin_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("cmsd-state-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn spawn_broadcaster(
    state: &Arc<ClusterState>,
) -> (mpsc::UnboundedReceiver<u8>, CancellationToken) {
    let (tx, rx) = mpsc::unbounded_channel();
    let cancellation = CancellationToken::new();
    tokio::spawn(
        state
            .clone()
            .run_broadcaster(Arc::new(RecordingSink { tx }), cancellation.clone()),
    );
    (rx, cancellation)
}

async fn next_broadcast(rx: &mut mpsc::UnboundedReceiver<u8>) -> u8 {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("no broadcast")
        .expect("broadcaster gone")
}

async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<u8>) {
    let res = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(res.is_err(), "unexpected broadcast {:?}", res);
}

#[test]
fn test_flags_are_derived_from_inputs() {
    let state = ClusterState::new(2, None, true);
    assert!(state.is_suspended());
    assert!(state.is_no_staging());

    state
        .update(StateUpdate::Counts {
            active: 2,
            staging: 1,
        })
        .unwrap();
    let snap = state.snapshot();
    assert!(!snap.suspended);
    assert!(!snap.no_staging);

    state.update(StateUpdate::FrontEnd(false)).unwrap();
    assert!(state.is_suspended());
    state.update(StateUpdate::FrontEnd(true)).unwrap();
    assert!(!state.is_suspended());

    state.update(StateUpdate::Space(false)).unwrap();
    assert!(state.is_no_staging());
    assert!(!state.is_suspended());
}

#[test]
fn test_counts_never_underflow() {
    let state = ClusterState::new(1, None, true);
    state
        .update(StateUpdate::Counts {
            active: -1,
            staging: -1,
        })
        .unwrap();
    let snap = state.snapshot();
    assert_eq!(snap.num_active, 0);
    assert_eq!(snap.num_staging, 0);
    assert!(snap.suspended);
}

#[test_log::test(tokio::test)]
async fn test_invalid_trigger_is_ignored() {
    let state = Arc::new(ClusterState::new(1, None, true));
    let (mut rx, cancellation) = spawn_broadcaster(&state);
    state.enable();
    next_broadcast(&mut rx).await;

    let before = state.snapshot();
    for code in [5, 9, u8::MAX] {
        state.update_code(code, 1, 1);
        assert_eq!(state.snapshot(), before);
    }
    assert!(state.is_suspended());
    assert!(state.is_no_staging());
    assert_quiet(&mut rx).await;
    cancellation.cancel();

    assert_matches!(
        StateUpdate::from_code(9, 0, 0),
        Err(StateError::InvalidTrigger(9))
    );
    assert_eq!(
        StateUpdate::from_code(0, 0, 0).unwrap(),
        StateUpdate::AdminSuspend(true)
    );
}

#[test]
fn test_admin_suspend_is_idempotent() {
    let dir = admin_dir();
    let state = ClusterState::new(0, Some(dir.clone()), true);

    assert!(state.set_admin_suspend(true).unwrap());
    assert!(!state.set_admin_suspend(true).unwrap());
    assert!(dir.join("SUSPEND").exists());
    assert!(state.is_suspended());

    assert!(state.set_admin_suspend(false).unwrap());
    assert!(!dir.join("SUSPEND").exists());
    assert!(!state.set_admin_suspend(false).unwrap());
}

#[test]
fn test_sentinel_failure_leaves_override_unchanged() {
    let dir = std::env::temp_dir()
        .join(format!("cmsd-missing-{}", uuid::Uuid::new_v4()))
        .join("admin");
    let state = ClusterState::new(0, Some(dir), true);

    assert_matches!(
        state.set_admin_no_stage(true),
        Err(StateError::Sentinel { file: "NOSTAGE", .. })
    );
    assert!(!state.snapshot().admin_no_stage);
}

#[test]
fn test_enable_restores_no_stage_from_file() {
    let dir = admin_dir();
    {
        let state = ClusterState::new(1, Some(dir.clone()), true);
        state.set_admin_no_stage(true).unwrap();
        assert!(dir.join("NOSTAGE").exists());
    }

    let restarted = ClusterState::new(1, Some(dir.clone()), true);
    assert!(!restarted.snapshot().admin_no_stage);
    restarted.enable();
    let snap = restarted.snapshot();
    assert!(snap.admin_no_stage);
    assert!(!snap.admin_suspend);
    assert!(snap.no_staging);
}

#[test]
fn test_concurrent_admin_toggles_are_serialized() {
    let dir = admin_dir();
    let state = Arc::new(ClusterState::new(0, Some(dir.clone()), true));

    let handles: Vec<_> = [true, false]
        .into_iter()
        .map(|start| {
            let state = state.clone();
            std::thread::spawn(move || {
                let mut on = start;
                for _ in 0..200 {
                    state.set_admin_suspend(on).unwrap();
                    on = !on;
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let snap = state.snapshot();
    assert_eq!(snap.admin_suspend, dir.join("SUSPEND").exists());
    assert_eq!(snap.suspended, snap.admin_suspend);
}

#[test]
fn test_send_state_reports_composite() {
    let state = ClusterState::new(1, None, true);
    state
        .update(StateUpdate::Counts {
            active: 1,
            staging: 0,
        })
        .unwrap();

    let (link, mut rx) = ChannelLink::new("mgr", None);
    state.send_state(link.as_ref()).unwrap();

    let frame = Frame::decode(rx.try_recv().unwrap()).unwrap();
    assert_eq!(frame.header.code, RRCode::Status);
    assert_eq!(frame.header.modifier, modifier::RESUME | modifier::NO_STAGE);
}

#[test]
fn test_status_modifier() {
    assert_eq!(status_modifier(0, ALL_SUSPEND), None);
    assert_eq!(
        status_modifier(ALL_SUSPEND, ALL_SUSPEND),
        Some(modifier::SUSPEND)
    );
    assert_eq!(
        status_modifier(ALL_SUSPEND | ALL_NOSTAGE, ALL_NOSTAGE),
        Some(modifier::RESUME | modifier::NO_STAGE)
    );
    assert_eq!(status_modifier(ALL_NOSTAGE, 0), Some(modifier::STAGE));
}

#[test_log::test(tokio::test)]
async fn test_no_broadcast_before_enable() {
    let state = Arc::new(ClusterState::new(1, None, true));
    let (mut rx, cancellation) = spawn_broadcaster(&state);

    state
        .update(StateUpdate::Counts {
            active: 1,
            staging: 1,
        })
        .unwrap();
    assert_quiet(&mut rx).await;

    state.enable();
    assert_eq!(next_broadcast(&mut rx).await, modifier::RESUME | modifier::STAGE);
    cancellation.cancel();
}

#[test_log::test(tokio::test)]
async fn test_losing_an_active_node_suspends_once() {
    let state = Arc::new(ClusterState::new(2, None, true));
    let (mut rx, cancellation) = spawn_broadcaster(&state);

    state
        .update(StateUpdate::Counts {
            active: 2,
            staging: 2,
        })
        .unwrap();
    state.enable();
    assert_eq!(next_broadcast(&mut rx).await, modifier::RESUME | modifier::STAGE);

    state
        .update(StateUpdate::Counts {
            active: -1,
            staging: -1,
        })
        .unwrap();
    assert!(state.is_suspended());
    assert_eq!(next_broadcast(&mut rx).await, modifier::SUSPEND);
    assert_quiet(&mut rx).await;

    cancellation.cancel();
}

#[test_log::test(tokio::test)]
async fn test_unchanged_update_does_not_broadcast() {
    let state = Arc::new(ClusterState::new(1, None, true));
    let (mut rx, cancellation) = spawn_broadcaster(&state);

    state.enable();
    next_broadcast(&mut rx).await;

    state.update(StateUpdate::FrontEnd(true)).unwrap();
    state.update(StateUpdate::Space(true)).unwrap();
    assert_quiet(&mut rx).await;

    cancellation.cancel();
}
