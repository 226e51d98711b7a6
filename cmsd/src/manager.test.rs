use crate::security::AuthError;
use crate::test_utils::prelude::*;
use crate::wire::{ErrorCode, PrepAdd};

use super::*;

#[test]
fn test_heartbeat_disconnects_silent_node() {
    let cluster = TestCluster::new(1);
    let mut node = cluster.login(TestLogin::server("data01").writable("/store"));

    cluster.manager.heartbeat();
    assert!(node.node.flags().ping_pending);
    assert_eq!(node.frames()[0].header.code, RRCode::Ping);

    node.request(&cluster, Request::Pong).unwrap();
    cluster.manager.heartbeat();
    assert!(node.node.flags().connected);

    // No answer to the second ping.
    cluster.manager.heartbeat();
    assert!(!node.node.flags().connected);
    assert!(cluster.manager.registry().is_empty());
    assert_eq!(cluster.manager.state().snapshot().num_active, 0);
}

#[test_log::test(tokio::test)]
async fn test_reconnect_reuses_slot() {
    let cluster = TestCluster::with_config(|config| {
        config.drop_delay = Duration::from_secs(3600);
    });
    let first = cluster.login(TestLogin::server("data01").writable("/store"));
    cluster.manager.disconnect(&first.node, "test");

    let flags = first.node.flags();
    assert!(flags.offline && !flags.connected);
    assert!(first.link.is_closed());
    assert_eq!(cluster.manager.registry().len(), 1);
    assert_eq!(cluster.manager.state().snapshot().num_active, 0);
    assert!(cluster.manager.registry().members().is_empty());

    let second = cluster.login(TestLogin::server("data01").writable("/store"));
    assert!(second.node.is_same(&first.node));
    assert_eq!(second.node.slot(), first.node.slot());
    assert_eq!(second.node.instance(), 1);
    assert!(second.node.flags().connected);
    assert!(!second.node.flags().offline);
    assert_eq!(cluster.manager.state().snapshot().num_active, 1);
}

#[test_log::test(tokio::test)]
async fn test_drop_timer_frees_slot() {
    let cluster = TestCluster::with_config(|config| {
        config.drop_delay = Duration::from_millis(20);
    });
    let node = cluster.login(TestLogin::server("data01"));
    cluster.manager.disconnect(&node.node, "test");
    assert_eq!(cluster.manager.registry().len(), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(cluster.manager.registry().is_empty());
    assert!(node.node.flags().gone);
}

#[test_log::test(tokio::test)]
async fn test_reconnect_cancels_drop_timer() {
    let cluster = TestCluster::with_config(|config| {
        config.drop_delay = Duration::from_millis(20);
    });
    let first = cluster.login(TestLogin::server("data01"));
    cluster.manager.disconnect(&first.node, "test");
    let _second = cluster.login(TestLogin::server("data01"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(cluster.manager.registry().len(), 1);
    assert!(first.node.flags().connected);
}

#[test]
fn test_disconnect_is_idempotent() {
    let cluster = TestCluster::with_config(|config| {
        config.drop_delay = Duration::from_secs(3600);
    });
    let node = cluster.login(TestLogin::server("data01").writable("/store"));
    tokio_test::block_on(async {
        cluster.manager.disconnect(&node.node, "first");
        cluster.manager.disconnect(&node.node, "second");
    });
    assert_eq!(cluster.manager.state().snapshot().num_active, 0);
    assert_eq!(cluster.manager.registry().len(), 1);
}

#[test]
fn test_admin_disable_and_disconnect() {
    let cluster = TestCluster::new(1);
    let node = cluster.login(TestLogin::server("data01").writable("/store"));
    let id = node.node.id();

    assert!(cluster.manager.set_disabled(id, true));
    assert!(!cluster.manager.registry().members().contains(node.node.mask()));
    assert_eq!(cluster.manager.state().snapshot().num_active, 0);
    assert!(cluster.manager.state().is_suspended());

    assert!(cluster.manager.set_disabled(id, false));
    assert_eq!(cluster.manager.state().snapshot().num_active, 1);
    assert!(!cluster.manager.state().is_suspended());

    assert!(cluster.manager.admin_disconnect(id));
    assert!(cluster.manager.registry().is_empty());
    assert!(!cluster.manager.admin_disconnect(id));
    assert!(!cluster.manager.set_disabled(id, true));
}

#[test]
fn test_disabled_survives_reconnect() {
    let cluster = TestCluster::with_config(|config| {
        config.drop_delay = Duration::from_secs(3600);
    });
    let first = cluster.login(TestLogin::server("data01").writable("/store"));
    cluster.manager.set_disabled(first.node.id(), true);
    tokio_test::block_on(async { cluster.manager.disconnect(&first.node, "test") });

    let second = cluster.login(TestLogin::server("data01").writable("/store"));
    assert!(second.node.flags().disabled);
    assert_eq!(cluster.manager.state().snapshot().num_active, 0);
}

#[test]
fn test_unauthorized_host_is_refused() {
    let cluster = TestCluster::with_config(|config| {
        config.allowed_hosts = vec!["data*".to_string()];
    });
    assert!(cluster.try_login(TestLogin::server("data01")).is_ok());
    assert_matches!(
        cluster.try_login(TestLogin::server("evil01")),
        Err(LoginError::Auth(AuthError::HostNotAuthorized(host))) if host == "evil01"
    );
    assert_eq!(cluster.manager.registry().len(), 1);
}

#[test]
fn test_login_cannot_borrow_an_allowed_name() {
    let cluster = TestCluster::with_config(|config| {
        config.allowed_hosts = vec!["data*".to_string()];
    });
    assert_matches!(
        cluster.try_login_from("evil.example.org", TestLogin::server("data01")),
        Err(LoginError::Auth(AuthError::HostNotAuthorized(host))) if host == "evil.example.org"
    );
    assert_matches!(
        cluster.try_login_from("data02", TestLogin::server("data01")),
        Err(LoginError::Auth(AuthError::HostNotAuthorized(host))) if host == "data01"
    );
    assert!(cluster.manager.registry().is_empty());
}

#[test]
fn test_refused_login_reply_codes() {
    let cluster = TestCluster::with_config(|config| {
        config.allowed_hosts = vec!["data*".to_string()];
    });

    let mut login = TestLogin::server("data01");
    login.login.credentials = b"krb5\0alice".to_vec();
    let err = cluster.try_login(login).unwrap_err();
    assert_matches!(&err, LoginError::Auth(AuthError::ProtocolMismatch { .. }));
    assert_eq!(err.to_reply().code, ErrorCode::Fatal);

    let err = cluster.try_login(TestLogin::server("evil01")).unwrap_err();
    assert_eq!(err.to_reply().code, ErrorCode::NotAuthorized);
    assert!(cluster.manager.registry().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_reconnect_replaces_exports() {
    let cluster = TestCluster::with_config(|config| {
        config.drop_delay = Duration::from_secs(3600);
    });
    let first = cluster.login(TestLogin::server("data01").read_only("/old"));
    assert!(!first.node.flags().read_write);
    cluster.manager.disconnect(&first.node, "test");

    let second = cluster.login(TestLogin::server("data01").writable("/new"));
    assert!(second.node.is_same(&first.node));
    assert!(second.node.flags().read_write);

    let registry = cluster.manager.registry();
    assert_eq!(registry.space_mask("/new/f", true), second.node.mask());
    assert!(registry.space_mask("/old/f", false).is_empty());
    assert_eq!(cluster.manager.state().snapshot().num_active, 1);

    let query = PathQuery {
        path: "/new/f".to_string(),
        write: true,
        stage: false,
    };
    let chosen = cluster.manager.select(&query).unwrap();
    assert!(chosen.is_same(&second.node));
}

#[test]
fn test_space_and_front_end_inputs() {
    let cluster = TestCluster::new(1);
    cluster.login(TestLogin::server("data01").writable("/store"));
    let state = cluster.manager.state();
    assert!(!state.is_no_staging());

    cluster.manager.set_space_available(false);
    assert!(state.is_no_staging());
    assert!(!state.is_suspended());
    cluster.manager.set_space_available(true);
    assert!(!state.is_no_staging());

    cluster.manager.set_front_end(false);
    assert!(state.is_suspended());
    cluster.manager.set_front_end(true);
    assert!(!state.is_suspended());
}

#[test]
fn test_select_suspended_cluster() {
    let cluster = TestCluster::new(2);
    let node = cluster.login(TestLogin::server("data01").writable("/store"));
    node.request(&cluster, Request::Have("/store/f".to_string()))
        .unwrap();

    let query = PathQuery {
        path: "/store/f".to_string(),
        write: false,
        stage: false,
    };
    assert_matches!(
        cluster.manager.select(&query),
        Err(SelectError::Suspended { path }) if path == "/store/f"
    );
    // Locating does not depend on the cluster state.
    assert_eq!(cluster.manager.locate(&query).unwrap().len(), 1);
}

#[test]
fn test_prepare_present_file() {
    let cluster = TestCluster::new(1);
    let node = cluster.login(TestLogin::server("data01").writable("/store"));
    node.request(&cluster, Request::Have("/store/f".to_string()))
        .unwrap();

    let outcome = cluster
        .manager
        .process(&PrepareRequest::new("/store/f"))
        .unwrap();
    assert_eq!(outcome, PrepareOutcome::Present(node.node.id()));
}

#[test]
fn test_prepare_dispatches_stage() {
    let cluster = TestCluster::new(1);
    let mut node = cluster.login(TestLogin::server("data01").writable("/store"));
    let mut request = PrepareRequest::new("/store/new");
    request.notify = "client@redir01".to_string();

    let outcome = cluster.manager.process(&request).unwrap();
    assert_eq!(outcome, PrepareOutcome::Dispatched(node.node.id()));
    assert_eq!(node.node.usage().allocations, 1);

    let frames = node.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].header.code, RRCode::Stage);
    let body: PrepAdd = frames[0].decode_body().unwrap();
    assert_eq!(body.path, "/store/new");
    assert_eq!(body.notify, "client@redir01");
    assert_eq!(body.reqid, request.id.to_string());
}

#[test]
fn test_prepare_prefers_colocated_node() {
    let cluster = TestCluster::with_config(|config| {
        config.weights.disk_util = 0;
    });
    let far = cluster.login(TestLogin::server("data01").writable("/store"));
    let near = cluster.login(TestLogin::server("data02").writable("/store").level(3));
    near.request(&cluster, Request::Have("/store/set/a".to_string()))
        .unwrap();

    let mut request = PrepareRequest::new("/store/set/b");
    request.coloc = Some("/store/set/a".to_string());
    request.options = crate::prepare::options::COLOC;

    let outcome = cluster.manager.process(&request).unwrap();
    assert_eq!(outcome, PrepareOutcome::Dispatched(near.node.id()));
    assert_eq!(far.node.usage().allocations, 0);
}

#[test]
fn test_prepare_without_staging_nodes_fails() {
    let cluster = TestCluster::new(1);
    cluster.login(TestLogin::server("data01").writable("/store").no_stage());

    let err = cluster
        .manager
        .process(&PrepareRequest::new("/store/new"))
        .unwrap_err();
    assert_matches!(err, PrepareError::Select(SelectError::NoStaging { .. }));
    assert!(err.to_string().contains("temporarily unavailable"));
}

#[test_log::test(tokio::test)]
async fn test_prepare_worker_sends_stage_frames() {
    let cluster = TestCluster::new(1);
    let mut node = cluster.login(TestLogin::server("data01").writable("/store"));
    cluster.manager.start();

    // Nothing can stage /elsewhere, the request is dropped and the
    // worker moves on.
    cluster.manager.prepare().push(PrepareRequest::new("/elsewhere/x"));
    cluster.manager.prepare().push(PrepareRequest::new("/store/a"));

    let frame = node.expect(RRCode::Stage).await;
    let body: PrepAdd = frame.decode_body().unwrap();
    assert_eq!(body.path, "/store/a");
    assert!(cluster.manager.prepare().is_empty());
}

#[derive(Default)]
struct Recorder {
    frames: Mutex<Vec<Frame>>,
}

impl Upstream for Recorder {
    fn inform(&self, frame: &Frame) {
        self.frames.lock().push(frame.clone());
    }
}

#[test_log::test(tokio::test)]
async fn test_status_is_reported_upstream() {
    let admin = admin_dir();
    let upstream = Arc::new(Recorder::default());
    let manager = Manager::with_parts(
        ManagerConfig {
            admin_path: Some(admin.clone()),
            drop_delay: Duration::ZERO,
            heartbeat_interval: Duration::ZERO,
            ..ManagerConfig::default()
        },
        Box::new(UnixAuthenticator),
        Some(upstream.clone() as Arc<dyn Upstream>),
    );
    assert!(manager.has_upstream());
    manager.start();

    let wait = async {
        loop {
            let seen = upstream.frames.lock().len();
            if seen > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(1), wait)
        .await
        .expect("no status reported upstream");

    let first = upstream.frames.lock()[0].clone();
    assert_eq!(first.header.code, RRCode::Status);
    assert_ne!(first.header.modifier & modifier::SUSPEND, 0);

    manager.forward(Forward::Upstream(Frame::empty(0, RRCode::Update, 0)));
    assert_eq!(
        upstream.frames.lock().last().map(|f| f.header.code),
        Some(RRCode::Update)
    );

    manager.shutdown();
    let _ = std::fs::remove_dir_all(admin);
}

#[test]
fn test_forward_to_nodes() {
    let cluster = TestCluster::new(1);
    let mut a = cluster.login(TestLogin::server("data01"));
    let mut b = cluster.login(TestLogin::server("data02"));

    let frame = Frame::empty(0, RRCode::Update, 0);
    cluster.manager.forward(Forward::Nodes {
        mask: b.node.mask(),
        frame,
    });
    assert!(a.frames().is_empty());
    assert_eq!(b.frames().len(), 1);
}

#[test]
fn test_admin_controls() {
    let cluster = TestCluster::new(1);
    cluster.login(TestLogin::server("data01").writable("/store"));
    let state = cluster.manager.state();
    assert!(!state.is_suspended());

    assert!(tokio_test::assert_ok!(cluster.manager.set_admin_suspend(true)));
    assert!(!tokio_test::assert_ok!(cluster.manager.set_admin_suspend(true)));
    assert!(cluster.admin.join("SUSPEND").exists());
    assert!(state.is_suspended());

    assert!(tokio_test::assert_ok!(cluster.manager.set_admin_no_stage(true)));
    assert!(state.is_no_staging());
    tokio_test::assert_ok!(cluster.manager.set_admin_suspend(false));
    tokio_test::assert_ok!(cluster.manager.set_admin_no_stage(false));
    assert!(!cluster.admin.join("NOSTAGE").exists());

    cluster.manager.set_min_nodes(2, None);
    assert!(state.is_suspended());
    assert_eq!(state.snapshot().min_nodes, 2);

    // A directory that cannot hold the sentinel files rejects the toggle.
    let blocked = cluster.admin.join("blocked");
    std::fs::write(&blocked, b"not a directory").unwrap();
    cluster.manager.set_min_nodes(1, Some(blocked));
    tokio_test::assert_err!(cluster.manager.set_admin_suspend(true));
    assert!(!state.snapshot().admin_suspend);
}
