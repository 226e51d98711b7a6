use crate::config::SelectionWeights;
use crate::link::Link;
use crate::test_utils::prelude::*;
use crate::wire::{LoadReport, PathQuery, PrepAdd, PrepDel, SpaceReport, StateReport};

use super::*;
use std::time::Duration;

fn query(path: &str) -> PathQuery {
    PathQuery {
        path: path.to_string(),
        write: false,
        stage: false,
    }
}

fn load(cpu: u8) -> LoadReport {
    LoadReport {
        cpu,
        net: 0,
        xeq: 0,
        mem: 0,
        pag: 0,
        disk_util: 0,
        disk_free: 1 << 20,
    }
}

#[test]
fn test_role_parsing() {
    assert_eq!("server".parse::<Role>().unwrap(), Role::default());
    assert!("supervisor".parse::<Role>().unwrap().manager);
    let peer = "peer".parse::<Role>().unwrap();
    assert!(peer.manager && peer.peer && peer.subscribes());
    assert!("proxy".parse::<Role>().unwrap().proxy);
    assert!(!"proxy".parse::<Role>().unwrap().subscribes());
    assert_eq!("router".parse::<Role>(), Err("router".to_string()));
}

#[test]
fn test_contribution() {
    let mut flags = NodeFlags {
        bound: true,
        connected: true,
        read_write: true,
        ..NodeFlags::default()
    };
    assert_eq!(flags.contribution(), (1, 1));
    flags.no_stage = true;
    assert_eq!(flags.contribution(), (1, 0));
    flags.suspended = true;
    assert_eq!(flags.contribution(), (0, 0));
    assert!(flags.is_member());
}

#[test]
fn test_login_sets_flags_and_counts() {
    let cluster = TestCluster::new(1);
    let data = cluster.login(TestLogin::server("data01").writable("/store"));
    let reader = cluster.login(TestLogin::server("data02").read_only("/store"));

    let flags = data.node.flags();
    assert!(flags.connected && flags.bound && flags.read_write && flags.known);
    assert!(!reader.node.flags().read_write);

    let snap = cluster.manager.state().snapshot();
    assert_eq!(snap.num_active, 1);
    assert_eq!(snap.num_staging, 1);
    assert!(!snap.suspended);

    let members = cluster.manager.registry().members();
    assert!(members.contains(data.node.mask() | reader.node.mask()));
}

#[test]
fn test_login_errors() {
    let cluster = TestCluster::new(1);

    let mut bad = TestLogin::server("data01");
    bad.login.role = "router".to_string();
    assert_matches!(cluster.try_login(bad), Err(LoginError::UnknownRole(r)) if r == "router");

    let mut bad = TestLogin::server("data01");
    bad.login.protocol_version = 99;
    assert_matches!(
        cluster.try_login(bad),
        Err(LoginError::ProtocolMismatch { actual: 99, .. })
    );

    let mut bad = TestLogin::server("");
    bad.login.host = " ".to_string();
    assert_matches!(cluster.try_login(bad), Err(LoginError::MissingHost));

    let mut bad = TestLogin::server("data01");
    bad.login.port = 0;
    assert_matches!(cluster.try_login(bad), Err(LoginError::InvalidPort(0)));

    let mut bad = TestLogin::server("data01");
    bad.login.credentials = b"krb5\0someone".to_vec();
    let err = cluster.try_login(bad).err().unwrap();
    assert_matches!(&err, LoginError::Auth(auth) if auth.is_fatal());

    assert!(cluster.manager.registry().is_empty());
}

#[test]
fn test_second_login_is_fatal() {
    let cluster = TestCluster::new(1);
    let node = cluster.login(TestLogin::server("data01"));
    let err = node
        .request(&cluster, Request::Login(Box::new(TestLogin::server("data01").login)))
        .unwrap_err();
    assert_matches!(err, HandlerError::AlreadyLoggedIn);
    assert!(err.is_fatal());
}

#[test]
fn test_load_report_updates_cost() {
    let cluster = TestCluster::new(1);
    let node = cluster.login(TestLogin::server("data01").level(2));

    let reply = node.request(&cluster, Request::Load(load(50))).unwrap();
    assert_eq!(reply, Reply::Done);

    // 50% cpu at weight 20 plus level 2 at bias 1
    let capacity = node.node.snapshot().capacity;
    assert_eq!(capacity.load, 10);
    assert_eq!(capacity.mass, 10);
    assert_eq!(capacity.cost, 12);
}

#[test]
fn test_huge_weights_saturate_cost() {
    let cluster = TestCluster::with_config(|config| {
        config.weights = SelectionWeights {
            cpu: u32::MAX,
            net: u32::MAX,
            xeq: u32::MAX,
            mem: u32::MAX,
            pag: u32::MAX,
            disk_util: u32::MAX,
            level_bias: u32::MAX,
        };
    });
    let node = cluster.login(TestLogin::server("data01").level(255));
    node.request(&cluster, Request::Load(load(100))).unwrap();

    let capacity = node.node.snapshot().capacity;
    assert_eq!(capacity.load, u32::MAX / 100);
    assert_eq!(capacity.cost, u32::MAX);
}

#[test]
fn test_out_of_range_report_is_rejected() {
    let cluster = TestCluster::new(1);
    let node = cluster.login(TestLogin::server("data01"));

    let err = node.request(&cluster, Request::Load(load(101))).unwrap_err();
    assert_matches!(&err, HandlerError::Invalid(msg) if msg.contains("cpu"));
    assert!(!err.is_fatal());

    let space = SpaceReport {
        disk_free: 1,
        disk_util: 150,
    };
    assert!(node.request(&cluster, Request::Space(space)).is_err());
    assert!(node.node.flags().connected);
}

#[test]
fn test_avkb_reports_best_space() {
    let cluster = TestCluster::new(1);
    let a = cluster.login(TestLogin::server("data01").writable("/store"));
    let b = cluster.login(TestLogin::server("data02").writable("/store"));
    a.request(
        &cluster,
        Request::Space(SpaceReport {
            disk_free: 100,
            disk_util: 20,
        }),
    )
    .unwrap();
    b.request(
        &cluster,
        Request::Space(SpaceReport {
            disk_free: 900,
            disk_util: 60,
        }),
    )
    .unwrap();

    let reply = a.request(&cluster, Request::AvKb).unwrap();
    assert_eq!(
        TestCluster::response(reply),
        Response::Space(SpaceReport {
            disk_free: 900,
            disk_util: 40,
        })
    );
}

#[test]
fn test_have_then_locate() {
    let cluster = TestCluster::new(1);
    let a = cluster.login(TestLogin::server("data01").writable("/store"));
    let b = cluster.login(TestLogin::server("data02").writable("/store"));
    let client = cluster.login(TestLogin::manager("redir01"));

    a.request(&cluster, Request::Have("/store/f".to_string()))
        .unwrap();
    b.request(&cluster, Request::Have("/store/f".to_string()))
        .unwrap();
    b.request(&cluster, Request::Load(load(80))).unwrap();

    let reply = client
        .request(&cluster, Request::Locate(query("/store/f")))
        .unwrap();
    match TestCluster::response(reply) {
        Response::Locate(locations) => {
            let hosts: Vec<_> = locations.iter().map(|l| l.host.as_str()).collect();
            assert_eq!(hosts, vec!["data01", "data02"]);
        }
        other => panic!("unexpected {:?}", other),
    }

    let err = client
        .request(&cluster, Request::Locate(query("/store/none")))
        .unwrap_err();
    assert_matches!(err, HandlerError::Unavailable(_));
    assert!(err.to_string().contains("temporarily unavailable"));

    assert_matches!(
        a.request(&cluster, Request::Have("relative".to_string())),
        Err(HandlerError::Invalid(_))
    );
}

#[test]
fn test_select_prefers_cheapest_then_least_used() {
    let cluster = TestCluster::with_config(|config| {
        config.weights.disk_util = 0;
    });
    let nodes: Vec<_> = [("data01", 5), ("data02", 2), ("data03", 2)]
        .into_iter()
        .map(|(host, level)| cluster.login(TestLogin::server(host).writable("/store").level(level)))
        .collect();
    for (node, redirects) in nodes.iter().zip([0, 3, 1]) {
        node.node.with_state(|state| state.usage.redirects_total = redirects);
        node.request(&cluster, Request::Have("/store/f".to_string()))
            .unwrap();
    }
    let client = cluster.login(TestLogin::manager("redir01"));

    let reply = client
        .request(&cluster, Request::Select(query("/store/f")))
        .unwrap();
    assert_matches!(
        TestCluster::response(reply),
        Response::Select(location) if location.host == "data03"
    );
    assert_eq!(nodes[2].node.usage().redirects, 1);
    assert_eq!(nodes[2].node.usage().redirects_total, 2);
}

#[test]
fn test_select_places_writes_and_respects_suspend() {
    let cluster = TestCluster::new(1);
    let writer = cluster.login(TestLogin::server("data01").writable("/store"));
    let _reader = cluster.login(TestLogin::server("data02").read_only("/store"));
    let client = cluster.login(TestLogin::manager("redir01"));

    let mut create = query("/store/new");
    create.write = true;
    let reply = client
        .request(&cluster, Request::Select(create.clone()))
        .unwrap();
    assert_matches!(
        TestCluster::response(reply),
        Response::Select(location) if location.node == writer.node.id()
    );
    assert_eq!(writer.node.usage().allocations, 1);

    assert_matches!(
        client.request(&cluster, Request::Select(query("/store/new"))),
        Err(HandlerError::Unavailable(_))
    );

    cluster.manager.set_admin_suspend(true).unwrap();
    let err = client
        .request(&cluster, Request::Select(create))
        .unwrap_err();
    assert_matches!(err, HandlerError::Unavailable(crate::select::SelectError::Suspended { .. }));
}

#[test]
fn test_ping_pong() {
    let cluster = TestCluster::new(1);
    let node = cluster.login(TestLogin::server("data01"));

    assert_eq!(
        TestCluster::response(node.request(&cluster, Request::Ping).unwrap()),
        Response::Pong
    );

    node.node.with_state(|state| state.flags.ping_pending = true);
    node.request(&cluster, Request::Pong).unwrap();
    assert!(!node.node.flags().ping_pending);
}

#[test]
fn test_status_changes_contribution() {
    let cluster = TestCluster::new(1);
    let node = cluster.login(TestLogin::server("data01").writable("/store"));
    assert!(!cluster.manager.state().is_suspended());

    node.request(&cluster, Request::Status(modifier::SUSPEND))
        .unwrap();
    assert!(node.node.flags().suspended);
    assert!(cluster.manager.state().is_suspended());

    node.request(&cluster, Request::Status(modifier::RESUME | modifier::NO_STAGE))
        .unwrap();
    assert!(!cluster.manager.state().is_suspended());
    assert!(cluster.manager.state().is_no_staging());

    assert_matches!(
        node.request(&cluster, Request::Status(modifier::SUSPEND | modifier::RESUME)),
        Err(HandlerError::Invalid(_))
    );
    assert_matches!(
        node.request(&cluster, Request::Status(0)),
        Err(HandlerError::Invalid(_))
    );
}

#[test]
fn test_state_report_from_supervisor() {
    let cluster = TestCluster::new(1);
    let sup = cluster.login(TestLogin::new("sup01", "supervisor").writable("/store"));
    assert_eq!(cluster.manager.state().snapshot().num_active, 1);

    let reply = sup
        .request(
            &cluster,
            Request::State(StateReport {
                suspended: true,
                no_stage: false,
            }),
        )
        .unwrap();
    assert_eq!(reply, Reply::Done);
    assert_eq!(cluster.manager.state().snapshot().num_active, 0);
    assert!(cluster.manager.state().is_suspended());
}

#[test]
fn test_update_resends_state() {
    let cluster = TestCluster::new(1);
    let mut mgr = cluster.login(TestLogin::manager("mgr01"));
    assert_eq!(
        mgr.statuses(),
        vec![modifier::SUSPEND | modifier::NO_STAGE]
    );

    mgr.request(&cluster, Request::Update).unwrap();
    assert_eq!(
        mgr.statuses(),
        vec![modifier::SUSPEND | modifier::NO_STAGE]
    );
}

#[test]
fn test_usage_reports_local_load() {
    let cluster = TestCluster::new(1);
    let node = cluster.login(TestLogin::manager("mgr01"));
    cluster.manager.set_local_load(load(33));

    let reply = node.request(&cluster, Request::Usage).unwrap();
    assert_eq!(TestCluster::response(reply), Response::Usage(load(33)));
}

#[test]
fn test_disc_keeps_slot_until_dropped() {
    let cluster = TestCluster::with_config(|config| {
        config.drop_delay = Duration::from_secs(3600);
    });
    let node = cluster.login(TestLogin::server("data01").writable("/store"));
    node.request(&cluster, Request::Have("/store/f".to_string()))
        .unwrap();

    let reply = tokio_test::block_on(async {
        node.request(&cluster, Request::Disc(Some("bye".to_string())))
    })
    .unwrap();
    assert_eq!(reply, Reply::Close);

    let flags = node.node.flags();
    assert!(flags.offline && !flags.connected);
    assert!(!cluster.manager.registry().members().intersects(node.node.mask()));
    assert!(cluster.manager.registry().contains(&node.node));
    assert_eq!(cluster.manager.state().snapshot().num_active, 0);
    assert!(node.link.is_closed());
}

#[test]
fn test_gone_frees_slot() {
    let cluster = TestCluster::new(1);
    let node = cluster.login(TestLogin::server("data01").writable("/store"));
    node.request(&cluster, Request::Have("/store/f".to_string()))
        .unwrap();

    assert_eq!(node.request(&cluster, Request::Gone).unwrap(), Reply::Close);
    assert!(!cluster.manager.registry().contains(&node.node));
    assert!(cluster.manager.registry().presence("/store/f").is_empty());
    assert!(node.node.flags().gone);
}

#[test]
fn test_prep_add_and_del() {
    let cluster = TestCluster::new(1);
    let node = cluster.login(TestLogin::server("data01").writable("/store"));
    let mut peer = cluster.login(TestLogin::server("data02").writable("/store"));

    let prep = PrepAdd {
        reqid: "req-1".to_string(),
        ident: "user".to_string(),
        notify: String::new(),
        priority: 1,
        mode: "r".to_string(),
        options: 0,
        path: "/store/f".to_string(),
        opaque: None,
        coloc: None,
    };
    node.request(&cluster, Request::PrepAdd(prep)).unwrap();
    assert_eq!(cluster.manager.prepare().len(), 1);

    let reply = node
        .request(
            &cluster,
            Request::PrepDel(PrepDel {
                reqid: "req-1".to_string(),
            }),
        )
        .unwrap();
    assert!(cluster.manager.prepare().is_empty());

    match reply {
        Reply::Forward(forward) => cluster.manager.forward(forward),
        other => panic!("expected a forward, got {:?}", other),
    }
    let frames = peer.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].header.code, RRCode::PrepDel);
}

#[test_log::test(tokio::test)]
async fn test_gone_suspends_cluster_once() {
    let cluster = TestCluster::new(2);
    let mut mgr = cluster.login(TestLogin::manager("mgr01"));
    let a = cluster.login(TestLogin::server("data01").writable("/store"));
    let _b = cluster.login(TestLogin::server("data02").writable("/store"));
    mgr.frames();

    cluster.manager.start();
    let first = mgr.expect(RRCode::Status).await;
    assert_eq!(first.header.modifier, modifier::RESUME | modifier::STAGE);

    a.request(&cluster, Request::Gone).unwrap();
    assert!(cluster.manager.state().is_suspended());

    let change = mgr.expect(RRCode::Status).await;
    assert_eq!(change.header.modifier, modifier::SUSPEND);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(mgr.statuses().is_empty());
}

#[test]
fn test_load_reports_use_independent_locks() {
    let cluster = TestCluster::new(1);
    let a = cluster.login(TestLogin::server("data01"));
    let b = cluster.login(TestLogin::server("data02"));

    let (release, wait) = std::sync::mpsc::channel::<()>();
    let (locked, is_locked) = std::sync::mpsc::channel::<()>();
    let held = a.node.clone();
    let holder = std::thread::spawn(move || {
        held.with_state(|_| {
            locked.send(()).unwrap();
            wait.recv_timeout(Duration::from_secs(5)).unwrap();
        })
    });
    is_locked.recv().unwrap();

    // Node a is locked for the whole time b is updated.
    b.request(&cluster, Request::Load(load(40))).unwrap();
    assert_eq!(b.node.snapshot().capacity.sample.cpu, 40);

    release.send(()).unwrap();
    holder.join().unwrap();
}
