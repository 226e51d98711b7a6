use super::*;
use crate::id::NodeId;
use crate::node::{Capacity, Usage};

fn online() -> NodeFlags {
    NodeFlags {
        bound: true,
        connected: true,
        read_write: true,
        known: true,
        ..NodeFlags::default()
    }
}

fn candidate(id: u32, cost: u32, redirects: u64) -> NodeSnapshot {
    NodeSnapshot {
        id: NodeId(id),
        slot: id as usize,
        instance: 0,
        config_id: 1,
        host: format!("data{:02}", id),
        port: 1094,
        level: 0,
        last_seen: chrono::Utc::now(),
        flags: online(),
        capacity: Capacity {
            cost,
            ..Capacity::default()
        },
        usage: Usage {
            redirects_total: redirects,
            ..Usage::default()
        },
    }
}

#[test]
fn test_cost_then_redirect_count() {
    let nodes = vec![candidate(1, 5, 0), candidate(2, 2, 3), candidate(3, 2, 1)];

    let winner = best(nodes.clone(), Criteria::read(), Purpose::Redirect).unwrap();
    assert_eq!(winner.id, NodeId(3));

    let ranked: Vec<_> = rank(nodes, Criteria::read(), Purpose::Redirect)
        .into_iter()
        .map(|n| n.id.0)
        .collect();
    assert_eq!(ranked, vec![3, 2, 1]);
}

#[test]
fn test_node_id_breaks_full_ties() {
    let nodes = vec![candidate(7, 4, 2), candidate(4, 4, 2), candidate(9, 4, 2)];
    for _ in 0..3 {
        let winner = best(nodes.clone(), Criteria::read(), Purpose::Redirect).unwrap();
        assert_eq!(winner.id, NodeId(4));
    }
}

#[test]
fn test_allocation_uses_allocation_counts() {
    let mut a = candidate(1, 3, 0);
    a.usage.allocations_total = 10;
    let mut b = candidate(2, 3, 50);
    b.usage.allocations_total = 2;

    let winner = best(vec![a.clone(), b.clone()], Criteria::write(), Purpose::Allocate).unwrap();
    assert_eq!(winner.id, NodeId(2));
    let winner = best(vec![a, b], Criteria::read(), Purpose::Redirect).unwrap();
    assert_eq!(winner.id, NodeId(1));
}

#[test]
fn test_ineligible_nodes_are_skipped() {
    let mut disabled = candidate(1, 0, 0);
    disabled.flags.disabled = true;
    let mut suspended = candidate(2, 0, 0);
    suspended.flags.suspended = true;
    let mut offline = candidate(3, 0, 0);
    offline.flags.offline = true;
    offline.flags.connected = false;
    let fallback = candidate(4, 90, 100);

    let winner = best(
        vec![disabled, suspended, offline, fallback],
        Criteria::read(),
        Purpose::Redirect,
    )
    .unwrap();
    assert_eq!(winner.id, NodeId(4));
}

#[test]
fn test_write_requires_read_write_and_stage_requires_staging() {
    let mut read_only = candidate(1, 0, 0);
    read_only.flags.read_write = false;
    let mut no_stage = candidate(2, 0, 0);
    no_stage.flags.no_stage = true;

    assert!(best(vec![read_only.clone()], Criteria::write(), Purpose::Allocate).is_none());
    assert!(best(vec![read_only], Criteria::read(), Purpose::Redirect).is_some());

    let staging = Criteria {
        write: false,
        stage: true,
    };
    assert!(best(vec![no_stage.clone()], staging, Purpose::Allocate).is_none());
    assert!(best(vec![no_stage], Criteria::write(), Purpose::Allocate).is_some());
}

#[test]
fn test_no_candidates() {
    assert!(best(Vec::new(), Criteria::read(), Purpose::Redirect).is_none());
    assert!(rank(Vec::new(), Criteria::read(), Purpose::Redirect).is_empty());
}

#[test]
fn test_select_error_text() {
    let err = SelectError::NoServer {
        verb: "read",
        path: "/store/a".to_string(),
    };
    assert_eq!(
        err.to_string(),
        "No servers are available to read /store/a, temporarily unavailable"
    );
}
