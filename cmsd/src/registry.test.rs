use super::*;
use crate::link::ChannelLink;
use crate::node::{NodeFlags, Role};
use crate::wire::{Export, RRCode};
use assert_matches::assert_matches;

fn info(host: &str, exports: &[(&str, bool)]) -> NodeInfo {
    NodeInfo {
        host: host.to_string(),
        port: 1094,
        session_id: Some(format!("{}-1", host)),
        role: Role::default(),
        level: 0,
        exports: exports
            .iter()
            .map(|(prefix, writable)| Export {
                prefix: prefix.to_string(),
                writable: *writable,
            })
            .collect(),
    }
}

fn admit(registry: &Registry, info: NodeInfo) -> Node {
    let (link, _rx) = ChannelLink::new(info.host.clone(), None);
    let node = registry.admit(info, link, 1).unwrap().node;
    bring_online(registry, &node);
    node
}

fn bring_online(registry: &Registry, node: &Node) {
    node.change(|state| {
        state.flags.bound = true;
        state.flags.connected = true;
        state.flags.offline = false;
        state.flags.read_write = true;
    });
    registry.sync(node);
}

#[test]
fn test_member_bit_tracks_flags() {
    let registry = Registry::new();
    let node = admit(&registry, info("data01", &[("/store", true)]));
    assert!(registry.members().contains(node.mask()));

    let flips: [fn(&mut NodeFlags); 4] = [
        |f| f.disabled = true,
        |f| f.gone = true,
        |f| f.connected = false,
        |f| f.bound = false,
    ];
    for flip in flips {
        node.change(|state| flip(&mut state.flags));
        registry.sync(&node);
        assert!(!registry.members().intersects(node.mask()));

        bring_online(&registry, &node);
        node.change(|state| {
            state.flags.disabled = false;
            state.flags.gone = false;
        });
        registry.sync(&node);
        assert!(registry.members().contains(node.mask()));
    }
}

#[test]
fn test_registry_full() {
    let registry = Registry::new();
    for i in 0..MAX_NODES {
        admit(&registry, info(&format!("data{:02}", i), &[]));
    }
    assert_eq!(registry.len(), MAX_NODES);

    let (link, _rx) = ChannelLink::new("late", None);
    assert_matches!(
        registry.admit(info("late", &[]), link, 1),
        Err(LoginError::RegistryFull(host)) if host == "late"
    );
}

#[test]
fn test_reconnect_reuses_slot() {
    let registry = Registry::new();
    let node = admit(&registry, info("data01", &[]));
    let timer = tokio_util::sync::CancellationToken::new();
    node.arm_drop_timer(Some(timer.clone()));

    let (link, _rx) = ChannelLink::new("data01", None);
    let admission = registry.admit(info("data01", &[]), link, 2).unwrap();
    assert!(admission.reconnected);
    assert!(admission.previous_link.is_some());
    assert!(admission.node.is_same(&node));
    assert_eq!(admission.node.instance(), 1);
    assert!(timer.is_cancelled());
    assert_eq!(registry.len(), 1);

    let mut other = info("data01", &[]);
    other.session_id = Some("fresh".to_string());
    let (link, _rx) = ChannelLink::new("data01", None);
    let admission = registry.admit(other, link, 2).unwrap();
    assert!(!admission.reconnected);
    assert_ne!(admission.node.slot(), node.slot());
}

#[test]
fn test_reconnect_replaces_exports() {
    let registry = Registry::new();
    let node = admit(&registry, info("data01", &[("/old", false)]));
    let other = admit(&registry, info("data02", &[("/old", false)]));

    let mut again = info("data01", &[("/new", true)]);
    again.level = 3;
    let (link, _rx) = ChannelLink::new("data01", None);
    let admission = registry.admit(again, link, 2).unwrap();
    assert!(admission.reconnected);
    assert!(admission.node.is_same(&node));

    assert_eq!(node.level(), 3);
    assert_eq!(node.info().exports[0].prefix, "/new");
    assert_eq!(registry.space_mask("/new/f", true), node.mask());
    assert_eq!(registry.space_mask("/old/f", false), other.mask());
}

#[test]
fn test_remove_clears_every_mask() {
    let registry = Registry::new();
    let node = admit(&registry, info("data01", &[("/store", true)]));
    registry.add_presence("/store/a", node.mask());

    assert!(registry.remove(&node));
    assert!(!registry.remove(&node));
    assert!(registry.members().is_empty());
    assert!(registry.presence("/store/a").is_empty());
    assert!(registry.space_mask("/store/a", false).is_empty());
    assert!(registry.get(node.slot()).is_none());
}

#[test]
fn test_space_mask_longest_prefix() {
    let registry = Registry::new();
    let a = admit(&registry, info("data01", &[("/store", false)]));
    let b = admit(&registry, info("data02", &[("/store/hot", true)]));

    assert_eq!(registry.space_mask("/store/cold/f", false), a.mask());
    assert_eq!(registry.space_mask("/store/hot/f", false), b.mask());
    assert_eq!(registry.space_mask("/store/hot/f", true), b.mask());
    assert!(registry.space_mask("/store/cold/f", true).is_empty());
    assert!(registry.space_mask("/storefront", false).is_empty());
    assert!(registry.space_mask("/other", false).is_empty());
}

#[test]
fn test_select_charges_winner() {
    let registry = Registry::new();
    let a = admit(&registry, info("data01", &[]));
    let b = admit(&registry, info("data02", &[]));
    let mask = a.mask() | b.mask();

    let first = registry
        .select(mask, Criteria::read(), Purpose::Redirect)
        .unwrap();
    assert_eq!(first, a);
    assert_eq!(first.usage().redirects, 1);

    let second = registry
        .select(mask, Criteria::read(), Purpose::Redirect)
        .unwrap();
    assert_eq!(second, b);

    registry.reset_usage();
    assert_eq!(a.usage().redirects, 0);
    assert_eq!(a.usage().redirects_total, 1);
}

#[test]
fn test_select_skips_non_members() {
    let registry = Registry::new();
    let a = admit(&registry, info("data01", &[]));
    a.change(|state| state.flags.disabled = true);
    registry.sync(&a);

    assert!(
        registry
            .select(a.mask(), Criteria::read(), Purpose::Redirect)
            .is_none()
    );
    assert!(registry.locate(a.mask(), Criteria::read()).is_empty());
}

#[test]
fn test_broadcast_reaches_mask() {
    let registry = Registry::new();
    let (link_a, mut rx_a) = ChannelLink::new("data01", None);
    let (link_b, mut rx_b) = ChannelLink::new("data02", None);
    let a = registry.admit(info("data01", &[]), link_a, 1).unwrap().node;
    let _b = registry.admit(info("data02", &[]), link_b, 1).unwrap().node;

    let frame = Frame::empty(0, RRCode::Ping, 0);
    assert_eq!(registry.broadcast(a.mask(), &frame), 1);
    assert!(rx_a.try_recv().is_ok());
    assert!(rx_b.try_recv().is_err());
}
