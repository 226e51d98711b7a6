use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::link::{ChannelLink, Link};
use crate::test_utils::prelude::*;
use crate::wire::{ErrorCode, Frame};

use super::*;

struct Peer {
    writer: DuplexStream,
    link: Arc<ChannelLink>,
    rx: mpsc::UnboundedReceiver<Bytes>,
    handle: JoinHandle<()>,
}

impl Peer {
    fn connect(cluster: &TestCluster, host: &str) -> Self {
        let (writer, reader) = tokio::io::duplex(4096);
        let (link, rx) = ChannelLink::new(host, None);
        let handle = tokio::spawn(serve(cluster.manager.clone(), link.clone(), reader));
        Peer {
            writer,
            link,
            rx,
            handle,
        }
    }

    async fn send(&mut self, stream_id: u32, request: Request) {
        let frame = request.to_frame(stream_id).unwrap();
        self.writer.write_all(&frame.encode()).await.unwrap();
    }

    async fn recv(&mut self) -> Frame {
        let data = tokio::time::timeout(Duration::from_secs(1), self.rx.recv())
            .await
            .expect("no frame")
            .expect("link closed");
        Frame::decode(data).unwrap()
    }

    /// Next frame with `code`, skipping status pushes.
    async fn recv_code(&mut self, code: RRCode) -> Frame {
        loop {
            let frame = self.recv().await;
            if frame.header.code == code {
                return frame;
            }
        }
    }

    async fn finish(self) {
        tokio::time::timeout(Duration::from_secs(1), self.handle)
            .await
            .expect("connection loop still running")
            .unwrap();
    }
}

fn login(host: &str) -> Request {
    Request::Login(Box::new(TestLogin::server(host).writable("/store").login))
}

fn error_code(frame: &Frame) -> ErrorCode {
    match Response::from_frame(frame).unwrap() {
        Response::Error(reply) => reply.code,
        other => panic!("expected an error, got {:?}", other),
    }
}

#[test_log::test(tokio::test)]
async fn test_ping_is_answered_on_same_stream() {
    let cluster = TestCluster::new(1);
    let mut peer = Peer::connect(&cluster, "data01");

    peer.send(1, login("data01")).await;
    peer.send(42, Request::Ping).await;

    let frame = peer.recv().await;
    assert_eq!(frame.header.code, RRCode::Pong);
    assert_eq!(frame.header.stream_id, 42);
    assert_eq!(cluster.manager.registry().len(), 1);
}

#[test_log::test(tokio::test)]
async fn test_first_frame_must_be_login() {
    let cluster = TestCluster::new(1);
    let mut peer = Peer::connect(&cluster, "data01");

    peer.send(3, Request::Ping).await;

    let frame = peer.recv().await;
    assert_eq!(frame.header.stream_id, 3);
    assert_eq!(error_code(&frame), ErrorCode::Fatal);
    let link = peer.link.clone();
    peer.finish().await;
    assert!(link.is_closed());
    assert!(cluster.manager.registry().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_malformed_request_keeps_connection() {
    let cluster = TestCluster::new(1);
    let mut peer = Peer::connect(&cluster, "data01");
    peer.send(1, login("data01")).await;

    let empty_load = Frame::empty(7, RRCode::Load, 0);
    peer.writer.write_all(&empty_load.encode()).await.unwrap();
    let frame = peer.recv().await;
    assert_eq!(frame.header.stream_id, 7);
    assert_eq!(error_code(&frame), ErrorCode::Invalid);

    peer.send(8, Request::Ping).await;
    assert_eq!(peer.recv().await.header.code, RRCode::Pong);
}

#[test_log::test(tokio::test)]
async fn test_unavailable_select_is_reported() {
    let cluster = TestCluster::new(1);
    let mut peer = Peer::connect(&cluster, "redir01");
    peer.send(1, Request::Login(Box::new(TestLogin::manager("redir01").login)))
        .await;

    let query = crate::wire::PathQuery {
        path: "/store/missing".to_string(),
        write: false,
        stage: false,
    };
    peer.send(5, Request::Select(query)).await;

    let frame = peer.recv_code(RRCode::Error).await;
    assert_eq!(frame.header.stream_id, 5);
    assert_eq!(error_code(&frame), ErrorCode::Unavailable);
    assert!(!peer.link.is_closed());
}

#[test_log::test(tokio::test)]
async fn test_end_of_stream_disconnects_node() {
    let cluster = TestCluster::new(1);
    let mut peer = Peer::connect(&cluster, "data01");
    peer.send(1, login("data01")).await;
    peer.send(2, Request::Ping).await;
    peer.recv().await;
    assert_eq!(cluster.manager.state().snapshot().num_active, 1);

    peer.writer.shutdown().await.unwrap();
    let link = peer.link.clone();
    peer.finish().await;

    assert!(link.is_closed());
    assert!(cluster.manager.registry().is_empty());
    assert_eq!(cluster.manager.state().snapshot().num_active, 0);
}

#[test_log::test(tokio::test)]
async fn test_second_login_drops_connection() {
    let cluster = TestCluster::new(1);
    let mut peer = Peer::connect(&cluster, "data01");
    peer.send(1, login("data01")).await;
    peer.send(2, login("data01")).await;

    let frame = peer.recv().await;
    assert_eq!(error_code(&frame), ErrorCode::Fatal);
    peer.finish().await;
    assert!(cluster.manager.registry().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_gone_ends_loop() {
    let cluster = TestCluster::new(1);
    let mut peer = Peer::connect(&cluster, "data01");
    peer.send(1, login("data01")).await;
    peer.send(2, Request::Gone).await;

    peer.finish().await;
    assert!(cluster.manager.registry().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_stale_link_does_not_disconnect_new_session() {
    let cluster = TestCluster::with_config(|config| {
        config.drop_delay = Duration::from_secs(3600);
    });
    let mut first = Peer::connect(&cluster, "data01");
    first.send(1, login("data01")).await;
    first.send(2, Request::Ping).await;
    first.recv().await;

    let mut second = Peer::connect(&cluster, "data01");
    second.send(1, login("data01")).await;
    second.send(2, Request::Ping).await;
    second.recv().await;
    assert!(first.link.is_closed());

    first.writer.shutdown().await.unwrap();
    first.finish().await;

    let node = cluster.manager.registry().nodes().pop().unwrap();
    assert!(node.flags().connected);
    assert_eq!(node.instance(), 1);
}

#[test_log::test(tokio::test)]
async fn test_unknown_code_keeps_connection() {
    let cluster = TestCluster::new(1);
    let mut peer = Peer::connect(&cluster, "data01");
    peer.send(1, login("data01")).await;

    let mut raw = Request::Ping.to_frame(9).unwrap().encode().to_vec();
    raw[4] = 99;
    peer.writer.write_all(&raw).await.unwrap();

    let frame = peer.recv().await;
    assert_eq!(frame.header.stream_id, 9);
    assert_eq!(error_code(&frame), ErrorCode::Invalid);
    assert!(!peer.link.is_closed());

    peer.send(10, Request::Ping).await;
    let frame = peer.recv().await;
    assert_eq!(frame.header.code, RRCode::Pong);
    assert_eq!(frame.header.stream_id, 10);
    let node = cluster.manager.registry().nodes().pop().unwrap();
    assert!(node.flags().connected);
}

#[test_log::test(tokio::test)]
async fn test_stale_link_requests_are_ignored() {
    let cluster = TestCluster::with_config(|config| {
        config.drop_delay = Duration::from_secs(3600);
    });
    let mut first = Peer::connect(&cluster, "data01");
    first.send(1, login("data01")).await;
    first.send(2, Request::Ping).await;
    first.recv().await;

    let mut second = Peer::connect(&cluster, "data01");
    second.send(1, login("data01")).await;
    second.send(2, Request::Ping).await;
    second.recv().await;

    first.send(3, Request::Disc(None)).await;
    first.finish().await;

    let node = cluster.manager.registry().nodes().pop().unwrap();
    assert!(node.flags().connected);
    assert!(!node.flags().offline);
    assert!(!second.link.is_closed());
    assert_eq!(cluster.manager.state().snapshot().num_active, 1);

    second.send(4, Request::Ping).await;
    assert_eq!(second.recv().await.header.code, RRCode::Pong);
}
