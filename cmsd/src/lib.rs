//! Cluster management core for a fabric of data servers.
//!
//! A [`Manager`](manager::Manager) keeps a bounded registry of logged in
//! nodes, derives the cluster wide suspend and no-stage state from their
//! reports, and answers locate and select requests by ranking eligible
//! nodes on load and usage. [`serve`](protocol::serve) drives one
//! connection against it; sockets and listeners are left to the embedder.

pub mod admin;
pub mod config;
pub mod id;
pub mod link;
pub mod manager;
pub mod mask;
pub mod node;
pub mod prelude;
pub mod prepare;
pub mod protocol;
pub mod registry;
pub mod security;
pub mod select;
pub mod state;
#[cfg(test)]
mod test_utils;
pub mod wire;

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use crate::test_utils::{TestLogin, admin_dir};
    use crate::wire::{Location, PathQuery};
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;
    use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan};

    /// Initialize tracing for tests
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env()
                    .add_directive("cmsd=debug".parse().unwrap())
                    .add_directive("test=debug".parse().unwrap()),
            )
            .with_span_events(FmtSpan::CLOSE)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_target(false)
            .try_init();
    }

    struct Client {
        writer: tokio::io::DuplexStream,
        rx: mpsc::UnboundedReceiver<Bytes>,
    }

    impl Client {
        fn connect(manager: &Arc<Manager>, host: &str) -> Self {
            let (writer, reader) = tokio::io::duplex(4096);
            let (link, rx) = ChannelLink::new(host, None);
            tokio::spawn(serve(manager.clone(), link, reader));
            Client { writer, rx }
        }

        async fn send(&mut self, stream_id: u32, request: Request) {
            let frame = request.to_frame(stream_id).unwrap();
            self.writer.write_all(&frame.encode()).await.unwrap();
        }

        async fn recv(&mut self, code: RRCode) -> Frame {
            let wait = async {
                loop {
                    let data = self.rx.recv().await.expect("link closed");
                    let frame = Frame::decode(data).unwrap();
                    if frame.header.code == code {
                        return frame;
                    }
                }
            };
            tokio::time::timeout(Duration::from_secs(2), wait)
                .await
                .expect("timed out waiting for frame")
        }
    }

    #[tokio::test]
    async fn test_cluster_serves_select() {
        init_tracing();
        let admin = admin_dir();
        let manager = Manager::new(ManagerConfig {
            name: "top".to_string(),
            min_nodes: 2,
            admin_path: Some(admin.clone()),
            drop_delay: Duration::ZERO,
            heartbeat_interval: Duration::ZERO,
            ..ManagerConfig::default()
        });
        manager.start();

        let mut redirector = Client::connect(&manager, "redir01");
        redirector
            .send(1, Request::Login(Box::new(TestLogin::manager("redir01").login)))
            .await;
        // Below the minimum the cluster starts out suspended.
        let status = redirector.recv(RRCode::Status).await;
        assert_ne!(status.header.modifier & crate::wire::modifier::SUSPEND, 0);

        let mut servers = Vec::new();
        for host in ["data01", "data02"] {
            let mut server = Client::connect(&manager, host);
            let login = TestLogin::server(host).writable("/store").login;
            server.send(1, Request::Login(Box::new(login))).await;
            server.send(2, Request::Ping).await;
            server.recv(RRCode::Pong).await;
            servers.push(server);
        }
        // Staging may come back before the cluster resumes.
        loop {
            let status = redirector.recv(RRCode::Status).await;
            if status.header.modifier & crate::wire::modifier::RESUME != 0 {
                break;
            }
        }
        assert!(!manager.state().is_suspended());

        servers[1]
            .send(3, Request::Have("/store/file".to_string()))
            .await;
        servers[1].send(4, Request::Ping).await;
        servers[1].recv(RRCode::Pong).await;

        let query = PathQuery {
            path: "/store/file".to_string(),
            write: false,
            stage: false,
        };
        redirector.send(9, Request::Select(query)).await;
        let reply = redirector.recv(RRCode::Data).await;
        assert_eq!(reply.header.stream_id, 9);
        match Response::from_frame(&reply).unwrap() {
            Response::Select(Location { host, .. }) => assert_eq!(host, "data02"),
            other => panic!("unexpected {:?}", other),
        }

        manager.shutdown();
        let _ = std::fs::remove_dir_all(admin);
    }
}
