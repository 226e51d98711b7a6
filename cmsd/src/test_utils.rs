//! Simple test utilities for driving a manager without sockets
//!
//! The [`TestCluster`] owns a [`Manager`] with its own temporary admin
//! directory. Nodes log in over in-memory [`ChannelLink`]s so every frame
//! the manager sends them can be decoded and asserted on.
//!
//! # Quick Start
//!
//! ```
//! use crate::test_utils::prelude::*;
//!
//! #[test_log::test(tokio::test)]
//! async fn test_my_handler() {
//!     let cluster = TestCluster::new(1);
//!     let mut node = cluster.login(TestLogin::server("data01").writable("/store"));
//!
//!     let reply = node.request(&cluster, Request::Have("/store/a".into())).unwrap();
//!     assert_eq!(reply, Reply::Done);
//!     assert!(node.frames().is_empty());
//! }
//! ```

use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::ManagerConfig;
use crate::link::ChannelLink;
use crate::manager::Manager;
use crate::node::{HandlerError, Node, Reply};
use crate::wire::{
    CURRENT_PROTOCOL_VERSION, DiskReport, Export, Frame, Login, RRCode, Request, Response,
};

/// A fresh, empty admin directory under the system temp dir.
pub fn admin_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("cmsd-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create admin dir");
    dir
}

/// Builder for login bodies.
#[derive(Debug, Clone)]
pub struct TestLogin {
    pub login: Login,
}

impl TestLogin {
    pub fn new(host: &str, role: &str) -> Self {
        TestLogin {
            login: Login {
                protocol_version: CURRENT_PROTOCOL_VERSION,
                role: role.to_string(),
                host: host.to_string(),
                port: 1094,
                session_id: Some(format!("{}-session", host)),
                level: 0,
                config_id: 1,
                exports: Vec::new(),
                suspended: false,
                no_stage: false,
                disk: DiskReport {
                    disk_free: 1 << 20,
                    disk_util: 10,
                    disk_nums: 1,
                },
                credentials: b"unix\0cmsd".to_vec(),
            },
        }
    }

    pub fn server(host: &str) -> Self {
        Self::new(host, "server")
    }

    pub fn manager(host: &str) -> Self {
        Self::new(host, "manager")
    }

    pub fn writable(mut self, prefix: &str) -> Self {
        self.login.exports.push(Export {
            prefix: prefix.to_string(),
            writable: true,
        });
        self
    }

    pub fn read_only(mut self, prefix: &str) -> Self {
        self.login.exports.push(Export {
            prefix: prefix.to_string(),
            writable: false,
        });
        self
    }

    pub fn level(mut self, level: u8) -> Self {
        self.login.level = level;
        self
    }

    pub fn no_stage(mut self) -> Self {
        self.login.no_stage = true;
        self
    }
}

/// A logged in node and the frames the manager sent it.
pub struct TestNode {
    pub node: Node,
    pub link: Arc<ChannelLink>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl std::fmt::Debug for TestNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestNode").field("node", &self.node).finish()
    }
}

impl TestNode {
    pub fn request(
        &self,
        cluster: &TestCluster,
        request: Request,
    ) -> Result<Reply, HandlerError> {
        self.node.dispatch(&cluster.manager, request)
    }

    /// Every frame sent so far.
    pub fn frames(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(data) = self.rx.try_recv() {
            frames.push(Frame::decode(data).expect("decode frame"));
        }
        frames
    }

    /// Wait for the next frame with `code`, skipping others.
    pub async fn expect(&mut self, code: RRCode) -> Frame {
        let wait = async {
            loop {
                let data = self.rx.recv().await.expect("link closed");
                let frame = Frame::decode(data).expect("decode frame");
                if frame.header.code == code {
                    return frame;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(1), wait)
            .await
            .unwrap_or_else(|_| panic!("no {:?} frame", code))
    }

    /// Modifiers of every status frame received so far.
    pub fn statuses(&mut self) -> Vec<u8> {
        self.frames()
            .into_iter()
            .filter(|f| f.header.code == RRCode::Status)
            .map(|f| f.header.modifier)
            .collect()
    }
}

pub struct TestCluster {
    pub manager: Arc<Manager>,
    pub admin: PathBuf,
}

impl TestCluster {
    pub fn new(min_nodes: u32) -> Self {
        Self::with_config(|config| config.min_nodes = min_nodes)
    }

    pub fn with_config(f: impl FnOnce(&mut ManagerConfig)) -> Self {
        let admin = admin_dir();
        let mut config = ManagerConfig {
            name: "test-manager".to_string(),
            admin_path: Some(admin.clone()),
            drop_delay: Duration::ZERO,
            heartbeat_interval: Duration::ZERO,
            ..ManagerConfig::default()
        };
        f(&mut config);
        TestCluster {
            manager: Manager::new(config),
            admin,
        }
    }

    pub fn login(&self, login: TestLogin) -> TestNode {
        self.try_login(login).expect("login failed")
    }

    pub fn try_login(&self, login: TestLogin) -> Result<TestNode, crate::node::LoginError> {
        let peer = login.login.host.clone();
        self.try_login_from(&peer, login)
    }

    /// Log in over a link whose far end is `peer`, whatever the login says.
    pub fn try_login_from(
        &self,
        peer: &str,
        login: TestLogin,
    ) -> Result<TestNode, crate::node::LoginError> {
        let (link, rx) = ChannelLink::new(peer, None);
        let node = self.manager.login(login.login, link.clone())?;
        Ok(TestNode { node, link, rx })
    }

    /// Decode the single response in `reply`.
    pub fn response(reply: Reply) -> Response {
        match reply {
            Reply::Respond(response) => response,
            other => panic!("expected a response, got {:?}", other),
        }
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        self.manager.shutdown();
        let _ = std::fs::remove_dir_all(&self.admin);
    }
}

pub mod prelude {
    pub use super::{TestCluster, TestLogin, TestNode, admin_dir};
    pub use crate::node::{HandlerError, Reply};
    pub use crate::wire::{RRCode, Request, Response, modifier};
    pub use assert_matches::assert_matches;
    pub use std::sync::Arc;
}
