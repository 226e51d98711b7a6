//! Connection abstraction consumed by the cluster core.
//!
//! The core never opens sockets. A [`Link`] is handed to it by whoever
//! accepted the connection and is only used to push frames and to learn
//! who is on the other side.

use bytes::Bytes;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("link to {0} is closed")]
    Closed(String),
}

pub trait Link: Send + Sync {
    /// Queue an encoded frame for delivery.
    fn send(&self, data: Bytes) -> Result<(), LinkError>;

    /// Host name of the peer.
    fn host(&self) -> &str;

    /// Address of the peer, when known.
    fn addr(&self) -> Option<IpAddr>;

    /// Tear the link down. Further sends fail.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// A [`Link`] backed by an unbounded channel. The receiving half is drained
/// by [`ChannelLink::spawn_writer`] or, in tests, read directly.
pub struct ChannelLink {
    host: String,
    addr: Option<IpAddr>,
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    closed: AtomicBool,
}

impl ChannelLink {
    pub fn new(
        host: impl Into<String>,
        addr: Option<IpAddr>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = ChannelLink {
            host: host.into(),
            addr,
            tx: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
        };
        (Arc::new(link), rx)
    }

    /// Pump queued frames into `writer` until the link is closed or the
    /// writer fails.
    pub fn spawn_writer<W>(
        &self,
        mut rx: mpsc::UnboundedReceiver<Bytes>,
        mut writer: W,
    ) -> tokio::task::JoinHandle<()>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let host = self.host.clone();
        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if let Err(err) = writer.write_all(&data).await {
                    tracing::warn!(host=%host, error=%err, "Failed to write frame, closing writer");
                    break;
                }
            }
            let _ = writer.shutdown().await;
            tracing::trace!(host=%host, "Link writer finished");
        })
    }
}

impl Link for ChannelLink {
    fn send(&self, data: Bytes) -> Result<(), LinkError> {
        let tx = self.tx.lock();
        match tx.as_ref() {
            Some(tx) if !self.is_closed() => tx
                .send(data)
                .map_err(|_| LinkError::Closed(self.host.clone())),
            _ => Err(LinkError::Closed(self.host.clone())),
        }
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn addr(&self) -> Option<IpAddr> {
        self.addr
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.tx.lock().take();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_send_after_close_fails() {
        let (link, mut rx) = ChannelLink::new("data01", None);
        link.send(Bytes::from_static(b"one")).unwrap();
        link.close();

        assert_matches!(link.send(Bytes::from_static(b"two")), Err(LinkError::Closed(h)) if h == "data01");
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"one"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_writer_pumps_frames() {
        let (link, rx) = ChannelLink::new("data01", None);
        let (client, mut server) = tokio::io::duplex(64);
        let handle = link.spawn_writer(rx, client);

        link.send(Bytes::from_static(b"abc")).unwrap();
        link.close();
        handle.await.unwrap();

        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut server, &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"abc");
    }
}
