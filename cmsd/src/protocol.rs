//! Per-connection command loop.
//!
//! The caller accepts the socket, wraps its write half in a [`Link`] and
//! hands the read half to [`serve`]. The first frame must be a login; every
//! frame after that is decoded and dispatched against the logged in node.

use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::Instrument;

use crate::link::Link;
use crate::manager::Manager;
use crate::node::{LoginError, Node, Reply};
use crate::wire::{ErrorCode, ErrorReply, Frame, FrameReader, Request, Response, WireError};

#[cfg(test)]
#[path = "protocol.test.rs"]
mod tests;

/// Drive one connection until the peer leaves or the link breaks.
pub async fn serve<R>(manager: Arc<Manager>, link: Arc<dyn Link>, reader: R)
where
    R: AsyncRead + Send + Unpin,
{
    let span = tracing::debug_span!("connection", host = %link.host());
    run(manager, link, FrameReader::new(reader))
        .instrument(span)
        .await
}

async fn run<R>(manager: Arc<Manager>, link: Arc<dyn Link>, mut reader: FrameReader<R>)
where
    R: AsyncRead + Send + Unpin,
{
    let Some(node) = accept_login(&manager, &link, &mut reader).await else {
        link.close();
        return;
    };

    let reason = loop {
        let frame = match reader.read_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break "connection closed",
            Err(WireError::Unsupported { stream_id, code }) => {
                tracing::debug!(node=%node, code, "Rejecting unsupported request");
                let message = format!("unsupported request code {}", code);
                respond_error(&link, stream_id, ErrorCode::Invalid, message);
                continue;
            }
            Err(err) => {
                tracing::warn!(node=%node, error=%err, "Unreadable frame, dropping connection");
                break "unreadable frame";
            }
        };
        let stream_id = frame.header.stream_id;
        let request = match Request::from_frame(&frame) {
            Ok(request) => request,
            Err(err) => {
                tracing::debug!(node=%node, error=%err, "Rejecting malformed request");
                respond_error(&link, stream_id, ErrorCode::Invalid, err.to_string());
                continue;
            }
        };

        // Frames still buffered on a link the node has since replaced must
        // not touch the new session.
        if !node.is_current_link(&link) {
            tracing::debug!(node=%node, code=?request.code(), "Link superseded by a newer login");
            break "link superseded";
        }

        match node.dispatch(&manager, request) {
            Ok(Reply::Done) => {}
            Ok(Reply::Respond(response)) => respond(&link, stream_id, &response),
            Ok(Reply::Forward(forward)) => manager.forward(forward),
            Ok(Reply::Close) => return,
            Err(err) => {
                let reply = err.to_reply();
                respond(&link, stream_id, &Response::Error(reply));
                if err.is_fatal() {
                    tracing::warn!(node=%node, error=%err, "Fatal request, dropping connection");
                    break "fatal request";
                }
            }
        }
    };

    // A node that already logged in again owns a newer link.
    if node.is_current_link(&link) {
        manager.disconnect(&node, reason);
    } else {
        link.close();
    }
}

async fn accept_login<R>(
    manager: &Manager,
    link: &Arc<dyn Link>,
    reader: &mut FrameReader<R>,
) -> Option<Node>
where
    R: AsyncRead + Send + Unpin,
{
    let frame = match reader.read_frame().await {
        Ok(Some(frame)) => frame,
        Ok(None) => return None,
        Err(WireError::Unsupported { stream_id, code }) => {
            let err = LoginError::NotLogin(format!("request code {}", code));
            tracing::warn!(error=%err, "Login refused");
            respond(link, stream_id, &Response::Error(err.to_reply()));
            return None;
        }
        Err(err) => {
            tracing::debug!(error=%err, "Unreadable login frame");
            return None;
        }
    };
    let stream_id = frame.header.stream_id;

    let result = match Request::from_frame(&frame) {
        Ok(Request::Login(login)) => manager.login(*login, link.clone()),
        Ok(other) => Err(LoginError::NotLogin(format!("{:?}", other.code()))),
        Err(err) => Err(LoginError::NotLogin(err.to_string())),
    };
    match result {
        Ok(node) => Some(node),
        Err(err) => {
            tracing::warn!(error=%err, "Login refused");
            respond(link, stream_id, &Response::Error(err.to_reply()));
            None
        }
    }
}

fn respond_error(link: &Arc<dyn Link>, stream_id: u32, code: ErrorCode, message: String) {
    respond(link, stream_id, &Response::Error(ErrorReply { code, message }));
}

fn respond(link: &Arc<dyn Link>, stream_id: u32, response: &Response) {
    let result = response
        .to_frame(stream_id)
        .map(|frame: Frame| frame.encode());
    match result {
        Ok(data) => {
            if let Err(err) = link.send(data) {
                tracing::debug!(error=%err, "Unable to send response");
            }
        }
        Err(err) => tracing::error!(error=%err, "Unable to encode response"),
    }
}
