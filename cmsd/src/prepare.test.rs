use super::*;
use std::time::Duration;
use tokio::sync::mpsc;

/// Records every request it sees and fails the ones whose path starts with
/// `/missing`.
struct Recorder {
    seen: mpsc::UnboundedSender<String>,
}

impl PrepareHandler for Recorder {
    fn process(&self, request: &PrepareRequest) -> Result<PrepareOutcome, PrepareError> {
        let _ = self.seen.send(request.path.clone());
        if request.path.starts_with("/missing") {
            return Err(SelectError::NoServer {
                verb: "stage",
                path: request.path.clone(),
            }
            .into());
        }
        Ok(PrepareOutcome::Dispatched(NodeId(1)))
    }
}

fn spawn_worker(
    queue: &Arc<PrepareQueue>,
) -> (mpsc::UnboundedReceiver<String>, CancellationToken) {
    let (seen, rx) = mpsc::unbounded_channel();
    let cancellation = CancellationToken::new();
    tokio::spawn(
        queue
            .clone()
            .run(Arc::new(Recorder { seen }), cancellation.clone()),
    );
    (rx, cancellation)
}

async fn next_seen(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("worker idle")
        .expect("worker gone")
}

#[test]
fn test_from_wire() {
    let request = PrepareRequest::from_wire(PrepAdd {
        reqid: String::new(),
        ident: "client@host".to_string(),
        notify: "mailto:ops".to_string(),
        priority: 9,
        mode: "r".to_string(),
        options: options::MAKE_RW | options::COLOC,
        path: "/store/a".to_string(),
        opaque: Some("x=1".to_string()),
        coloc: Some("/store/b".to_string()),
    });
    assert!(!request.id.as_str().is_empty());
    assert_eq!(request.priority, MAX_PRIORITY);
    assert!(request.wants_write());
    assert_eq!(request.coloc_path(), Some("/store/b"));

    let wire = request.to_wire();
    assert_eq!(wire.reqid, request.id.to_string());
    assert_eq!(wire.path, "/store/a");
}

#[test]
fn test_coloc_needs_option() {
    let mut request = PrepareRequest::new("/store/a");
    request.coloc = Some("/store/b".to_string());
    assert_eq!(request.coloc_path(), None);
}

#[tokio::test]
async fn test_next_is_fifo() {
    let queue = PrepareQueue::new();
    for i in 0..5 {
        queue.push(PrepareRequest::new(format!("/f{}", i)));
    }
    for i in 0..5 {
        assert_eq!(queue.next().await.unwrap().path, format!("/f{}", i));
    }
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_cancel_skips_request() {
    let queue = PrepareQueue::new();
    let first = PrepareRequest::new("/f0");
    let second = PrepareRequest::new("/f1");
    let id = first.id.clone();
    queue.push(first);
    queue.push(second);

    assert!(queue.cancel(&id));
    assert!(!queue.cancel(&id));
    assert_eq!(queue.pending().len(), 1);
    assert_eq!(queue.next().await.unwrap().path, "/f1");

    let pending = tokio::time::timeout(Duration::from_millis(50), queue.next()).await;
    assert!(pending.is_err());
}

#[tokio::test]
async fn test_close_releases_waiter() {
    let queue = PrepareQueue::new();
    queue.close();
    assert!(queue.next().await.is_none());
}

#[test_log::test(tokio::test)]
async fn test_worker_serves_in_order() {
    let queue = Arc::new(PrepareQueue::new());
    let (mut seen, cancellation) = spawn_worker(&queue);

    let paths: Vec<String> = (0..20).map(|i| format!("/store/{:02}", i)).collect();
    for path in &paths {
        queue.push(PrepareRequest::new(path.clone()));
    }
    for path in &paths {
        assert_eq!(&next_seen(&mut seen).await, path);
    }
    cancellation.cancel();
}

#[test_log::test(tokio::test)]
async fn test_failed_selection_drops_request() {
    let queue = Arc::new(PrepareQueue::new());
    let (mut seen, cancellation) = spawn_worker(&queue);

    queue.push(PrepareRequest::new("/missing/file"));
    queue.push(PrepareRequest::new("/store/ok"));

    assert_eq!(next_seen(&mut seen).await, "/missing/file");
    assert_eq!(next_seen(&mut seen).await, "/store/ok");
    assert!(queue.is_empty());

    let again = tokio::time::timeout(Duration::from_millis(100), seen.recv()).await;
    assert!(again.is_err(), "request was retried");
    cancellation.cancel();
}
