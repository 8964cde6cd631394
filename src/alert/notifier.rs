use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};

use super::incident::IncidentRecord;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
}

/// Fan-out of fired incidents to any number of subscribers.
///
/// Publishing never blocks; with no subscriber the record is simply dropped,
/// and a slow subscriber loses the oldest records first.
#[derive(Clone)]
pub struct AlertBus {
    tx: broadcast::Sender<IncidentRecord>,
}

impl AlertBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, record: IncidentRecord) {
        let delivered = self.tx.send(record).unwrap_or(0);
        tracing::trace!(subscribers = delivered, "incident published");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IncidentRecord> {
        self.tx.subscribe()
    }
}

/// Posts every published incident to the alert sink.
pub struct HttpNotifier {
    client: reqwest::Client,
    url: String,
}

impl HttpNotifier {
    pub fn new(url: String, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(format!("facewatch/{}", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, url })
    }

    pub async fn send(&self, record: &IncidentRecord) -> Result<(), NotifyError> {
        self.client
            .post(&self.url)
            .json(record)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Drain the bus until every sender is gone. Delivery is best-effort:
    /// failures are logged and the record is not retried.
    pub async fn run(self, mut rx: broadcast::Receiver<IncidentRecord>) {
        tracing::info!(url = %self.url, "alert notifier started");
        loop {
            match rx.recv().await {
                Ok(record) => match self.send(&record).await {
                    Ok(()) => {
                        tracing::debug!(label = %record.name, file = %record.filename, "alert delivered")
                    }
                    Err(e) => {
                        tracing::debug!(label = %record.name, error = %e, "alert delivery failed")
                    }
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "alert notifier fell behind, dropping alerts");
                }
                Err(RecvError::Closed) => break,
            }
        }
        tracing::info!("alert notifier stopped");
    }
}

/// Start the notifier on `runtime` if a sink URL is configured.
pub fn spawn_notifier(
    runtime: &tokio::runtime::Handle,
    bus: &AlertBus,
    url: &str,
    timeout: Duration,
) -> Option<tokio::task::JoinHandle<()>> {
    if url.is_empty() {
        tracing::info!("alert sink disabled");
        return None;
    }
    match HttpNotifier::new(url.to_string(), timeout) {
        Ok(notifier) => Some(runtime.spawn(notifier.run(bus.subscribe()))),
        Err(e) => {
            tracing::error!(error = %e, "failed to build alert client, notifications disabled");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::IncidentLogger;
    use crate::recognition::testing::{solid_frame, temp_dir};
    use crate::storage::IncidentStore;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    /// Alert sink answering 204 to every POST, over any number of
    /// connections, forwarding each decoded body.
    async fn sink() -> (String, mpsc::UnboundedReceiver<IncidentRecord>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/alerts", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve_sink_connection(socket, tx.clone()));
            }
        });
        (url, rx)
    }

    async fn serve_sink_connection(mut socket: TcpStream, tx: mpsc::UnboundedSender<IncidentRecord>) {
        let mut pending = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            while let Some((body, consumed)) = split_request(&pending) {
                pending.drain(..consumed);
                if let Ok(record) = serde_json::from_slice(&body) {
                    let _ = tx.send(record);
                }
                if socket.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.is_err() {
                    return;
                }
            }
            match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => pending.extend_from_slice(&chunk[..n]),
            }
        }
    }

    /// Body and total size of the first complete request in `data`.
    fn split_request(data: &[u8]) -> Option<(Vec<u8>, usize)> {
        let head_end = data.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
        let head = String::from_utf8_lossy(&data[..head_end]).to_ascii_lowercase();
        let length = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        let end = head_end + length;
        (data.len() >= end).then(|| (data[head_end..end].to_vec(), end))
    }

    fn record(name: &str) -> IncidentRecord {
        IncidentRecord {
            name: name.to_string(),
            camera_id: 0,
            timestamp: "20240101_000000".into(),
            filename: format!("20240101_000000_cam0_{name}.jpg"),
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = AlertBus::new(2);
        bus.publish(record("alice"));
    }

    #[test]
    fn test_every_subscriber_sees_record() {
        let bus = AlertBus::new(4);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(record("alice"));
        assert_eq!(a.try_recv().unwrap().name, "alice");
        assert_eq!(b.try_recv().unwrap().name, "alice");
    }

    #[tokio::test]
    async fn test_unreachable_sink_is_an_error_not_a_hang() {
        // bind and drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let notifier =
            HttpNotifier::new(format!("http://{addr}/alerts"), Duration::from_millis(300)).unwrap();
        let started = std::time::Instant::now();
        assert!(notifier.send(&record("alice")).await.is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_posts_json_body() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut received = Vec::new();
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
                if n == 0 || String::from_utf8_lossy(&received).contains("\"filename\"") {
                    break;
                }
            }
            socket
                .write_all(b"HTTP/1.1 201 Created\r\ncontent-length: 0\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8_lossy(&received).into_owned()
        });

        let notifier =
            HttpNotifier::new(format!("http://{addr}/alerts"), Duration::from_millis(800)).unwrap();
        notifier.send(&record("alice")).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /alerts"));
        assert!(request.contains("\"name\":\"alice\""));
        assert!(request.contains("\"camera_id\":0"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_logged_incident_reaches_sink() {
        let (url, mut received) = sink().await;
        let bus = AlertBus::new(8);
        let notifier = spawn_notifier(
            &tokio::runtime::Handle::current(),
            &bus,
            &url,
            Duration::from_millis(800),
        )
        .unwrap();

        let dir = temp_dir("notify-e2e");
        let logger = IncidentLogger::new(dir.clone(), IncidentStore::new(10), bus);
        let record = logger.log(&solid_frame(16, 16, 90.0), "alice", 2, chrono::Local::now());

        let delivered = timeout(Duration::from_secs(5), received.recv()).await.unwrap().unwrap();
        assert_eq!(delivered, record);

        notifier.abort();
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_no_sink_url_spawns_nothing() {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let bus = AlertBus::new(1);
        assert!(spawn_notifier(runtime.handle(), &bus, "", Duration::from_millis(100)).is_none());
    }

    #[tokio::test]
    async fn test_lagging_notifier_keeps_delivering() {
        let (url, mut received) = sink().await;
        let bus = AlertBus::new(1);
        let rx = bus.subscribe();
        // capacity 1: "a" and "b" are overwritten before the notifier runs
        for name in ["a", "b", "c"] {
            bus.publish(record(name));
        }

        let notifier = HttpNotifier::new(url, Duration::from_millis(800)).unwrap();
        let task = tokio::spawn(notifier.run(rx));

        let first = timeout(Duration::from_secs(5), received.recv()).await.unwrap().unwrap();
        assert_eq!(first.name, "c");

        bus.publish(record("d"));
        let next = timeout(Duration::from_secs(5), received.recv()).await.unwrap().unwrap();
        assert_eq!(next.name, "d");

        // last sender gone, the notifier winds down on its own
        drop(bus);
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}
