//! QMP client over a Unix domain socket.
//!
//! Every message is one JSON object per line. After connecting, the client
//! reads the `{"QMP": ...}` greeting and negotiates capabilities; from then
//! on a background reader task routes each line:
//! - `{"event": ...}` → the event feed
//! - `{"return": ...}` / `{"error": ...}` → the waiting command, by `id`
//!
//! When the socket closes the event feed closes with it and any waiting
//! command fails with [`BackupError::ConnectionClosed`].

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{Command, Event, EventSender, EventStream, Transport};
use crate::{BackupError, Result};

type Lines = FramedRead<OwnedReadHalf, LinesCodec>;
type Writer = FramedWrite<OwnedWriteHalf, LinesCodec>;

/// Requests waiting for a reply. `None` once the socket has closed.
type Pending = Arc<Mutex<Option<HashMap<String, oneshot::Sender<Reply>>>>>;

#[derive(Serialize)]
struct Request<'a> {
    #[serde(flatten)]
    command: &'a Command,
    id: &'a str,
}

#[derive(Debug, Deserialize)]
struct Reply {
    #[serde(rename = "return")]
    value: Option<Value>,
    error: Option<ReplyError>,
    id: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ReplyError {
    class: String,
    desc: String,
}

/// Connected QMP monitor.
pub struct QmpClient {
    writer: Mutex<Writer>,
    pending: Pending,
    events: Mutex<Option<EventStream>>,
    greeting: Value,
    reader: JoinHandle<()>,
}

impl QmpClient {
    /// Connect to the monitor socket at `path` and negotiate capabilities.
    ///
    /// `timeout` bounds the whole handshake. Commands issued later are
    /// never timed out.
    pub async fn connect(path: impl AsRef<Path>, timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        info!("Connecting to QMP socket {}", path.display());

        let (lines, writer, greeting) = tokio::time::timeout(timeout, handshake(path))
            .await
            .map_err(|_| {
                BackupError::Connection(format!(
                    "timed out after {:?} connecting to {}",
                    timeout,
                    path.display()
                ))
            })??;

        debug!("QMP greeting: {}", greeting);

        let pending: Pending = Arc::new(Mutex::new(Some(HashMap::new())));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(lines, event_tx, Arc::clone(&pending)));

        info!("Connected to QMP socket {}", path.display());

        Ok(Self {
            writer: Mutex::new(writer),
            pending,
            events: Mutex::new(Some(event_rx)),
            greeting,
            reader,
        })
    }

    /// Hand out the event feed. Only the first caller gets it.
    pub async fn take_events(&self) -> Option<EventStream> {
        self.events.lock().await.take()
    }

    /// The `QMP` object of the server greeting (version, capabilities).
    pub fn greeting(&self) -> &Value {
        &self.greeting
    }
}

impl Drop for QmpClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl Transport for QmpClient {
    async fn execute(&self, command: &Command) -> Result<Value> {
        let id = Uuid::new_v4().to_string();
        let line = serde_json::to_string(&Request { command, id: &id })?;
        debug!("QMP request: {}", line);

        let (tx, rx) = oneshot::channel();
        match self.pending.lock().await.as_mut() {
            Some(pending) => {
                pending.insert(id.clone(), tx);
            }
            None => return Err(BackupError::ConnectionClosed),
        }

        // The writer lock is held until the reply arrives, so only one
        // command is ever outstanding.
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.send(line).await {
            if let Some(pending) = self.pending.lock().await.as_mut() {
                pending.remove(&id);
            }
            return Err(e.into());
        }

        let reply = rx.await.map_err(|_| BackupError::ConnectionClosed)?;
        drop(writer);

        match (reply.value, reply.error) {
            (_, Some(err)) => {
                debug!("QMP error reply to {}: {} ({})", command.execute, err.desc, err.class);
                Err(BackupError::Qmp {
                    command: command.execute.to_string(),
                    class: err.class,
                    desc: err.desc,
                })
            }
            (Some(value), None) => {
                debug!(
                    "QMP reply to {}: {}",
                    command.execute,
                    serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
                );
                Ok(value)
            }
            (None, None) => Ok(Value::Null),
        }
    }
}

async fn handshake(path: &Path) -> Result<(Lines, Writer, Value)> {
    let stream = UnixStream::connect(path)
        .await
        .map_err(|e| BackupError::Connection(format!("{}: {}", path.display(), e)))?;

    let (read_half, write_half) = stream.into_split();
    let mut lines = FramedRead::new(read_half, LinesCodec::new());
    let mut writer = FramedWrite::new(write_half, LinesCodec::new());

    let greeting = next_message(&mut lines).await?;
    let greeting = greeting
        .get("QMP")
        .cloned()
        .ok_or_else(|| BackupError::Protocol(format!("unexpected greeting: {}", greeting)))?;

    writer
        .send(json!({ "execute": "qmp_capabilities" }).to_string())
        .await?;

    loop {
        let message = next_message(&mut lines).await?;
        if message.get("event").is_some() {
            debug!("Ignoring event during handshake: {}", message);
            continue;
        }
        if let Some(err) = message.get("error") {
            return Err(BackupError::Qmp {
                command: "qmp_capabilities".to_string(),
                class: err["class"].as_str().unwrap_or_default().to_string(),
                desc: err["desc"].as_str().unwrap_or_default().to_string(),
            });
        }
        break;
    }

    Ok((lines, writer, greeting))
}

async fn next_message(lines: &mut Lines) -> Result<Value> {
    match lines.next().await {
        Some(line) => Ok(serde_json::from_str(&line?)?),
        None => Err(BackupError::ConnectionClosed),
    }
}

async fn read_loop(mut lines: Lines, events: EventSender, pending: Pending) {
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!("QMP read error: {}", e);
                break;
            }
        };
        route_line(&line, &events, &pending).await;
    }

    info!("QMP socket closed");

    // Dropping the senders fails every waiting command.
    pending.lock().await.take();
}

async fn route_line(line: &str, events: &EventSender, pending: &Pending) {
    let message: Value = match serde_json::from_str(line) {
        Ok(message) => message,
        Err(e) => {
            warn!("Discarding malformed QMP line: {} ({})", line, e);
            return;
        }
    };

    if message.get("event").is_some() {
        match serde_json::from_value::<Event>(message) {
            Ok(event) => {
                debug!("QMP event: {} {}", event.kind, event.data);
                // Nobody listening is not an error, events are advisory.
                let _ = events.send(event);
            }
            Err(e) => warn!("Discarding malformed QMP event: {} ({})", line, e),
        }
        return;
    }

    let reply: Reply = match serde_json::from_value(message) {
        Ok(reply) => reply,
        Err(e) => {
            warn!("Discarding unexpected QMP message: {} ({})", line, e);
            return;
        }
    };

    let mut guard = pending.lock().await;
    let Some(waiting) = guard.as_mut() else {
        return;
    };

    let sender = match reply.id.as_ref().and_then(Value::as_str) {
        Some(id) => waiting.remove(id),
        // Replies to malformed requests carry no id; with one command in
        // flight it can only belong to that one.
        None if waiting.len() == 1 => {
            let id = waiting.keys().next().cloned();
            id.and_then(|id| waiting.remove(&id))
        }
        None => None,
    };

    match sender {
        Some(sender) => {
            let _ = sender.send(reply);
        }
        None => warn!("QMP reply with no matching request: {}", line),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qmp::{commands, DomainError, BLOCK_JOB_COMPLETED};
    use std::path::PathBuf;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    async fn read_request(lines: &mut tokio::io::Lines<BufReader<OwnedReadHalf>>) -> Value {
        let line = lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn write_line(write: &mut OwnedWriteHalf, value: Value) {
        write.write_all(format!("{}\n", value).as_bytes()).await.unwrap();
    }

    /// Greets, negotiates, answers one query-block (after pushing an event)
    /// and fails one blockdev-add, then hangs up.
    async fn fake_qmp_server(listener: UnixListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        write_line(
            &mut write,
            json!({"QMP": {"version": {"qemu": {"major": 9, "minor": 0, "micro": 0}}, "capabilities": []}}),
        )
        .await;

        let caps = read_request(&mut lines).await;
        assert_eq!(caps["execute"], "qmp_capabilities");
        write_line(&mut write, json!({"return": {}})).await;

        let query = read_request(&mut lines).await;
        assert_eq!(query["execute"], "query-block");
        write_line(
            &mut write,
            json!({"event": BLOCK_JOB_COMPLETED, "data": {"device": "drive0"}, "timestamp": {"seconds": 1, "microseconds": 2}}),
        )
        .await;
        write_line(
            &mut write,
            json!({"return": [{"device": "drive0", "inserted": {"image": {"virtual-size": 1024}}}], "id": query["id"]}),
        )
        .await;

        let add = read_request(&mut lines).await;
        assert_eq!(add["execute"], "blockdev-add");
        assert_eq!(add["arguments"]["node-name"], "target0-node");
        write_line(
            &mut write,
            json!({"error": {"class": "GenericError", "desc": "Could not open '/b/vm.full.qcow2': No such file or directory"}, "id": add["id"]}),
        )
        .await;
    }

    #[tokio::test]
    async fn test_commands_and_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qmp.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(fake_qmp_server(listener));

        let client = QmpClient::connect(&path, Duration::from_secs(2)).await.unwrap();
        assert_eq!(client.greeting()["version"]["qemu"]["major"], 9);

        let mut events = client.take_events().await.unwrap();
        assert!(client.take_events().await.is_none());

        let reply = client.execute(&commands::query_block()).await.unwrap();
        assert_eq!(commands::virtual_size(&reply, "drive0"), Some(1024));

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, BLOCK_JOB_COMPLETED);
        assert_eq!(event.device(), Some("drive0"));

        let err = client
            .execute(&commands::blockdev_add(
                "target0-node",
                &PathBuf::from("/b/vm.full.qcow2"),
            ))
            .await
            .unwrap_err();
        assert!(err.is_domain(DomainError::MissingFile));

        server.await.unwrap();

        // Hang-up closes the feed and fails later commands.
        assert!(events.recv().await.is_none());
        assert!(client.execute(&commands::query_block()).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_times_out_without_greeting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("silent.sock");
        let _listener = UnixListener::bind(&path).unwrap();

        let err = QmpClient::connect(&path, Duration::from_millis(100))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BackupError::Connection(_)));
    }

    #[tokio::test]
    async fn test_connect_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let err = QmpClient::connect(dir.path().join("absent.sock"), Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BackupError::Connection(_)));
    }
}
