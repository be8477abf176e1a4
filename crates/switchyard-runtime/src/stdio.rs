//! Line-delimited JSON request/response channel over a child's stdio.
//!
//! Every request is written as one line `{"id": n, "request": {...}}`; the
//! agent answers with one line `{"id": n, "result": ...}` or
//! `{"id": n, "error": "..."}`. Lines that do not parse are logged and
//! skipped, so agents may write diagnostics to stdout.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::{SwitchyardError, SwitchyardResult};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct StdioResponse {
    id: u64,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

type Pending = Arc<parking_lot::Mutex<HashMap<u64, oneshot::Sender<StdioResponse>>>>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Request channel bound to one agent process.
pub struct StdioChannel {
    stdin: Mutex<Writer>,
    pending: Pending,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
}

impl StdioChannel {
    /// Wire a channel to a child's stdin and stdout and start its reader task.
    pub fn attach<W, R>(stdin: W, stdout: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let pending: Pending = Arc::new(parking_lot::Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader_pending = pending.clone();
        let reader_closed = closed.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        debug!("agent stdout closed");
                        break;
                    }
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<StdioResponse>(trimmed) {
                            Ok(resp) => {
                                if let Some(tx) = reader_pending.lock().remove(&resp.id) {
                                    let _ = tx.send(resp);
                                }
                            }
                            Err(_) => debug!(line = %trimmed, "non-protocol line from agent"),
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "error reading agent stdout");
                        break;
                    }
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
            // Dropping the senders wakes every waiter with a closed-channel error.
            reader_pending.lock().clear();
        });

        Self {
            stdin: Mutex::new(Box::new(stdin)),
            pending,
            next_id: AtomicU64::new(1),
            closed,
        }
    }

    /// Whether the agent closed its stdout.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send one request and wait for its response.
    pub async fn request(
        &self,
        request: serde_json::Value,
        timeout: Duration,
    ) -> SwitchyardResult<serde_json::Value> {
        if self.is_closed() {
            return Err(SwitchyardError::Execution(
                "agent connection unavailable: stdout closed".into(),
            ));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let line = serde_json::to_string(&serde_json::json!({ "id": id, "request": request }))?;
        if let Err(e) = self.write_line(&line).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        let resp = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(_)) => {
                return Err(SwitchyardError::Execution(
                    "agent connection closed before responding".into(),
                ))
            }
            Err(_) => {
                self.pending.lock().remove(&id);
                return Err(SwitchyardError::Timeout(format!(
                    "agent request {} timeout after {}ms",
                    id,
                    timeout.as_millis()
                )));
            }
        };

        match (resp.result, resp.error) {
            (_, Some(message)) => Err(SwitchyardError::Execution(message)),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(serde_json::Value::Null),
        }
    }

    async fn write_line(&self, line: &str) -> SwitchyardResult<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await.map_err(|e| {
            SwitchyardError::Execution(format!("agent connection write failed: {}", e))
        })?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

impl std::fmt::Debug for StdioChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioChannel")
            .field("closed", &self.is_closed())
            .field("in_flight", &self.pending.lock().len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    /// A channel plus the agent's ends of its stdin and stdout.
    fn connected() -> (StdioChannel, BufReader<DuplexStream>, DuplexStream) {
        let (to_agent, agent_stdin) = duplex(4096);
        let (agent_stdout, from_agent) = duplex(4096);
        let channel = StdioChannel::attach(to_agent, from_agent);
        (channel, BufReader::new(agent_stdin), agent_stdout)
    }

    async fn read_request(stdin: &mut BufReader<DuplexStream>) -> Value {
        let mut line = String::new();
        stdin.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let (channel, mut stdin, mut stdout) = connected();
        let agent = tokio::spawn(async move {
            let request = read_request(&mut stdin).await;
            let reply = json!({ "id": request["id"], "result": { "echo": request["request"] } });
            stdout
                .write_all(format!("{reply}\n").as_bytes())
                .await
                .unwrap();
            (stdin, stdout)
        });

        let result = channel
            .request(json!({ "operation": "ping" }), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result["echo"]["operation"], "ping");
        agent.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let (channel, mut stdin, mut stdout) = connected();
        let agent = tokio::spawn(async move {
            let request = read_request(&mut stdin).await;
            let id = request["id"].as_u64().unwrap();
            let lines = format!(
                "warming up caches\n{{\"id\": {id}, \"result\"\n\n{{\"id\": {id}, \"error\": \"backend overloaded\"}}\n"
            );
            stdout.write_all(lines.as_bytes()).await.unwrap();
            (stdin, stdout)
        });

        let err = channel
            .request(json!({ "operation": "index" }), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SwitchyardError::Execution(ref m) if m == "backend overloaded"));
        assert!(!channel.is_closed());
        agent.await.unwrap();
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out() {
        let (channel, _stdin, _stdout) = connected();
        let err = channel
            .request(json!({}), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, SwitchyardError::Timeout(_)));
        assert_eq!(channel.pending.lock().len(), 0);
    }

    #[tokio::test]
    async fn test_closed_stdout_fails_requests() {
        let (channel, _stdin, stdout) = connected();
        drop(stdout);
        for _ in 0..100 {
            if channel.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(channel.is_closed());
        let err = channel
            .request(json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unavailable"));
    }
}
