//! OVSDB JSON-RPC client (RFC 7047, section 4).
//!
//! One request is in flight at a time: the plugin issues its transactions
//! sequentially, so the connection is held under an async mutex for the
//! duration of each request. Server `echo` keepalives received while
//! waiting are answered inline.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ovncni_common::{CniError, CniResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::Mutex;

use crate::client::OvsdbClient;
use crate::operation::{Operation, OperationResult};

/// Where an OVSDB server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `unix:<path>`
    Unix(PathBuf),
    /// `tcp:<host>:<port>`
    Tcp(String),
}

impl FromStr for Endpoint {
    type Err = CniError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix:") {
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = s.strip_prefix("tcp:") {
            return Ok(Self::Tcp(addr.to_string()));
        }
        Err(CniError::Config {
            message: format!("unsupported OVSDB endpoint {s:?}, expected unix:<path> or tcp:<host>:<port>"),
        })
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

struct Connection {
    stream: Box<dyn Transport>,
    buffer: Vec<u8>,
}

#[derive(Serialize)]
struct Request<'a> {
    method: &'a str,
    params: Value,
    id: Value,
}

#[derive(Deserialize)]
struct Message {
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Value,
    #[serde(default)]
    id: Value,
}

fn db_error(message: impl Into<String>) -> CniError {
    CniError::Database {
        message: message.into(),
    }
}

/// A connection to one database on an OVSDB server.
pub struct JsonRpcClient {
    endpoint: Endpoint,
    database: String,
    timeout: Duration,
    next_id: AtomicU64,
    conn: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for JsonRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonRpcClient")
            .field("endpoint", &self.endpoint)
            .field("database", &self.database)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl JsonRpcClient {
    /// Connect to `endpoint` and bind transactions to `database`.
    ///
    /// `timeout` bounds the connect and every later request.
    ///
    /// # Errors
    ///
    /// Returns [`CniError::Database`] if the server is unreachable and
    /// [`CniError::Timeout`] if connecting takes longer than `timeout`.
    pub async fn connect(
        endpoint: Endpoint,
        database: impl Into<String>,
        timeout: Duration,
    ) -> CniResult<Self> {
        let database = database.into();
        let connecting = async {
            let stream: Box<dyn Transport> = match &endpoint {
                Endpoint::Unix(path) => Box::new(UnixStream::connect(path).await?),
                Endpoint::Tcp(addr) => Box::new(TcpStream::connect(addr.as_str()).await?),
            };
            Ok::<_, std::io::Error>(stream)
        };

        let stream = tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| CniError::Timeout {
                operation: format!("connection to {endpoint}"),
                after: timeout,
            })?
            .map_err(|e| db_error(format!("failed to connect to {endpoint}: {e}")))?;

        tracing::debug!(%endpoint, database = %database, "Connected to OVSDB");
        Ok(Self {
            endpoint,
            database,
            timeout,
            next_id: AtomicU64::new(0),
            conn: Mutex::new(Some(Connection {
                stream,
                buffer: Vec::new(),
            })),
        })
    }

    /// Endpoint this client is connected to.
    #[must_use]
    pub const fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Shut the connection down. Later requests fail with a database error.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the shutdown itself fails.
    pub async fn close(&self) -> CniResult<()> {
        if let Some(mut conn) = self.conn.lock().await.take() {
            conn.stream.shutdown().await?;
            tracing::debug!(endpoint = %self.endpoint, "Closed OVSDB connection");
        }
        Ok(())
    }

    async fn call(&self, method: &str, params: Value) -> CniResult<Value> {
        let id = Value::from(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| db_error(format!("connection to {} is closed", self.endpoint)))?;

        let request = Request {
            method,
            params,
            id: id.clone(),
        };
        conn.send(&serde_json::to_vec(&request)?).await?;

        loop {
            let message = conn.receive().await?;
            if message.method.as_deref() == Some("echo") {
                let reply = serde_json::json!({
                    "result": message.params,
                    "error": null,
                    "id": message.id,
                });
                conn.send(&serde_json::to_vec(&reply)?).await?;
                continue;
            }
            if message.method.is_some() {
                tracing::trace!(method = ?message.method, "Ignoring OVSDB notification");
                continue;
            }
            if message.id != id {
                tracing::debug!(id = %message.id, "Ignoring stale OVSDB response");
                continue;
            }
            if !message.error.is_null() {
                return Err(db_error(format!("{method} failed: {}", message.error)));
            }
            return Ok(message.result);
        }
    }
}

impl Connection {
    async fn send(&mut self, bytes: &[u8]) -> CniResult<()> {
        self.stream
            .write_all(bytes)
            .await
            .map_err(|e| db_error(format!("write failed: {e}")))?;
        self.stream
            .flush()
            .await
            .map_err(|e| db_error(format!("flush failed: {e}")))
    }

    async fn receive(&mut self) -> CniResult<Message> {
        loop {
            if let Some(message) = self.take_message()? {
                return Ok(message);
            }
            let read = self
                .stream
                .read_buf(&mut self.buffer)
                .await
                .map_err(|e| db_error(format!("read failed: {e}")))?;
            if read == 0 {
                return Err(db_error("connection closed by server"));
            }
        }
    }

    /// Pop one complete JSON value off the front of the buffer.
    fn take_message(&mut self) -> CniResult<Option<Message>> {
        let (message, consumed) = {
            let mut values =
                serde_json::Deserializer::from_slice(&self.buffer).into_iter::<Message>();
            match values.next() {
                Some(Ok(message)) => (message, values.byte_offset()),
                Some(Err(e)) if e.is_eof() => return Ok(None),
                Some(Err(e)) => return Err(db_error(format!("invalid JSON-RPC message: {e}"))),
                None => return Ok(None),
            }
        };
        self.buffer.drain(..consumed);
        Ok(Some(message))
    }
}

#[async_trait]
impl OvsdbClient for JsonRpcClient {
    fn database(&self) -> &str {
        &self.database
    }

    async fn transact(&self, ops: Vec<Operation>) -> CniResult<Vec<OperationResult>> {
        let mut params = Vec::with_capacity(ops.len() + 1);
        params.push(Value::String(self.database.clone()));
        for op in &ops {
            params.push(serde_json::to_value(op)?);
        }

        let result = tokio::time::timeout(self.timeout, self.call("transact", Value::Array(params)))
            .await
            .map_err(|_| CniError::Timeout {
                operation: format!("transaction on {}", self.database),
                after: self.timeout,
            })??;

        // Operations after a failed one come back as null.
        let results: Vec<Option<OperationResult>> = serde_json::from_value(result)?;
        Ok(results.into_iter().map(Option::unwrap_or_default).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::UnixListener;

    #[test]
    fn endpoint_parsing() {
        assert_eq!(
            "unix:/var/run/openvswitch/db.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(PathBuf::from("/var/run/openvswitch/db.sock"))
        );
        assert_eq!(
            "tcp:127.0.0.1:6641".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("127.0.0.1:6641".to_string())
        );
        assert!("ssl:127.0.0.1:6641".parse::<Endpoint>().is_err());
    }

    #[test]
    fn endpoint_display_round_trips() {
        let endpoint: Endpoint = "tcp:10.0.0.1:6641".parse().unwrap();
        assert_eq!(endpoint.to_string(), "tcp:10.0.0.1:6641");
    }

    /// Serve one connection: send an echo, then answer every transact
    /// request with `reply(request)`. Returns every message received.
    fn serve(listener: UnixListener, reply: fn(&Value) -> Value) -> tokio::task::JoinHandle<Vec<Value>> {
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream
                .write_all(br#"{"method":"echo","params":["ping"],"id":"echo"}"#)
                .await
                .unwrap();

            let mut seen = Vec::new();
            let mut buf = Vec::new();
            while stream.read_buf(&mut buf).await.unwrap() > 0 {
                loop {
                    let (value, consumed) = {
                        let mut values = serde_json::Deserializer::from_slice(&buf).into_iter::<Value>();
                        match values.next() {
                            Some(Ok(value)) => (value, values.byte_offset()),
                            _ => break,
                        }
                    };
                    buf.drain(..consumed);
                    if value["method"] == "transact" {
                        let response = json!({"result": reply(&value), "error": null, "id": value["id"]});
                        stream.write_all(&serde_json::to_vec(&response).unwrap()).await.unwrap();
                    }
                    seen.push(value);
                }
            }
            seen
        })
    }

    #[tokio::test]
    async fn transact_answers_echo_and_decodes_results() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = serve(listener, |_| json!([{"count": 1}, {"error": "constraint violation", "details": "dup"}, null]));

        let client = JsonRpcClient::connect(
            Endpoint::Unix(path),
            "Open_vSwitch",
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let results = client
            .transact(vec![Operation::delete("Port", Vec::new())])
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].count, Some(1));
        assert!(results[1].is_error());
        assert_eq!(results[2], OperationResult::default());

        client.close().await.unwrap();
        let seen = server.await.unwrap();

        let echo_reply = seen.iter().find(|v| v["id"] == "echo").unwrap();
        assert_eq!(echo_reply["result"], json!(["ping"]));
        let request = seen.iter().find(|v| v["method"] == "transact").unwrap();
        assert_eq!(request["params"][0], "Open_vSwitch");
        assert_eq!(request["params"][1]["op"], "delete");
    }

    #[tokio::test]
    async fn requests_after_close_fail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let _server = serve(listener, |_| json!([]));

        let client = JsonRpcClient::connect(Endpoint::Unix(path), "OVN_Northbound", Duration::from_secs(5))
            .await
            .unwrap();
        client.close().await.unwrap();

        let err = client.transact(Vec::new()).await.unwrap_err();
        assert!(matches!(err, CniError::Database { .. }));
    }

    #[tokio::test]
    async fn connect_to_missing_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = JsonRpcClient::connect(
            Endpoint::Unix(dir.path().join("missing.sock")),
            "Open_vSwitch",
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CniError::Database { .. }));
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let client = JsonRpcClient::connect(Endpoint::Unix(path), "Open_vSwitch", Duration::from_millis(100))
            .await
            .unwrap();
        let err = client.transact(Vec::new()).await.unwrap_err();
        assert!(matches!(err, CniError::Timeout { .. }));
    }
}
