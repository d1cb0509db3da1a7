//! JSON-over-TCP transport.
//!
//! Each request is one line holding `{"method": .., "body": ..}`; each
//! reply is one line holding either `{"ok": ..}` or `{"error": ".."}`.
//! Requests on one connection are strictly sequential. Lines longer than
//! the frame limit end the connection.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use herd_core::{
    AddObjectsRequest, CleanupRequest, FetchRequest, PollRequest, PollResponse, SubConfiguration,
    UpdateRequest,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, watch};
use tracing::{debug, warn};

use crate::error::{RpcError, RpcResult};
use crate::transport::{BoxFuture, SubClient, SubConnector};

pub const METHOD_POLL: &str = "Subd.Poll";
pub const METHOD_FETCH: &str = "Subd.Fetch";
pub const METHOD_UPDATE: &str = "Subd.Update";
pub const METHOD_CLEANUP: &str = "Subd.Cleanup";
pub const METHOD_GET_CONFIGURATION: &str = "Subd.GetConfiguration";
pub const METHOD_SET_CONFIGURATION: &str = "Subd.SetConfiguration";
pub const METHOD_BOOST_CPU_LIMIT: &str = "Subd.BoostCpuLimit";
pub const METHOD_BOOST_SCAN_LIMIT: &str = "Subd.BoostScanLimit";
pub const METHOD_ADD_OBJECTS: &str = "ObjectServer.AddObjects";

/// Default limit on one frame, newline included. Full polls carry the
/// whole file-system, so this is generous.
pub const MAX_FRAME_LEN: u64 = 256 << 20;

#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    method: String,
    #[serde(default)]
    body: Value,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Reply {
    Ok(Value),
    Error(String),
}

/// Read one line of at most `limit` bytes into `line`. Returns 0 at EOF.
async fn read_frame<R>(reader: &mut R, line: &mut String, limit: u64) -> RpcResult<usize>
where
    R: AsyncBufRead + Unpin,
{
    let read = (&mut *reader).take(limit).read_line(line).await?;
    if read as u64 >= limit && !line.ends_with('\n') {
        return Err(RpcError::FrameTooLarge(limit));
    }
    Ok(read)
}

/// Strip the `*instance` part of a `host*instance:port` address, leaving
/// something the resolver understands.
fn dial_address(address: &str) -> std::borrow::Cow<'_, str> {
    match address.split_once('*') {
        Some((host, rest)) => match rest.rsplit_once(':') {
            Some((_, port)) => format!("{host}:{port}").into(),
            None => host.into(),
        },
        None => address.into(),
    }
}

// ── Client ─────────────────────────────────────────────────────────

struct Conn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    /// Set once an exchange was abandoned half-way; the stream is out of
    /// step with its replies from then on.
    broken: bool,
}

/// One connection to a sub.
pub struct JsonClient {
    conn: Mutex<Conn>,
    timeout: Duration,
    max_frame_len: u64,
}

impl JsonClient {
    pub fn new(stream: TcpStream, timeout: Duration) -> Self {
        let (read, write) = stream.into_split();
        Self {
            conn: Mutex::new(Conn {
                reader: BufReader::new(read),
                writer: write,
                broken: false,
            }),
            timeout,
            max_frame_len: MAX_FRAME_LEN,
        }
    }

    pub fn with_max_frame_len(mut self, limit: u64) -> Self {
        self.max_frame_len = limit;
        self
    }

    async fn call<Req, Resp>(&self, method: &str, body: &Req) -> RpcResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let mut frame = serde_json::to_vec(&Frame {
            method: method.to_string(),
            body: serde_json::to_value(body)?,
        })?;
        frame.push(b'\n');

        let mut conn = self.conn.lock().await;
        if conn.broken {
            return Err(RpcError::Eof);
        }
        let limit = self.max_frame_len;
        let exchange = async {
            conn.writer.write_all(&frame).await?;
            let mut line = String::new();
            if read_frame(&mut conn.reader, &mut line, limit).await? == 0 {
                return Err(RpcError::Eof);
            }
            Ok::<_, RpcError>(line)
        };
        let result = tokio::time::timeout(self.timeout, exchange).await;
        let line = match result {
            Ok(Ok(line)) => line,
            Ok(Err(e)) => {
                conn.broken = true;
                return Err(e);
            }
            Err(_) => {
                conn.broken = true;
                return Err(RpcError::Timeout);
            }
        };
        drop(conn);

        match serde_json::from_str::<Reply>(&line)? {
            Reply::Ok(value) => Ok(serde_json::from_value(value)?),
            Reply::Error(text) => Err(RpcError::from_remote(&text)),
        }
    }
}

impl SubClient for JsonClient {
    fn poll(&self, request: PollRequest) -> BoxFuture<'_, RpcResult<PollResponse>> {
        Box::pin(async move { self.call(METHOD_POLL, &request).await })
    }

    fn fetch(&self, request: FetchRequest) -> BoxFuture<'_, RpcResult<()>> {
        Box::pin(async move { self.call(METHOD_FETCH, &request).await })
    }

    fn update(&self, request: UpdateRequest) -> BoxFuture<'_, RpcResult<()>> {
        Box::pin(async move { self.call(METHOD_UPDATE, &request).await })
    }

    fn cleanup(&self, request: CleanupRequest) -> BoxFuture<'_, RpcResult<()>> {
        Box::pin(async move { self.call(METHOD_CLEANUP, &request).await })
    }

    fn get_configuration(&self) -> BoxFuture<'_, RpcResult<SubConfiguration>> {
        Box::pin(async move { self.call(METHOD_GET_CONFIGURATION, &()).await })
    }

    fn set_configuration(&self, config: SubConfiguration) -> BoxFuture<'_, RpcResult<()>> {
        Box::pin(async move { self.call(METHOD_SET_CONFIGURATION, &config).await })
    }

    fn boost_cpu_limit(&self) -> BoxFuture<'_, RpcResult<()>> {
        Box::pin(async move { self.call(METHOD_BOOST_CPU_LIMIT, &()).await })
    }

    fn boost_scan_limit(&self) -> BoxFuture<'_, RpcResult<()>> {
        Box::pin(async move { self.call(METHOD_BOOST_SCAN_LIMIT, &()).await })
    }

    fn add_objects(&self, request: AddObjectsRequest) -> BoxFuture<'_, RpcResult<()>> {
        Box::pin(async move { self.call(METHOD_ADD_OBJECTS, &request).await })
    }
}

/// Dials subs over plain TCP.
#[derive(Debug, Clone)]
pub struct JsonConnector {
    pub connect_timeout: Duration,
    pub call_timeout: Duration,
    pub max_frame_len: u64,
}

impl JsonConnector {
    pub fn new(connect_timeout: Duration, call_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            call_timeout,
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}

impl Default for JsonConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(15), Duration::from_secs(300))
    }
}

impl SubConnector for JsonConnector {
    fn connect<'a>(&'a self, address: &'a str) -> BoxFuture<'a, RpcResult<Arc<dyn SubClient>>> {
        Box::pin(async move {
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host(dial_address(address).as_ref())
                .await
                .map_err(|e| RpcError::Dns(e.to_string()))?
                .collect();
            if addrs.is_empty() {
                return Err(RpcError::Dns(format!("no addresses for {address}")));
            }
            let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addrs[..]))
                .await
                .map_err(|_| RpcError::Timeout)??;
            stream.set_nodelay(true)?;
            let client: Arc<dyn SubClient> = Arc::new(
                JsonClient::new(stream, self.call_timeout).with_max_frame_len(self.max_frame_len),
            );
            Ok(client)
        })
    }
}

// ── Server ─────────────────────────────────────────────────────────

/// Accept connections until `shutdown` flips, serving each with `handler`.
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn SubClient>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                debug!(%peer, "connection accepted");
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, handler, MAX_FRAME_LEN).await {
                        warn!(%peer, error = %e, "connection ended with error");
                    }
                });
            }
            _ = shutdown.changed() => return Ok(()),
        }
    }
}

/// Serve one connection until the peer closes it or sends a frame longer
/// than `max_frame_len`.
pub async fn serve_connection(
    stream: TcpStream,
    handler: Arc<dyn SubClient>,
    max_frame_len: u64,
) -> RpcResult<()> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut line = String::new();
    loop {
        line.clear();
        match read_frame(&mut reader, &mut line, max_frame_len).await {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(e @ RpcError::FrameTooLarge(_)) => {
                let mut out = serde_json::to_vec(&Reply::Error(e.to_remote()))?;
                out.push(b'\n');
                write.write_all(&out).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        }
        let reply = match serde_json::from_str::<Frame>(&line) {
            Ok(frame) => dispatch(handler.as_ref(), frame).await,
            Err(e) => Reply::Error(format!("bad frame: {e}")),
        };
        let mut out = serde_json::to_vec(&reply)?;
        out.push(b'\n');
        write.write_all(&out).await?;
    }
}

async fn dispatch(handler: &dyn SubClient, frame: Frame) -> Reply {
    let body = frame.body;
    let result = match frame.method.as_str() {
        METHOD_POLL => invoke(body, |req| handler.poll(req)).await,
        METHOD_FETCH => invoke(body, |req| handler.fetch(req)).await,
        METHOD_UPDATE => invoke(body, |req| handler.update(req)).await,
        METHOD_CLEANUP => invoke(body, |req| handler.cleanup(req)).await,
        METHOD_GET_CONFIGURATION => invoke(body, |()| handler.get_configuration()).await,
        METHOD_SET_CONFIGURATION => invoke(body, |req| handler.set_configuration(req)).await,
        METHOD_BOOST_CPU_LIMIT => invoke(body, |()| handler.boost_cpu_limit()).await,
        METHOD_BOOST_SCAN_LIMIT => invoke(body, |()| handler.boost_scan_limit()).await,
        METHOD_ADD_OBJECTS => invoke(body, |req| handler.add_objects(req)).await,
        other => Err(RpcError::Remote(format!("unknown method: {other}"))),
    };
    match result {
        Ok(value) => Reply::Ok(value),
        Err(e) => Reply::Error(e.to_remote()),
    }
}

async fn invoke<'a, Req, Resp>(
    body: Value,
    call: impl FnOnce(Req) -> BoxFuture<'a, RpcResult<Resp>>,
) -> RpcResult<Value>
where
    Req: DeserializeOwned,
    Resp: Serialize,
{
    let request: Req = serde_json::from_value(body)?;
    let response = call(request).await?;
    Ok(serde_json::to_value(response)?)
}
