//! A single JSON-RPC session with an Electrum server.
//!
//! The session owns a background reader task that correlates responses with pending
//! requests and fans notifications out to subscription queues. Anything the server
//! pushes that is not a notification for a known subscription closes the session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;

use super::constants::MAX_INCOMING_MSG_SIZE;
use super::rpc::{self, Incoming, RpcError};
use crate::error::{NetworkError, NetworkResult};

/// Byte stream a session runs over: plain TCP, TLS or an in-memory duplex.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Receiving end of a subscription: each item is the subscription params followed
/// by the latest result.
pub type NotificationQueue = mpsc::UnboundedSender<Vec<Value>>;

type Reply = Result<Value, RpcError>;

#[derive(Default)]
struct Subscriptions {
    queues: HashMap<String, Vec<NotificationQueue>>,
    cache: HashMap<String, Value>,
}

struct Shared {
    server: String,
    debug: bool,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    subscriptions: Mutex<Subscriptions>,
    closed: CancellationToken,
}

pub struct ServerSession {
    shared: Arc<Shared>,
    writer: Mutex<FramedWrite<WriteHalf<BoxedStream>, LinesCodec>>,
    next_id: AtomicU64,
    default_timeout: Duration,
    remote_addr: Option<SocketAddr>,
}

fn subscription_key(method: &str, params: &[Value]) -> String {
    format!("{}{}", method, Value::Array(params.to_vec()))
}

impl ServerSession {
    /// Start a session over `stream`. Must be called from within a tokio runtime.
    pub fn new(
        stream: BoxedStream,
        server: impl Into<String>,
        remote_addr: Option<SocketAddr>,
        default_timeout: Duration,
        debug: bool,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let shared = Arc::new(Shared {
            server: server.into(),
            debug,
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(Subscriptions::default()),
            closed: CancellationToken::new(),
        });

        let reader = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_INCOMING_MSG_SIZE));
        tokio::spawn(read_loop(shared.clone(), reader));

        Self {
            shared,
            writer: Mutex::new(FramedWrite::new(write_half, LinesCodec::new())),
            next_id: AtomicU64::new(0),
            default_timeout,
            remote_addr,
        }
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn is_closing(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves once the session has closed for any reason.
    pub async fn wait_closed(&self) {
        self.shared.closed.cancelled().await
    }

    pub async fn close(&self) {
        self.shared.closed.cancel();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.get_mut().shutdown().await {
            tracing::debug!("[{}] error shutting down stream: {}", self.shared.server, e);
        }
    }

    /// Send a request and wait for its correlated response.
    pub async fn send_request(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Option<Duration>,
    ) -> NetworkResult<Value> {
        if self.is_closing() {
            return Err(NetworkError::SessionClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = rpc::encode_request(id, method, &params)
            .map_err(|e| NetworkError::InvalidArgument(format!("cannot encode {}: {}", method, e)))?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id, tx);

        if self.shared.debug {
            tracing::debug!("[{}] --> {}", self.shared.server, line);
        }
        let sent = self.writer.lock().await.send(line).await;
        if let Err(e) = sent {
            self.shared.pending.lock().await.remove(&id);
            self.shared.closed.cancel();
            return Err(NetworkError::ConnectionFailed(format!("write failed: {}", e)));
        }

        let timeout = timeout.unwrap_or(self.default_timeout);
        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                self.shared.pending.lock().await.remove(&id);
                Err(NetworkError::RequestTimedOut(format!(
                    "{} {} (id: {})",
                    method,
                    Value::Array(params),
                    id
                )))
            }
            Ok(Err(_)) => Err(NetworkError::SessionClosed),
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => {
                tracing::debug!(
                    "[{}] {} returned error {}: {}",
                    self.shared.server,
                    method,
                    error.code,
                    error.message
                );
                Err(NetworkError::Rpc {
                    code: error.code,
                    message: error.message,
                })
            }
        }
    }

    /// Register `queue` for notifications on `(method, params)` and deliver the
    /// current value, requesting it from the server if none is cached.
    pub async fn subscribe(
        &self,
        method: &str,
        params: Vec<Value>,
        queue: NotificationQueue,
    ) -> NetworkResult<()> {
        let key = subscription_key(method, &params);
        let cached = {
            let mut subs = self.shared.subscriptions.lock().await;
            subs.queues.entry(key.clone()).or_default().push(queue.clone());
            subs.cache.get(&key).cloned()
        };

        let result = match cached {
            Some(result) => result,
            None => {
                let result = self.send_request(method, params.clone(), None).await?;
                self.shared.subscriptions.lock().await.cache.insert(key, result.clone());
                result
            }
        };

        let mut item = params;
        item.push(result);
        // A dropped consumer is detached lazily on the next notification.
        let _ = queue.send(item);
        Ok(())
    }

    /// Stop delivering to `queue`. The server is not told; notifications for the
    /// key keep refreshing the cache.
    pub async fn unsubscribe(&self, queue: &NotificationQueue) {
        let mut subs = self.shared.subscriptions.lock().await;
        for queues in subs.queues.values_mut() {
            queues.retain(|q| !q.same_channel(queue));
        }
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        self.shared.closed.cancel();
    }
}

async fn read_loop(shared: Arc<Shared>, mut reader: FramedRead<ReadHalf<BoxedStream>, LinesCodec>) {
    loop {
        let next = tokio::select! {
            _ = shared.closed.cancelled() => break,
            next = reader.next() => next,
        };
        let line = match next {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                tracing::info!("[{}] closing session: {}", shared.server, e);
                break;
            }
            None => {
                tracing::debug!("[{}] connection closed by server", shared.server);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        if let Err(reason) = shared.handle_line(&line).await {
            tracing::info!("[{}] closing session: {}", shared.server, reason);
            break;
        }
    }

    shared.closed.cancel();
    // Dropping the senders wakes every waiter with SessionClosed and ends
    // every subscription stream.
    shared.pending.lock().await.clear();
    shared.subscriptions.lock().await.queues.clear();
}

impl Shared {
    async fn handle_line(&self, line: &str) -> Result<(), String> {
        if self.debug {
            tracing::debug!("[{}] <-- {}", self.server, line);
        }
        for message in rpc::decode_line(line)? {
            match message {
                Incoming::Response {
                    id,
                    result,
                } => match self.pending.lock().await.remove(&id) {
                    Some(waiter) => {
                        let _ = waiter.send(result);
                    }
                    None => tracing::debug!("[{}] response for unknown request id {}", self.server, id),
                },
                Incoming::Notification {
                    method,
                    params,
                } => self.handle_notification(&method, params).await?,
                Incoming::Request {
                    method,
                } => return Err(format!("unexpected request {}, not a notification", method)),
            }
        }
        Ok(())
    }

    async fn handle_notification(&self, method: &str, params: Vec<Value>) -> Result<(), String> {
        let Some((result, sub_params)) = params.split_last() else {
            return Err(format!("notification {} without params", method));
        };
        let key = subscription_key(method, sub_params);

        let mut guard = self.subscriptions.lock().await;
        let subs = &mut *guard;
        let Some(queues) = subs.queues.get_mut(&key) else {
            return Err(format!("unexpected notification {}", key));
        };
        queues.retain(|queue| queue.send(params.clone()).is_ok());
        subs.cache.insert(key, result.clone());
        Ok(())
    }
}
