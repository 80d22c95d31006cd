//! Bidirectional RPC channel over one framed connection.
//!
//! Each side issues calls with its own id counter and matches results against its own
//! pending table. Unsolicited calls from the peer are dispatched, one frame at a time,
//! to the channel's [`CallHandler`].
//!
//! Two tasks back a channel: a reader that decodes frames and dispatches them, and a
//! writer that drains an unbounded queue so `call`/`send_result` never block. The first
//! transport failure on either task closes the channel, completes every pending call
//! with [`RpcError::ChannelClosed`] and notifies the handler exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::codec::{FrameCodec, FrameError};
use super::protocol::{Call, CallId, CallResult, Envelope, RemoteError, params_object};

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The channel has closed; no further calls can be made on it.
    #[error("channel closed")]
    ChannelClosed,

    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("unknown call: {0}")]
    UnknownCall(String),

    #[error("invalid arguments for {method}: {reason}")]
    InvalidArguments { method: String, reason: String },

    /// The peer answered with a value of the wrong shape.
    #[error("unexpected result: {0}")]
    InvalidResult(String),

    /// The peer failed to handle the call and said why.
    #[error("remote error: {0}")]
    Remote(String),
}

impl RpcError {
    pub fn invalid_arguments(method: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidArguments {
            method: method.into(),
            reason: reason.to_string(),
        }
    }

    /// True for failures that took the connection down, as opposed to one failed call.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::ChannelClosed | Self::Frame(_))
    }
}

/// Receiver of unsolicited calls and of the channel's failure notifications.
#[async_trait]
pub trait CallHandler: Send + Sync + 'static {
    /// Handle one incoming call.
    ///
    /// Runs on the channel's reader task, so it must not wait for replies on the same
    /// channel; spawn a task for anything that does.
    async fn handle_call(&self, channel: &RpcChannel, call: Call) -> Result<(), RpcError>;

    /// Called once when the transport fails, and once per failed incoming call.
    /// Use [`RpcError::is_transport`] to tell them apart.
    fn transport_error(&self, error: &RpcError);
}

type Completion = oneshot::Sender<Result<Value, RpcError>>;

struct Inner {
    label: String,
    next_id: AtomicU64,
    pending: StdMutex<HashMap<CallId, Completion>>,
    outbound: mpsc::UnboundedSender<Envelope>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    handler: Arc<dyn CallHandler>,
}

/// Cheaply cloneable handle to one connection.
#[derive(Clone)]
pub struct RpcChannel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("label", &self.inner.label)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Reply to a call, delivered at most once.
#[must_use = "dropping a PendingReply discards the reply; use notify() for fire-and-forget calls"]
#[derive(Debug)]
pub struct PendingReply {
    id: CallId,
    rx: oneshot::Receiver<Result<Value, RpcError>>,
}

impl PendingReply {
    pub fn id(&self) -> CallId {
        self.id
    }

    pub async fn recv(self) -> Result<Value, RpcError> {
        let value = self.rx.await.map_err(|_| RpcError::ChannelClosed)??;
        if let Some(remote) = RemoteError::from_result(&value) {
            return Err(RpcError::Remote(remote.error));
        }
        Ok(value)
    }

    pub async fn decode<T: DeserializeOwned>(self) -> Result<T, RpcError> {
        let value = self.recv().await?;
        serde_json::from_value(value).map_err(|e| RpcError::InvalidResult(e.to_string()))
    }
}

impl RpcChannel {
    /// Start reader and writer tasks over the two halves of a connection.
    pub fn spawn<R, W>(
        reader: R,
        writer: W,
        handler: Arc<dyn CallHandler>,
        label: impl Into<String>,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let channel = Self {
            inner: Arc::new(Inner {
                label: label.into(),
                next_id: AtomicU64::new(0),
                pending: StdMutex::new(HashMap::new()),
                outbound,
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                handler,
            }),
        };

        tokio::spawn(write_loop(
            Arc::downgrade(&channel.inner),
            channel.inner.shutdown.clone(),
            FramedWrite::new(writer, FrameCodec::<Envelope>::new()),
            outbound_rx,
        ));
        tokio::spawn(read_loop(
            channel.clone(),
            FramedRead::new(reader, FrameCodec::<Envelope>::new()),
        ));

        channel
    }

    pub fn from_tcp(
        stream: TcpStream,
        handler: Arc<dyn CallHandler>,
        label: impl Into<String>,
    ) -> Self {
        let (reader, writer) = stream.into_split();
        Self::spawn(reader, writer, handler, label)
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of calls still waiting for a result.
    pub fn pending_calls(&self) -> usize {
        self.lock_pending().len()
    }

    /// Issue a call whose result the caller wants.
    pub fn call<P: Serialize>(&self, method: &str, params: P) -> Result<PendingReply, RpcError> {
        let params = params_object(params).map_err(|e| RpcError::invalid_arguments(method, e))?;
        if self.is_closed() {
            return Err(RpcError::ChannelClosed);
        }

        let id = self.allocate_id();
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(id, tx);

        let sent = self.enqueue(Envelope::call(method, params, id));
        if sent.is_err() || self.is_closed() {
            // Closed between the check and the insert: the drain may have missed us.
            self.lock_pending().remove(&id);
            return Err(RpcError::ChannelClosed);
        }

        tracing::trace!(peer = %self.inner.label, call_id = id, method, "Call issued");
        Ok(PendingReply { id, rx })
    }

    /// Issue a fire-and-forget call. Any result the peer sends back is discarded.
    pub fn notify<P: Serialize>(&self, method: &str, params: P) -> Result<CallId, RpcError> {
        let params = params_object(params).map_err(|e| RpcError::invalid_arguments(method, e))?;
        if self.is_closed() {
            return Err(RpcError::ChannelClosed);
        }

        let id = self.allocate_id();
        self.enqueue(Envelope::call(method, params, id))?;
        tracing::trace!(peer = %self.inner.label, call_id = id, method, "Notification issued");
        Ok(id)
    }

    /// Answer a call from the peer.
    pub fn send_result<T: Serialize>(&self, result: T, id: CallId) -> Result<(), RpcError> {
        let result =
            serde_json::to_value(result).map_err(|e| RpcError::InvalidResult(e.to_string()))?;
        if self.is_closed() {
            return Err(RpcError::ChannelClosed);
        }
        self.enqueue(Envelope::result(result, id))
    }

    /// Close locally. Queued frames are flushed; the handler is not notified.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(peer = %self.inner.label, "Closing channel");
        self.inner.shutdown.cancel();
        self.drain_pending();
    }

    fn fail(&self, error: RpcError) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::warn!(peer = %self.inner.label, error = %error, "Transport error, channel closed");
        self.inner.shutdown.cancel();
        self.drain_pending();
        self.inner.handler.transport_error(&error);
    }

    fn allocate_id(&self) -> CallId {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn enqueue(&self, envelope: Envelope) -> Result<(), RpcError> {
        self.inner
            .outbound
            .send(envelope)
            .map_err(|_| RpcError::ChannelClosed)
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<CallId, Completion>> {
        self.inner.pending.lock().unwrap_or_else(|poisoned| {
            tracing::error!(peer = %self.inner.label, "Pending-call table poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn drain_pending(&self) {
        let drained: Vec<Completion> = self.lock_pending().drain().map(|(_, tx)| tx).collect();
        if !drained.is_empty() {
            tracing::debug!(peer = %self.inner.label, count = drained.len(), "Failing pending calls");
        }
        for tx in drained {
            let _ = tx.send(Err(RpcError::ChannelClosed));
        }
    }

    fn complete(&self, result: CallResult) {
        let completion = self.lock_pending().remove(&result.id);
        match completion {
            Some(tx) => {
                let _ = tx.send(Ok(result.result));
            }
            None => {
                tracing::trace!(peer = %self.inner.label, call_id = result.id, "Discarding result with no pending call");
            }
        }
    }

    async fn dispatch(&self, call: Call) {
        let id = call.id;
        let method = call.method.clone();
        if let Err(error) = self.inner.handler.handle_call(self, call).await {
            tracing::warn!(peer = %self.inner.label, %method, call_id = ?id, error = %error, "Incoming call failed");
            if let Some(id) = id {
                let _ = self.send_result(RemoteError::new(error.to_string()), id);
            }
            self.inner.handler.transport_error(&error);
        }
    }
}

async fn read_loop<R>(channel: RpcChannel, mut reader: FramedRead<R, FrameCodec<Envelope>>)
where
    R: AsyncRead + Unpin,
{
    let shutdown = channel.inner.shutdown.clone();
    loop {
        let frame = tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,
            frame = reader.next() => frame,
        };

        match frame {
            Some(Ok(Envelope::Call(call))) => channel.dispatch(call).await,
            Some(Ok(Envelope::Result(result))) => channel.complete(result),
            Some(Err(e)) => {
                channel.fail(RpcError::Frame(e));
                break;
            }
            None => {
                tracing::debug!(peer = %channel.inner.label, "Peer closed connection");
                channel.fail(RpcError::ChannelClosed);
                break;
            }
        }
    }
    tracing::trace!(peer = %channel.inner.label, "Reader task exiting");
}

async fn write_loop<W>(
    inner: Weak<Inner>,
    shutdown: CancellationToken,
    mut writer: FramedWrite<W, FrameCodec<Envelope>>,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let envelope = tokio::select! {
            biased;

            envelope = outbound.recv() => envelope,
            _ = shutdown.cancelled() => break,
        };
        let Some(envelope) = envelope else { break };

        if let Err(e) = writer.send(envelope).await {
            if let Some(inner) = inner.upgrade() {
                RpcChannel { inner }.fail(RpcError::Frame(e));
            }
            return;
        }
    }

    // Flush whatever was queued before the close so a final `die` still goes out.
    while let Ok(envelope) = outbound.try_recv() {
        if writer.feed(envelope).await.is_err() {
            return;
        }
    }
    let _ = writer.flush().await;
    let _ = writer.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::encode_frame;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    struct Recorder {
        calls: mpsc::UnboundedSender<Call>,
        errors: mpsc::UnboundedSender<(bool, String)>,
    }

    struct Seen {
        calls: mpsc::UnboundedReceiver<Call>,
        errors: mpsc::UnboundedReceiver<(bool, String)>,
    }

    fn recorder() -> (Arc<Recorder>, Seen) {
        let (calls_tx, calls) = mpsc::unbounded_channel();
        let (errors_tx, errors) = mpsc::unbounded_channel();
        (
            Arc::new(Recorder {
                calls: calls_tx,
                errors: errors_tx,
            }),
            Seen { calls, errors },
        )
    }

    #[async_trait]
    impl CallHandler for Recorder {
        async fn handle_call(&self, channel: &RpcChannel, call: Call) -> Result<(), RpcError> {
            match call.method.as_str() {
                "echo" => {
                    if let Some(id) = call.id {
                        channel.send_result(Value::Object(call.params.clone()), id)?;
                    }
                }
                "silent" => {}
                other => return Err(RpcError::UnknownCall(other.to_string())),
            }
            let _ = self.calls.send(call);
            Ok(())
        }

        fn transport_error(&self, error: &RpcError) {
            let _ = self.errors.send((error.is_transport(), error.to_string()));
        }
    }

    fn pair() -> (RpcChannel, Seen, RpcChannel, Seen) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        let (a_handler, a_seen) = recorder();
        let (b_handler, b_seen) = recorder();
        (
            RpcChannel::spawn(a_read, a_write, a_handler, "a"),
            a_seen,
            RpcChannel::spawn(b_read, b_write, b_handler, "b"),
            b_seen,
        )
    }

    async fn within<F: std::future::Future>(f: F) -> F::Output {
        tokio::time::timeout(Duration::from_secs(5), f)
            .await
            .expect("timed out")
    }

    #[tokio::test]
    async fn call_completes_with_sent_result() {
        let (a, _a_seen, _b, mut b_seen) = pair();

        let reply = a.call("echo", json!({"x": 1})).unwrap();
        assert_eq!(reply.id(), 0);
        assert_eq!(within(reply.recv()).await.unwrap(), json!({"x": 1}));

        let seen = within(b_seen.calls.recv()).await.unwrap();
        assert_eq!(seen.method, "echo");
        assert_eq!(seen.id, Some(0));
        assert_eq!(a.pending_calls(), 0);
    }

    #[tokio::test]
    async fn ids_increase_per_channel() {
        let (a, _a_seen, b, _b_seen) = pair();

        let first = a.call("silent", ()).unwrap();
        let second = a.notify("silent", ()).unwrap();
        let third = a.call("silent", ()).unwrap();
        assert_eq!((first.id(), second, third.id()), (0, 1, 2));

        // The other side counts independently.
        assert_eq!(b.notify("silent", ()).unwrap(), 0);
    }

    #[tokio::test]
    async fn typed_decode_of_result() {
        let (a, _a_seen, b, mut b_seen) = pair();

        let reply = a.call("silent", ()).unwrap();
        let call = within(b_seen.calls.recv()).await.unwrap();
        b.send_result(true, call.id.unwrap()).unwrap();

        assert!(within(reply.decode::<bool>()).await.unwrap());
    }

    #[tokio::test]
    async fn wrong_result_shape_is_invalid_result() {
        let (a, _a_seen, _b, _b_seen) = pair();

        let reply = a.call("echo", json!({"x": 1})).unwrap();
        assert!(matches!(
            within(reply.decode::<bool>()).await,
            Err(RpcError::InvalidResult(_))
        ));
    }

    #[tokio::test]
    async fn unmatched_result_is_discarded() {
        let (a, mut a_seen, b, _b_seen) = pair();

        b.send_result(json!("stale"), 999).unwrap();
        let reply = a.call("echo", json!({"ok": true})).unwrap();

        assert_eq!(within(reply.recv()).await.unwrap(), json!({"ok": true}));
        assert!(!a.is_closed());
        assert!(a_seen.errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_result_is_delivered_once() {
        let (a, _a_seen, b, mut b_seen) = pair();

        let reply = a.call("silent", ()).unwrap();
        let id = within(b_seen.calls.recv()).await.unwrap().id.unwrap();
        b.send_result(1, id).unwrap();
        b.send_result(2, id).unwrap();

        assert_eq!(within(reply.recv()).await.unwrap(), json!(1));
        // Still healthy after the duplicate.
        let next = a.call("echo", json!({"n": 3})).unwrap();
        assert_eq!(within(next.recv()).await.unwrap(), json!({"n": 3}));
    }

    #[tokio::test]
    async fn notify_leaves_no_pending_entry() {
        let (a, _a_seen, _b, mut b_seen) = pair();

        a.notify("echo", json!({"x": 1})).unwrap();
        within(b_seen.calls.recv()).await.unwrap();

        assert_eq!(a.pending_calls(), 0);
    }

    #[tokio::test]
    async fn failing_handler_answers_with_error_and_stays_open() {
        let (a, _a_seen, b, mut b_seen) = pair();

        let reply = a.call("bogus", ()).unwrap();
        assert!(matches!(
            within(reply.recv()).await,
            Err(RpcError::Remote(msg)) if msg.contains("bogus")
        ));

        let (is_transport, msg) = within(b_seen.errors.recv()).await.unwrap();
        assert!(!is_transport);
        assert!(msg.contains("unknown call"));
        assert!(!b.is_closed());
        assert!(!a.is_closed());
    }

    #[tokio::test]
    async fn peer_close_fails_pending_and_notifies_once() {
        let (a, mut a_seen, b, _b_seen) = pair();

        let reply = a.call("silent", ()).unwrap();
        b.close();

        assert!(matches!(
            within(reply.recv()).await,
            Err(RpcError::ChannelClosed)
        ));
        let (is_transport, _) = within(a_seen.errors.recv()).await.unwrap();
        assert!(is_transport);
        assert!(a.is_closed());
        assert!(matches!(
            a.call("echo", ()),
            Err(RpcError::ChannelClosed)
        ));
        assert!(matches!(
            a.send_result(true, 0),
            Err(RpcError::ChannelClosed)
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a_seen.errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn local_close_does_not_notify_handler() {
        let (a, mut a_seen, _b, _b_seen) = pair();

        let reply = a.call("silent", ()).unwrap();
        a.close();

        assert!(matches!(
            within(reply.recv()).await,
            Err(RpcError::ChannelClosed)
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a_seen.errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_frame_closes_channel() {
        let (raw, peer) = tokio::io::duplex(4096);
        let (peer_read, peer_write) = tokio::io::split(peer);
        let (handler, mut seen) = recorder();
        let channel = RpcChannel::spawn(peer_read, peer_write, handler, "peer");

        let (_raw_read, mut raw_write) = tokio::io::split(raw);
        raw_write
            .write_all(&encode_frame(&json!({"id": 1})).unwrap())
            .await
            .unwrap();

        let (is_transport, msg) = within(seen.errors.recv()).await.unwrap();
        assert!(is_transport);
        assert!(msg.contains("malformed"));
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn close_flushes_queued_frames() {
        let (a, _a_seen, _b, mut b_seen) = pair();

        a.notify("silent", json!({"last": true})).unwrap();
        a.close();

        let call = within(b_seen.calls.recv()).await.unwrap();
        assert_eq!(call.params["last"], json!(true));
    }
}
