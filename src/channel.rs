//! # Transport Channel
//!
//! One physical connection and its I/O loop. The channel:
//!
//! - runs a reader task and a writer task on a [`SharedResource`]
//! - matches response frames to pending `send` calls by correlation id
//! - forwards every other inbound frame to a registered push callback
//! - fails every pending `send` with `ConnectionClosed` when it closes
//!
//! Inbound frames are routed by a single reader task, one at a time, so both
//! consumers observe wire order. The channel knows nothing about handshakes
//! or commands; that is the job of the managers built on top of it.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::{ClientConfig, NodeAddress};
use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame, Frame, FrameCodec, FrameKind};
use crate::resource::{ResourceLease, SharedResource};

/// Consumer for inbound frames that do not answer a pending `send`
pub type PushCallback = Arc<dyn Fn(Frame) + Send + Sync>;

type Pending = oneshot::Sender<Result<Frame>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct RouterState {
    /// Close reason, once closed
    closed: Option<String>,
    pending: HashMap<u64, Pending>,
    push: Option<PushCallback>,
}

/// State shared between the channel handle and its I/O tasks.
#[derive(Default)]
struct Router {
    state: Mutex<RouterState>,
}

impl Router {
    fn register(&self, id: u64, tx: Pending) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(reason) = &state.closed {
            return Err(Error::connection_closed(reason.clone()));
        }
        if state.pending.contains_key(&id) {
            return Err(Error::invalid_state(format!(
                "correlation id {} is already awaiting a reply",
                id
            )));
        }
        state.pending.insert(id, tx);
        Ok(())
    }

    fn forget(&self, id: u64) {
        lock(&self.state).pending.remove(&id);
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Hand one inbound frame to its consumer.
    ///
    /// The closed check and the push callback lookup happen under the state
    /// lock, the callback itself runs after it is released. A frame already
    /// past that check when `close` runs is still delivered; no frame routed
    /// after `close` returns reaches the callback.
    fn route(&self, frame: Frame) {
        let push = {
            let mut state = lock(&self.state);
            if state.closed.is_some() {
                return;
            }
            let answers_pending = match (frame.kind, frame.id) {
                (FrameKind::Push, _) | (_, None) => None,
                (_, Some(id)) => state.pending.remove(&id),
            };
            match answers_pending {
                Some(tx) => {
                    // The caller may have stopped waiting; nothing to do then
                    let _ = tx.send(Ok(frame));
                    return;
                }
                None => state.push.clone(),
            }
        };
        // Invoked outside the lock, still on the single reader task
        match push {
            Some(callback) => callback(frame),
            None => debug!("No push consumer registered, dropping {:?} frame", frame.kind),
        }
    }

    /// Mark closed and fail everything still waiting. Returns false if the
    /// router was already closed.
    fn close(&self, reason: &str) -> bool {
        let pending = {
            let mut state = lock(&self.state);
            if state.closed.is_some() {
                return false;
            }
            state.closed = Some(reason.to_string());
            state.push = None;
            std::mem::take(&mut state.pending)
        };
        if !pending.is_empty() {
            debug!("Failing {} pending request(s): {}", pending.len(), reason);
        }
        for (_, tx) in pending {
            let _ = tx.send(Err(Error::connection_closed(reason)));
        }
        true
    }

    fn is_closed(&self) -> bool {
        lock(&self.state).closed.is_some()
    }
}

/// Registration of one in-flight `send`, removed when the send finishes or
/// is abandoned.
struct PendingSlot<'a> {
    router: &'a Router,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.router.forget(self.id);
    }
}

/// One connection to a server.
pub struct TransportChannel {
    peer: String,
    codec: FrameCodec,
    resource: SharedResource,
    next_id: AtomicU64,
    outbound: mpsc::UnboundedSender<Frame>,
    router: Arc<Router>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    lease: Mutex<Option<ResourceLease>>,
}

impl TransportChannel {
    /// Open a TCP connection to the first reachable configured address.
    ///
    /// The socket is established eagerly on the resource's runtime; no
    /// handshake is performed.
    pub async fn connect(config: &ClientConfig, resource: &SharedResource) -> Result<Arc<Self>> {
        let lease = resource.lease()?;
        let addresses = config.addresses().to_vec();
        let timeout = config.connection_timeout();

        let (stream, peer) = resource
            .handle()
            .spawn(connect_first(addresses, timeout))
            .await
            .map_err(|e| Error::connection_closed(format!("connect task failed: {}", e)))??;
        stream.set_nodelay(true)?;
        info!("Connected transport channel to {}", peer);

        Ok(Self::start(stream, peer.to_string(), config.codec(), resource, lease))
    }

    /// Run a channel over an already-established stream.
    pub fn from_stream<S>(
        stream: S,
        peer: impl Into<String>,
        codec: FrameCodec,
        resource: &SharedResource,
    ) -> Result<Arc<Self>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let lease = resource.lease()?;
        Ok(Self::start(stream, peer.into(), codec, resource, lease))
    }

    fn start<S>(
        stream: S,
        peer: String,
        codec: FrameCodec,
        resource: &SharedResource,
        lease: ResourceLease,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let router = Arc::new(Router::default());
        let handle = resource.handle();

        let read_router = Arc::clone(&router);
        let read_peer = peer.clone();
        let reader_task = handle.spawn(async move {
            loop {
                match read_frame(&mut reader, codec).await {
                    Ok(Some(frame)) => read_router.route(frame),
                    Ok(None) => {
                        if read_router.close("connection closed by peer") {
                            info!("Transport channel to {} closed by peer", read_peer);
                        }
                        break;
                    }
                    Err(e) => {
                        if read_router.close(&e.to_string()) {
                            warn!("Transport channel to {} failed on read: {}", read_peer, e);
                        }
                        break;
                    }
                }
            }
        });

        let write_router = Arc::clone(&router);
        let write_peer = peer.clone();
        let writer_task = handle.spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, codec, &frame).await {
                    if write_router.close(&e.to_string()) {
                        warn!("Transport channel to {} failed on write: {}", write_peer, e);
                    }
                    break;
                }
            }
        });

        Arc::new(Self {
            peer,
            codec,
            resource: resource.clone(),
            next_id: AtomicU64::new(1),
            outbound,
            router,
            tasks: Mutex::new(vec![reader_task, writer_task]),
            lease: Mutex::new(Some(lease)),
        })
    }

    /// Fresh correlation id, unique for the lifetime of this channel
    pub fn next_correlation_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Submit a frame and wait for the frame that answers it.
    ///
    /// The frame must carry a correlation id. The reply may be a `Response`
    /// or an `Error` frame; interpreting it is up to the caller.
    pub async fn send(&self, frame: Frame) -> Result<Frame> {
        let id = frame
            .id
            .ok_or_else(|| Error::invalid_state("frames sent for a reply need a correlation id"))?;
        let (tx, rx) = oneshot::channel();
        self.router.register(id, tx)?;
        // Drops the pending entry if the caller stops waiting
        let _slot = PendingSlot {
            router: self.router.as_ref(),
            id,
        };
        if self.outbound.send(frame).is_err() {
            return Err(Error::connection_closed("writer stopped"));
        }
        rx.await
            .unwrap_or_else(|_| Err(Error::connection_closed("reply slot dropped")))
    }

    /// Install the consumer for unsolicited frames, replacing any previous one.
    ///
    /// Ignored once the channel is closed.
    pub fn set_push_callback(&self, callback: PushCallback) {
        let mut state = lock(&self.router.state);
        if state.closed.is_none() {
            state.push = Some(callback);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.router.is_closed()
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn codec(&self) -> FrameCodec {
        self.codec
    }

    pub fn resource(&self) -> &SharedResource {
        &self.resource
    }

    /// Close the connection. Pending sends fail with `ConnectionClosed`, the
    /// push callback is not invoked for any frame routed after this returns,
    /// and the resource lease is released.
    pub fn close(&self) {
        if self.router.close("channel closed by client") {
            info!("Closing transport channel to {}", self.peer);
        }
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        lock(&self.lease).take();
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for TransportChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportChannel")
            .field("peer", &self.peer)
            .field("codec", &self.codec)
            .field("resource", &self.resource.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Try each address in order; return the first stream or the last error.
async fn connect_first(
    addresses: Vec<NodeAddress>,
    timeout: Option<Duration>,
) -> Result<(TcpStream, NodeAddress)> {
    let mut last_error = Error::config("no addresses configured");
    for address in addresses {
        let attempt = TcpStream::connect((address.host.as_str(), address.port));
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, attempt).await {
                Ok(result) => result.map_err(Error::from),
                Err(_) => Err(Error::timeout(format!("connecting to {} timed out", address))),
            },
            None => attempt.await.map_err(Error::from),
        };
        match outcome {
            Ok(stream) => return Ok((stream, address)),
            Err(e) => {
                debug!("Connect to {} failed: {}", address, e);
                last_error = e;
            }
        }
    }
    Err(last_error)
}
