//! [`RemoteTransport`] over any ordered byte stream or a WebSocket.
//!
//! The client side ([`StreamTransport`]) keeps one lazily opened connection
//! and reopens it after a failure. Byte streams carry length-prefixed
//! frames; WebSockets carry one frame per binary message. Requests are matched to answers by
//! `request_id`; `Notify` frames feed the head broadcast that wakes change
//! streams. The server side ([`serve_connection`]) answers frames from a
//! [`SyncBackend`] and forwards its head notifications.

use crate::codec::{read_frame, write_frame};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{ErrorFrame, SyncFrame, MAX_BATCH_SIZE};
use crate::transport::{pull_stream, ChangePage, ChangeStream, RemoteTransport, SyncBackend, WriteAck};
use crate::ws::{self, WsConnector, WsStream};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::StreamExt;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use synclog_types::{Entry, RemoteId};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const OUTGOING_CAPACITY: usize = 64;
const NOTIFY_CAPACITY: usize = 64;

/// A duplex byte stream.
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncIo for T {}

pub type BoxedIo = Box<dyn AsyncIo>;

/// Opens a fresh connection to the remote.
#[async_trait]
pub trait Connect: Send + Sync {
    async fn connect(&self) -> io::Result<BoxedIo>;
}

/// Connects over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connect for TcpConnector {
    async fn connect(&self) -> io::Result<BoxedIo> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Configuration for [`StreamTransport`].
#[derive(Debug, Clone)]
pub struct StreamTransportConfig {
    /// How long to wait for an answer before failing a request.
    pub request_timeout: Duration,
    /// Pull interval when no `Notify` arrives.
    pub poll_interval: Duration,
    /// Page size for pulls.
    pub batch_size: usize,
}

impl Default for StreamTransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(5),
            batch_size: MAX_BATCH_SIZE,
        }
    }
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<SyncFrame>>>>;

/// How a [`StreamTransport`] opens connections.
enum Dialer {
    Stream(Box<dyn Connect>),
    WebSocket(WsConnector),
}

impl Dialer {
    async fn open(&self) -> io::Result<(LinkReader, LinkWriter)> {
        match self {
            Dialer::Stream(connector) => {
                let (reader, writer) = tokio::io::split(connector.connect().await?);
                Ok((LinkReader::Framed(reader), LinkWriter::Framed(writer)))
            }
            Dialer::WebSocket(connector) => {
                let (writer, reader) = connector.connect().await?.split();
                Ok((LinkReader::Ws(reader), LinkWriter::Ws(writer)))
            }
        }
    }
}

enum LinkReader {
    Framed(ReadHalf<BoxedIo>),
    Ws(SplitStream<WsStream>),
}

impl LinkReader {
    async fn next_frame(&mut self) -> io::Result<Option<SyncFrame>> {
        match self {
            LinkReader::Framed(reader) => read_frame(reader).await,
            LinkReader::Ws(reader) => ws::read_frame(reader).await,
        }
    }
}

enum LinkWriter {
    Framed(WriteHalf<BoxedIo>),
    Ws(SplitSink<WsStream, Message>),
}

impl LinkWriter {
    async fn send_frame(&mut self, frame: &SyncFrame) -> io::Result<()> {
        match self {
            LinkWriter::Framed(writer) => write_frame(writer, frame).await,
            LinkWriter::Ws(writer) => ws::write_frame(writer, frame).await,
        }
    }
}

/// One live connection: a writer task and a reader task.
struct Connection {
    outgoing: mpsc::Sender<SyncFrame>,
    pending: Pending,
    closed: CancellationToken,
}

impl Connection {
    fn spawn(
        (mut reader, mut writer): (LinkReader, LinkWriter),
        notify: broadcast::Sender<u64>,
    ) -> Arc<Self> {
        let (outgoing, mut outgoing_rx) = mpsc::channel::<SyncFrame>(OUTGOING_CAPACITY);
        let pending: Pending = Arc::default();
        let closed = CancellationToken::new();

        let writer_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = writer_closed.cancelled() => break,
                    frame = outgoing_rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                if let Err(e) = writer.send_frame(&frame).await {
                    warn!("connection write failed: {e}");
                    break;
                }
            }
            writer_closed.cancel();
        });

        let reader_pending = pending.clone();
        let reader_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                let read = tokio::select! {
                    _ = reader_closed.cancelled() => break,
                    read = reader.next_frame() => read,
                };
                match read {
                    Ok(Some(SyncFrame::Notify { head_sequence })) => {
                        trace!(head_sequence, "remote head moved");
                        let _ = notify.send(head_sequence);
                    }
                    Ok(Some(frame)) => route(&reader_pending, frame),
                    Ok(None) => {
                        debug!("connection closed by remote");
                        break;
                    }
                    Err(e) => {
                        warn!("connection read failed: {e}");
                        break;
                    }
                }
            }
            reader_closed.cancel();
            // Dropping the senders fails every request still in flight.
            lock(&reader_pending).clear();
        });

        Arc::new(Self {
            outgoing,
            pending,
            closed,
        })
    }

    fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }
}

fn route(pending: &Pending, frame: SyncFrame) {
    match frame.request_id() {
        Some(id) => match lock(pending).remove(&id) {
            Some(tx) => {
                let _ = tx.send(frame);
            }
            None => debug!(request_id = id, "answer for unknown request"),
        },
        None => {
            if let SyncFrame::Error(err) = frame {
                warn!("remote error: {}", err.message);
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct StreamInner {
    remote_id: RemoteId,
    dialer: Dialer,
    config: StreamTransportConfig,
    next_request: AtomicU64,
    connection: tokio::sync::Mutex<Option<Arc<Connection>>>,
    notify: broadcast::Sender<u64>,
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        if let Some(conn) = self.connection.get_mut() {
            conn.closed.cancel();
        }
    }
}

/// Client side of the framed protocol.
#[derive(Clone)]
pub struct StreamTransport {
    inner: Arc<StreamInner>,
}

impl StreamTransport {
    pub fn new(remote_id: RemoteId, connector: impl Connect + 'static) -> Self {
        Self::with_config(remote_id, connector, StreamTransportConfig::default())
    }

    pub fn with_config(
        remote_id: RemoteId,
        connector: impl Connect + 'static,
        config: StreamTransportConfig,
    ) -> Self {
        Self::from_dialer(remote_id, Dialer::Stream(Box::new(connector)), config)
    }

    /// Talks to a relay over WebSocket.
    pub fn websocket(remote_id: RemoteId, connector: WsConnector) -> Self {
        Self::websocket_with_config(remote_id, connector, StreamTransportConfig::default())
    }

    pub fn websocket_with_config(
        remote_id: RemoteId,
        connector: WsConnector,
        config: StreamTransportConfig,
    ) -> Self {
        Self::from_dialer(remote_id, Dialer::WebSocket(connector), config)
    }

    fn from_dialer(remote_id: RemoteId, dialer: Dialer, config: StreamTransportConfig) -> Self {
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            inner: Arc::new(StreamInner {
                remote_id,
                dialer,
                config,
                next_request: AtomicU64::new(1),
                connection: tokio::sync::Mutex::new(None),
                notify,
            }),
        }
    }

    /// Whether a connection is currently open.
    pub async fn is_connected(&self) -> bool {
        self.inner
            .connection
            .lock()
            .await
            .as_ref()
            .is_some_and(|conn| conn.is_open())
    }

    /// Closes the current connection. The next request reconnects.
    pub async fn disconnect(&self) {
        if let Some(conn) = self.inner.connection.lock().await.take() {
            conn.closed.cancel();
        }
    }

    async fn connection(&self) -> SyncResult<Arc<Connection>> {
        let mut current = self.inner.connection.lock().await;
        if let Some(conn) = current.as_ref().filter(|conn| conn.is_open()) {
            return Ok(conn.clone());
        }
        debug!(remote = %self.inner.remote_id, "opening connection");
        let link = self.inner.dialer.open().await?;
        let conn = Connection::spawn(link, self.inner.notify.clone());
        *current = Some(conn.clone());
        Ok(conn)
    }

    async fn request(&self, build: impl FnOnce(u64) -> SyncFrame) -> SyncResult<SyncFrame> {
        let conn = self.connection().await?;
        let request_id = self.inner.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&conn.pending).insert(request_id, tx);

        if conn.outgoing.send(build(request_id)).await.is_err() {
            lock(&conn.pending).remove(&request_id);
            return Err(SyncError::Transport("connection closed".into()));
        }

        match tokio::time::timeout(self.inner.config.request_timeout, rx).await {
            Err(_) => {
                lock(&conn.pending).remove(&request_id);
                Err(SyncError::Timeout)
            }
            Ok(Err(_)) => Err(SyncError::Transport("connection closed".into())),
            Ok(Ok(SyncFrame::Error(err))) => Err(SyncError::Remote(err.message)),
            Ok(Ok(frame)) => Ok(frame),
        }
    }
}

#[async_trait]
impl SyncBackend for StreamTransport {
    async fn pull(&self, since: u64, limit: usize) -> SyncResult<ChangePage> {
        let limit = u32::try_from(limit).unwrap_or(u32::MAX);
        match self
            .request(|request_id| SyncFrame::Pull {
                request_id,
                since,
                limit,
            })
            .await?
        {
            SyncFrame::Changes {
                entries, has_more, ..
            } => Ok(ChangePage { entries, has_more }),
            other => Err(SyncError::Protocol(format!("expected Changes, got {other:?}"))),
        }
    }

    async fn push(&self, entries: Vec<Entry>) -> SyncResult<WriteAck> {
        match self
            .request(|request_id| SyncFrame::Push {
                request_id,
                entries,
            })
            .await?
        {
            SyncFrame::PushAck {
                accepted,
                head_sequence,
                ..
            } => Ok(WriteAck {
                accepted: accepted as usize,
                head_sequence,
            }),
            other => Err(SyncError::Protocol(format!("expected PushAck, got {other:?}"))),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<u64> {
        self.inner.notify.subscribe()
    }
}

#[async_trait]
impl RemoteTransport for StreamTransport {
    fn remote_id(&self) -> RemoteId {
        self.inner.remote_id
    }

    async fn changes(&self, start_sequence: u64) -> SyncResult<ChangeStream> {
        // Fail here rather than inside the stream when the remote is down.
        self.connection().await?;
        Ok(pull_stream(
            Arc::new(self.clone()),
            start_sequence,
            self.inner.config.batch_size,
            self.inner.config.poll_interval,
        ))
    }

    async fn write(&self, entries: Vec<Entry>) -> SyncResult<WriteAck> {
        if entries.is_empty() {
            return Ok(WriteAck::default());
        }
        self.push(entries).await
    }
}

// ── Server side ──────────────────────────────────────────────────

/// Answers one request frame from `backend`. Frames that are not requests
/// get no answer.
pub async fn handle_frame(backend: &dyn SyncBackend, frame: SyncFrame) -> Option<SyncFrame> {
    match frame {
        SyncFrame::Pull {
            request_id,
            since,
            limit,
        } => {
            let limit = (limit as usize).clamp(1, MAX_BATCH_SIZE);
            Some(match backend.pull(since, limit).await {
                Ok(page) => SyncFrame::Changes {
                    request_id,
                    entries: page.entries,
                    has_more: page.has_more,
                },
                Err(e) => SyncFrame::Error(ErrorFrame::new(Some(request_id), e.to_string())),
            })
        }
        SyncFrame::Push {
            request_id,
            entries,
        } => Some(match backend.push(entries).await {
            Ok(ack) => SyncFrame::PushAck {
                request_id,
                accepted: u32::try_from(ack.accepted).unwrap_or(u32::MAX),
                head_sequence: ack.head_sequence,
            },
            Err(e) => SyncFrame::Error(ErrorFrame::new(Some(request_id), e.to_string())),
        }),
        other => {
            debug!("ignoring unsolicited frame: {other:?}");
            None
        }
    }
}

/// Serves the protocol on one connection until the peer hangs up.
pub async fn serve_connection<T>(io: T, backend: Arc<dyn SyncBackend>) -> SyncResult<()>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(io);
    let mut notify = Some(backend.subscribe());

    // Reads are not cancel-safe, so they run on their own task.
    let (frames_tx, mut frames) = mpsc::channel::<io::Result<SyncFrame>>(OUTGOING_CAPACITY);
    let read_task = tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(frame)) => {
                    if frames_tx.send(Ok(frame)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = frames_tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });

    let result = loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(Ok(frame)) => {
                    if let Some(reply) = handle_frame(backend.as_ref(), frame).await {
                        if let Err(e) = write_frame(&mut writer, &reply).await {
                            break Err(e.into());
                        }
                    }
                }
                Some(Err(e)) => {
                    let reply = SyncFrame::Error(ErrorFrame::new(None, e.to_string()));
                    let _ = write_frame(&mut writer, &reply).await;
                    break Err(e.into());
                }
                None => break Ok(()),
            },
            head_sequence = next_head(&mut notify) => {
                if let Err(e) = write_frame(&mut writer, &SyncFrame::Notify { head_sequence }).await {
                    break Err(e.into());
                }
            }
        }
    };

    read_task.abort();
    result
}

/// Next head announced by the backend. Pends forever once the backend stops
/// announcing.
async fn next_head(notify: &mut Option<broadcast::Receiver<u64>>) -> u64 {
    loop {
        let Some(rx) = notify.as_mut() else {
            return std::future::pending().await;
        };
        match rx.recv().await {
            Ok(head) => return head,
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => *notify = None,
        }
    }
}
