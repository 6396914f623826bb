//! Stream multiplexer over one tunnel WebSocket.
//!
//! Both proxy roles share the framing and the stream registry. The
//! destination dials a local service on `STREAM_START`; the source accepts
//! local connections and announces each one with `STREAM_START`.
//!
//! Every registered stream has two tasks: a pump that turns local reads
//! into `DATA` frames, and a writer that drains inbound `DATA` into the
//! local connection. The session ends on `SESSION_RESET` or when the
//! WebSocket closes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{self, Message};

use iotdev_protocol::{IotError, IotResult};

use crate::dialer::{BoxedStream, Dialer};
use crate::frame::{Frame, FrameDecoder, FrameType};

/// Read buffer per stream pump.
const PUMP_BUFFER: usize = 8 * 1024;

/// Interval between empty WebSocket pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Receives errors the session survives: bad frames, dial failures, and
/// per-stream I/O errors.
pub type ErrorHandler = Arc<dyn Fn(&IotError) + Send + Sync>;

/// Settings shared by both proxy roles.
#[derive(Clone)]
pub struct ProxyOptions {
    ping_interval: Duration,
    on_error: ErrorHandler,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            on_error: Arc::new(|e| tracing::warn!(error = %e, "tunnel error")),
        }
    }
}

impl ProxyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&IotError) + Send + Sync + 'static,
    {
        self.on_error = Arc::new(handler);
        self
    }
}

/// Serve the destination side: dial `dialer` for each stream the peer
/// starts and relay bytes both ways.
///
/// Returns `Ok(())` on `SESSION_RESET` or WebSocket close, and an error
/// only when the socket itself fails.
pub async fn proxy_destination<S>(
    ws: WebSocketStream<S>,
    dialer: Arc<dyn Dialer>,
    options: ProxyOptions,
) -> IotResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let session = Session::start(ws, &options);
    let mut reader = session.reader;
    let mux = session.mux;

    let result = loop {
        match reader.next(&mux).await {
            Ok(Some(frame)) => {
                if !mux.on_frame(frame, Some(&dialer)) {
                    break Ok(());
                }
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    mux.reset_all();
    session.writer.finish().await;
    tracing::info!(ok = result.is_ok(), "destination tunnel session ended");
    result
}

/// Serve the source side: accept local connections on `listener`, each
/// becoming a stream numbered from 1.
///
/// Returns like [`proxy_destination`].
pub async fn proxy_source<S>(
    ws: WebSocketStream<S>,
    listener: TcpListener,
    options: ProxyOptions,
) -> IotResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let session = Session::start(ws, &options);
    let mut reader = session.reader;
    let mux = session.mux;
    let mut next_id: i32 = 1;

    let result = loop {
        tokio::select! {
            inbound = reader.next(&mux) => match inbound {
                Ok(Some(frame)) => {
                    if !mux.on_frame(frame, None) {
                        break Ok(());
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            },
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let id = next_id;
                    next_id = next_id.wrapping_add(1).max(1);
                    tracing::debug!(stream_id = id, %peer, "local connection accepted");
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(error = %e, "set_nodelay failed");
                    }
                    mux.send(Frame::stream_start(id)).await;
                    mux.attach(id, Box::new(stream));
                }
                Err(e) => mux.report(IotError::wrap("accepting local connection", e)),
            },
        }
    };

    mux.reset_all();
    session.writer.finish().await;
    tracing::info!(ok = result.is_ok(), "source tunnel session ended");
    result
}

// ── Session plumbing ──────────────────────────────────────────

struct Session<S> {
    mux: Arc<Mux>,
    reader: FrameReader<S>,
    writer: SocketWriter,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn start(ws: WebSocketStream<S>, options: &ProxyOptions) -> Self {
        let (sink, incoming) = ws.split();
        let (frames_tx, frames_rx) = mpsc::channel(64);
        let (close_tx, close_rx) = oneshot::channel();
        let task = tokio::spawn(write_socket(
            sink,
            frames_rx,
            close_rx,
            options.ping_interval,
            options.on_error.clone(),
        ));
        Self {
            mux: Arc::new(Mux {
                outbound: frames_tx,
                streams: Mutex::new(HashMap::new()),
                serial: AtomicU64::new(0),
                on_error: options.on_error.clone(),
            }),
            reader: FrameReader {
                incoming,
                decoder: FrameDecoder::new(),
            },
            writer: SocketWriter {
                close: close_tx,
                task,
            },
        }
    }
}

struct FrameReader<S> {
    incoming: SplitStream<WebSocketStream<S>>,
    decoder: FrameDecoder,
}

impl<S> FrameReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Next inbound frame; `None` once the socket is closed.
    ///
    /// Undecodable frames are reported and skipped. Cancel safe.
    async fn next(&mut self, mux: &Mux) -> IotResult<Option<Frame>> {
        loop {
            while let Some(decoded) = self.decoder.next_frame() {
                match decoded {
                    Ok(frame) => return Ok(Some(frame)),
                    Err(e) => mux.report(e),
                }
            }
            match self.incoming.next().await {
                Some(Ok(Message::Binary(data))) => self.decoder.extend(&data),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => {}
                Some(Err(tungstenite::Error::ConnectionClosed)) => return Ok(None),
                Some(Err(e)) => {
                    return Err(IotError::wrap(
                        "reading tunnel socket",
                        IotError::Connection(e.to_string()),
                    ));
                }
            }
        }
    }
}

struct SocketWriter {
    close: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl SocketWriter {
    /// Flush queued frames and close the WebSocket.
    async fn finish(self) {
        let _ = self.close.send(());
        let mut task = self.task;
        if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
            task.abort();
        }
    }
}

async fn write_socket<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut frames: mpsc::Receiver<Frame>,
    mut close: oneshot::Receiver<()>,
    ping_interval: Duration,
    on_error: ErrorHandler,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    loop {
        let message = tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => match frame.to_wire() {
                    Ok(wire) => Message::Binary(wire.into()),
                    Err(e) => {
                        on_error(&e);
                        continue;
                    }
                },
                None => break,
            },
            _ = ping.tick() => Message::Ping(Bytes::new()),
            _ = &mut close => {
                while let Ok(frame) = frames.try_recv() {
                    if let Ok(wire) = frame.to_wire() {
                        let _ = sink.feed(Message::Binary(wire.into())).await;
                    }
                }
                break;
            }
        };
        if let Err(e) = sink.send(message).await {
            tracing::debug!(error = %e, "tunnel socket write failed");
            return;
        }
    }
    let _ = sink.close().await;
}

// ── Stream registry ───────────────────────────────────────────

struct StreamEntry {
    serial: u64,
    data: mpsc::UnboundedSender<Bytes>,
    /// Dial-then-pump task; the writer runs separately.
    task: AbortHandle,
}

struct Mux {
    outbound: mpsc::Sender<Frame>,
    streams: Mutex<HashMap<i32, StreamEntry>>,
    serial: AtomicU64,
    on_error: ErrorHandler,
}

impl Mux {
    fn report(&self, err: IotError) {
        (self.on_error)(&err);
    }

    async fn send(&self, frame: Frame) {
        if self.outbound.send(frame).await.is_err() {
            tracing::debug!("tunnel socket writer stopped, frame dropped");
        }
    }

    fn lock_streams(&self) -> std::sync::MutexGuard<'_, HashMap<i32, StreamEntry>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Handle one inbound frame. Returns `false` when the session is over.
    ///
    /// Never waits on a dial or a local connection, so one slow stream
    /// cannot hold up the others.
    fn on_frame(self: &Arc<Self>, frame: Frame, dialer: Option<&Arc<dyn Dialer>>) -> bool {
        let id = frame.stream_id;
        match frame.kind() {
            Some(FrameType::StreamStart) => match dialer {
                Some(dialer) => self.open(id, dialer.clone()),
                None => tracing::debug!(stream_id = id, "STREAM_START ignored by source"),
            },
            Some(FrameType::Data) => self.forward(id, frame.payload),
            Some(FrameType::StreamReset) => {
                tracing::debug!(stream_id = id, "stream reset by peer");
                self.reset(id);
            }
            Some(FrameType::SessionReset) => {
                tracing::info!("session reset by peer");
                return false;
            }
            Some(FrameType::Unknown) | None => self.report(IotError::Decode(format!(
                "unknown tunnel frame type {}",
                frame.r#type
            ))),
        }
        true
    }

    /// Register `id` at once and dial in the background. `DATA` arriving
    /// before the dial completes is buffered.
    fn open(self: &Arc<Self>, id: i32, dialer: Arc<dyn Dialer>) {
        self.register(id, move |mux, serial, data| async move {
            match dialer.dial().await {
                Ok(stream) => {
                    tracing::debug!(stream_id = id, "local service dialed");
                    serve_stream(mux, id, serial, stream, data).await;
                }
                Err(e) => {
                    mux.report(IotError::wrap(format!("dialing local service for stream {id}"), e));
                    if mux.forget(id, serial).is_some() {
                        mux.send(Frame::stream_reset(id)).await;
                    }
                }
            }
        });
    }

    /// Register an already connected `stream` under `id`.
    fn attach(self: &Arc<Self>, id: i32, stream: BoxedStream) {
        self.register(id, move |mux, serial, data| {
            serve_stream(mux, id, serial, stream, data)
        });
    }

    fn register<F, Fut>(self: &Arc<Self>, id: i32, run: F)
    where
        F: FnOnce(Arc<Mux>, u64, mpsc::UnboundedReceiver<Bytes>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        let (data_tx, data_rx) = mpsc::unbounded_channel();

        // Held across the spawn so the task cannot deregister before insert.
        let mut streams = self.lock_streams();
        let task = tokio::spawn(run(self.clone(), serial, data_rx)).abort_handle();
        let previous = streams.insert(
            id,
            StreamEntry {
                serial,
                data: data_tx,
                task,
            },
        );
        if let Some(old) = previous {
            tracing::debug!(stream_id = id, "replacing existing stream");
            old.task.abort();
        }
    }

    fn forward(&self, id: i32, payload: Bytes) {
        let data = self.lock_streams().get(&id).map(|s| s.data.clone());
        match data {
            Some(data) => {
                if data.send(payload).is_err() {
                    self.report(IotError::Other(format!("stream {id} is closed")));
                }
            }
            None => tracing::debug!(stream_id = id, "data for unknown stream dropped"),
        }
    }

    /// Close and deregister `id`. Queued data is still written out.
    fn reset(&self, id: i32) {
        if let Some(entry) = self.lock_streams().remove(&id) {
            entry.task.abort();
        }
    }

    fn reset_all(&self) {
        let drained: Vec<StreamEntry> = self.lock_streams().drain().map(|(_, e)| e).collect();
        for entry in drained {
            entry.task.abort();
        }
    }

    /// Deregister `id` if it is still the stream with `serial`.
    fn forget(&self, id: i32, serial: u64) -> Option<StreamEntry> {
        let mut streams = self.lock_streams();
        if streams.get(&id).is_some_and(|s| s.serial == serial) {
            streams.remove(&id)
        } else {
            None
        }
    }
}

/// Start the writer for `stream` and pump its reads until EOF.
async fn serve_stream(
    mux: Arc<Mux>,
    id: i32,
    serial: u64,
    stream: BoxedStream,
    data: mpsc::UnboundedReceiver<Bytes>,
) {
    let (reader, writer) = tokio::io::split(stream);
    tokio::spawn(write_stream(mux.clone(), id, serial, writer, data));
    pump_stream(mux, id, serial, reader).await;
}

async fn pump_stream(mux: Arc<Mux>, id: i32, serial: u64, mut reader: ReadHalf<BoxedStream>) {
    let mut buf = vec![0u8; PUMP_BUFFER];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                mux.send(Frame::data(id, Bytes::copy_from_slice(&buf[..n])))
                    .await
            }
            Err(e) => {
                mux.report(IotError::wrap(format!("reading stream {id}"), e));
                break;
            }
        }
    }
    if mux.forget(id, serial).is_some() {
        tracing::debug!(stream_id = id, "local stream closed");
        mux.send(Frame::stream_reset(id)).await;
    }
}

async fn write_stream(
    mux: Arc<Mux>,
    id: i32,
    serial: u64,
    mut writer: WriteHalf<BoxedStream>,
    mut data: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(chunk) = data.recv().await {
        if let Err(e) = writer.write_all(&chunk).await {
            mux.report(IotError::wrap(format!("writing stream {id}"), e));
            if let Some(entry) = mux.forget(id, serial) {
                entry.task.abort();
                mux.send(Frame::stream_reset(id)).await;
            }
            return;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::io::{DuplexStream, duplex};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    type PeerSocket = WebSocketStream<DuplexStream>;

    async fn ws_pair() -> (WebSocketStream<DuplexStream>, PeerSocket) {
        let (a, b) = duplex(64 * 1024);
        let proxy = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let peer = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        (proxy, peer)
    }

    /// Hands the far end of each dialed connection to the test.
    struct DuplexDialer {
        accepted: mpsc::UnboundedSender<DuplexStream>,
    }

    #[async_trait]
    impl Dialer for DuplexDialer {
        async fn dial(&self) -> std::io::Result<BoxedStream> {
            let (local, remote) = duplex(64 * 1024);
            self.accepted
                .send(remote)
                .map_err(|_| std::io::Error::other("test dropped"))?;
            Ok(Box::new(local))
        }
    }

    struct RefusingDialer;

    #[async_trait]
    impl Dialer for RefusingDialer {
        async fn dial(&self) -> std::io::Result<BoxedStream> {
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "refused",
            ))
        }
    }

    /// Holds the first dial until `gate` is notified; later dials go
    /// straight through.
    struct GatedDialer {
        inner: DuplexDialer,
        calls: std::sync::atomic::AtomicUsize,
        gate: tokio::sync::Notify,
    }

    #[async_trait]
    impl Dialer for GatedDialer {
        async fn dial(&self) -> std::io::Result<BoxedStream> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.gate.notified().await;
            }
            self.inner.dial().await
        }
    }

    struct Peer {
        ws: PeerSocket,
        decoder: FrameDecoder,
    }

    impl Peer {
        async fn send(&mut self, frame: Frame) {
            let wire = frame.to_wire().unwrap();
            self.ws.send(Message::Binary(wire.into())).await.unwrap();
        }

        async fn recv(&mut self) -> Frame {
            loop {
                if let Some(frame) = self.decoder.next_frame() {
                    return frame.unwrap();
                }
                match self.ws.next().await.unwrap().unwrap() {
                    Message::Binary(data) => self.decoder.extend(&data),
                    _ => {}
                }
            }
        }
    }

    fn collect_errors() -> (Arc<Mutex<Vec<String>>>, ProxyOptions) {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let options = ProxyOptions::new().on_error(move |e| sink.lock().unwrap().push(e.to_string()));
        (errors, options)
    }

    #[tokio::test]
    async fn destination_relays_both_directions() {
        let (proxy_ws, peer_ws) = ws_pair().await;
        let (tx, mut dialed) = mpsc::unbounded_channel();
        let session = tokio::spawn(proxy_destination(
            proxy_ws,
            Arc::new(DuplexDialer { accepted: tx }),
            ProxyOptions::new(),
        ));
        let mut peer = Peer {
            ws: peer_ws,
            decoder: FrameDecoder::new(),
        };

        peer.send(Frame::stream_start(1)).await;
        peer.send(Frame::data(1, &b"hello"[..])).await;
        let mut service = dialed.recv().await.unwrap();
        let mut buf = [0u8; 5];
        service.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        service.write_all(b"world").await.unwrap();
        let reply = peer.recv().await;
        assert_eq!(reply.kind(), Some(FrameType::Data));
        assert_eq!(reply.stream_id, 1);
        assert_eq!(&reply.payload[..], b"world");

        peer.send(Frame::session_reset()).await;
        assert!(session.await.unwrap().is_ok());
    }

    async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
        tokio::time::timeout(Duration::from_secs(5), fut)
            .await
            .expect("timed out")
    }

    #[tokio::test]
    async fn destination_session_reset_closes_local_streams() {
        let (proxy_ws, peer_ws) = ws_pair().await;
        let (tx, mut dialed) = mpsc::unbounded_channel();
        let (errors, options) = collect_errors();
        let session = tokio::spawn(proxy_destination(
            proxy_ws,
            Arc::new(DuplexDialer { accepted: tx }),
            options,
        ));
        let mut peer = Peer {
            ws: peer_ws,
            decoder: FrameDecoder::new(),
        };

        peer.send(Frame::stream_start(1)).await;
        let mut service = within(dialed.recv()).await.unwrap();

        // A reset for a stream that was never opened changes nothing.
        peer.send(Frame::stream_reset(99)).await;
        peer.send(Frame::data(1, &b"still here"[..])).await;
        let mut buf = [0u8; 10];
        within(service.read_exact(&mut buf)).await.unwrap();
        assert_eq!(&buf, b"still here");

        peer.send(Frame::session_reset()).await;
        assert!(within(session).await.unwrap().is_ok());
        let mut rest = Vec::new();
        within(service.read_to_end(&mut rest)).await.unwrap();
        assert!(rest.is_empty());
        assert!(errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn source_session_reset_closes_local_connections() {
        let (proxy_ws, peer_ws) = ws_pair().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();
        let session = tokio::spawn(proxy_source(proxy_ws, listener, ProxyOptions::new()));
        let mut peer = Peer {
            ws: peer_ws,
            decoder: FrameDecoder::new(),
        };

        let mut client = TcpStream::connect(local).await.unwrap();
        assert_eq!(within(peer.recv()).await.kind(), Some(FrameType::StreamStart));

        peer.send(Frame::stream_reset(42)).await;
        client.write_all(b"x").await.unwrap();
        let data = within(peer.recv()).await;
        assert_eq!((data.stream_id, &data.payload[..]), (1, &b"x"[..]));

        peer.send(Frame::session_reset()).await;
        assert!(within(session).await.unwrap().is_ok());
        let mut rest = Vec::new();
        within(client.read_to_end(&mut rest)).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn slow_dial_does_not_hold_up_other_streams() {
        let (proxy_ws, peer_ws) = ws_pair().await;
        let (tx, mut dialed) = mpsc::unbounded_channel();
        let dialer = Arc::new(GatedDialer {
            inner: DuplexDialer { accepted: tx },
            calls: std::sync::atomic::AtomicUsize::new(0),
            gate: tokio::sync::Notify::new(),
        });
        let _session = tokio::spawn(proxy_destination(
            proxy_ws,
            dialer.clone(),
            ProxyOptions::new(),
        ));
        let mut peer = Peer {
            ws: peer_ws,
            decoder: FrameDecoder::new(),
        };

        peer.send(Frame::stream_start(1)).await;
        peer.send(Frame::data(1, &b"early"[..])).await;
        peer.send(Frame::stream_start(2)).await;
        peer.send(Frame::data(2, &b"fast"[..])).await;

        let mut second = within(dialed.recv()).await.unwrap();
        let mut buf = [0u8; 4];
        within(second.read_exact(&mut buf)).await.unwrap();
        assert_eq!(&buf, b"fast");

        // Data sent before the dial finished is delivered once it does.
        dialer.gate.notify_one();
        let mut first = within(dialed.recv()).await.unwrap();
        let mut buf = [0u8; 5];
        within(first.read_exact(&mut buf)).await.unwrap();
        assert_eq!(&buf, b"early");
    }

    #[tokio::test]
    async fn stalled_local_reader_does_not_block_other_streams() {
        let (proxy_ws, peer_ws) = ws_pair().await;
        let (tx, mut dialed) = mpsc::unbounded_channel();
        let _session = tokio::spawn(proxy_destination(
            proxy_ws,
            Arc::new(DuplexDialer { accepted: tx }),
            ProxyOptions::new(),
        ));
        let mut peer = Peer {
            ws: peer_ws,
            decoder: FrameDecoder::new(),
        };

        peer.send(Frame::stream_start(1)).await;
        let _stalled = within(dialed.recv()).await.unwrap();
        for _ in 0..256 {
            peer.send(Frame::data(1, vec![0u8; 1024])).await;
        }

        peer.send(Frame::stream_start(2)).await;
        peer.send(Frame::data(2, &b"through"[..])).await;
        let mut other = within(dialed.recv()).await.unwrap();
        let mut buf = [0u8; 7];
        within(other.read_exact(&mut buf)).await.unwrap();
        assert_eq!(&buf, b"through");
    }

    #[tokio::test]
    async fn local_eof_sends_stream_reset() {
        let (proxy_ws, peer_ws) = ws_pair().await;
        let (tx, mut dialed) = mpsc::unbounded_channel();
        let _session = tokio::spawn(proxy_destination(
            proxy_ws,
            Arc::new(DuplexDialer { accepted: tx }),
            ProxyOptions::new(),
        ));
        let mut peer = Peer {
            ws: peer_ws,
            decoder: FrameDecoder::new(),
        };

        peer.send(Frame::stream_start(7)).await;
        let service = dialed.recv().await.unwrap();
        drop(service);

        let frame = peer.recv().await;
        assert_eq!(frame.kind(), Some(FrameType::StreamReset));
        assert_eq!(frame.stream_id, 7);
    }

    #[tokio::test]
    async fn dial_failure_is_reported_and_session_continues() {
        let (proxy_ws, peer_ws) = ws_pair().await;
        let (errors, options) = collect_errors();
        let session = tokio::spawn(proxy_destination(proxy_ws, Arc::new(RefusingDialer), options));
        let mut peer = Peer {
            ws: peer_ws,
            decoder: FrameDecoder::new(),
        };

        peer.send(Frame::stream_start(1)).await;
        let frame = peer.recv().await;
        assert_eq!(frame.kind(), Some(FrameType::StreamReset));
        assert!(errors.lock().unwrap()[0].contains("dialing local service for stream 1"));

        // Garbage between frames is reported, not fatal.
        peer.ws
            .send(Message::Binary(vec![0x00, 0x02, 0x08, 0xff].into()))
            .await
            .unwrap();
        peer.send(Frame::data(9, &b"nobody"[..])).await;
        peer.send(Frame::session_reset()).await;
        assert!(session.await.unwrap().is_ok());
        assert_eq!(errors.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn socket_close_ends_session() {
        let (proxy_ws, mut peer_ws) = ws_pair().await;
        let session = tokio::spawn(proxy_destination(
            proxy_ws,
            Arc::new(RefusingDialer),
            ProxyOptions::new(),
        ));
        peer_ws.close(None).await.unwrap();
        assert!(session.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn idle_session_sends_empty_pings() {
        let (proxy_ws, mut peer_ws) = ws_pair().await;
        let _session = tokio::spawn(proxy_destination(
            proxy_ws,
            Arc::new(RefusingDialer),
            ProxyOptions::new().ping_interval(Duration::from_millis(20)),
        ));
        match peer_ws.next().await.unwrap().unwrap() {
            Message::Ping(payload) => assert!(payload.is_empty()),
            other => panic!("expected ping, got {other:?}"),
        }
    }

    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let (mut r, mut w) = sock.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn source_and_destination_carry_concurrent_streams() {
        let echo = echo_server().await;
        let (a, b) = duplex(64 * 1024);
        let source_ws = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let dest_ws = WebSocketStream::from_raw_socket(b, Role::Server, None).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();
        tokio::spawn(proxy_source(source_ws, listener, ProxyOptions::new()));
        tokio::spawn(proxy_destination(
            dest_ws,
            Arc::new(crate::dialer::TcpDialer::new(echo)),
            ProxyOptions::new(),
        ));

        let mut first = TcpStream::connect(local).await.unwrap();
        let mut second = TcpStream::connect(local).await.unwrap();
        first.write_all(b"one").await.unwrap();
        second.write_all(b"two").await.unwrap();

        let mut buf = [0u8; 3];
        second.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"two");
        first.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"one");
    }

    #[tokio::test]
    async fn source_numbers_streams_from_one() {
        let (proxy_ws, peer_ws) = ws_pair().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();
        let _session = tokio::spawn(proxy_source(proxy_ws, listener, ProxyOptions::new()));
        let mut peer = Peer {
            ws: peer_ws,
            decoder: FrameDecoder::new(),
        };

        let mut client = TcpStream::connect(local).await.unwrap();
        let start = peer.recv().await;
        assert_eq!(start.kind(), Some(FrameType::StreamStart));
        assert_eq!(start.stream_id, 1);

        client.write_all(b"abc").await.unwrap();
        let data = peer.recv().await;
        assert_eq!((data.stream_id, &data.payload[..]), (1, &b"abc"[..]));

        let _second = TcpStream::connect(local).await.unwrap();
        assert_eq!(peer.recv().await.stream_id, 2);

        // Peer reset closes the local connection.
        peer.send(Frame::stream_reset(1)).await;
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
