//! Per-client connection handling.
//!
//! Each client runs a reader task (handshake, then input messages), a writer task
//! (framebuffer updates) and a dispatcher on a blocking thread that hands its input events
//! to the host in arrival order. The socket's write half sits behind an async mutex, the client's
//! send lock: whoever holds it may write to the client, and a framebuffer swap holds every
//! client's send lock so no update is encoded across the swap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex, Notify};

use super::auth::{self, CHALLENGE_LEN};
use super::clipboard;
use super::error::{Result, VncError};
use crate::error::EstablishError;

use super::events::{dispatch_events, ClientEvent, ClientId, ClipboardText};
use super::framebuffer::Surface;
use super::protocol::*;
use super::server::EngineContext;
use super::translate::translate_pixels;

/// Process-wide client identifier counter; 0 is never handed out.
static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Host-visible details of a connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: ClientId,
    /// Peer address for inbound clients, the dialled host for outbound ones.
    pub host: String,
    /// Port dialled for reverse and repeater connections.
    pub destination_port: Option<u16>,
    /// Identifier registered with a repeater.
    pub repeater_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpdateRequest {
    incremental: bool,
    x: u16,
    y: u16,
    w: u16,
    h: u16,
}

impl UpdateRequest {
    fn merge(self, other: UpdateRequest) -> UpdateRequest {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = self.x.saturating_add(self.w).max(other.x.saturating_add(other.w));
        let bottom = self.y.saturating_add(self.h).max(other.y.saturating_add(other.h));
        UpdateRequest {
            incremental: self.incremental && other.incremental,
            x,
            y,
            w: right - x,
            h: bottom - y,
        }
    }

    /// Clips the request to a `width` x `height` surface, returning `(x, y, w, h)`.
    fn clip(self, width: u16, height: u16) -> (u16, u16, u16, u16) {
        let x = self.x.min(width);
        let y = self.y.min(height);
        (x, y, self.w.min(width - x), self.h.min(height - y))
    }
}

/// Write side of a client, guarded by the client's send lock.
pub(crate) struct ClientWriter {
    stream: OwnedWriteHalf,
    format: PixelFormat,
    desktop_size: bool,
    ext_clipboard: bool,
    /// Dimensions the client was last told about.
    sent_size: (u16, u16),
    force_full: bool,
}

pub(crate) type SendLock = Arc<AsyncMutex<ClientWriter>>;

impl ClientWriter {
    fn new(stream: OwnedWriteHalf, size: (u16, u16)) -> Self {
        Self {
            stream,
            format: PixelFormat::server_native(),
            desktop_size: false,
            ext_clipboard: false,
            sent_size: size,
            force_full: false,
        }
    }

    async fn write(&mut self, data: &[u8], wait: Duration) -> Result<()> {
        match tokio::time::timeout(wait, self.stream.write_all(data)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(VncError::WriteTimeout(wait)),
        }
    }

    /// Encodes the answer to `request` against `surface` into `buf`.
    fn encode_update(&mut self, surface: &Surface, request: UpdateRequest, buf: &mut BytesMut) {
        let size = (surface.width(), surface.height());

        if size != self.sent_size && self.desktop_size {
            put_update_header(buf, 1);
            put_rect_header(buf, 0, 0, size.0, size.1, ENCODING_DESKTOP_SIZE);
            self.sent_size = size;
            self.force_full = true;
            return;
        }

        // Clients that cannot resize keep seeing the overlap of old and new geometry.
        let limit_w = size.0.min(self.sent_size.0);
        let limit_h = size.1.min(self.sent_size.1);
        let (x, y, w, h) = if self.force_full {
            (0, 0, limit_w, limit_h)
        } else {
            request.clip(limit_w, limit_h)
        };
        self.force_full = false;

        if w == 0 || h == 0 {
            put_update_header(buf, 0);
            return;
        }

        buf.reserve(16 + w as usize * h as usize * self.format.bytes_per_pixel());
        put_update_header(buf, 1);
        put_rect_header(buf, x, y, w, h, ENCODING_RAW);
        for row in y..y + h {
            translate_pixels(surface.row(x, row, w), &self.format, buf);
        }
    }
}

/// Shared state of one client connection.
pub(crate) struct ClientConn {
    info: ClientInfo,
    send: OnceCell<SendLock>,
    pending: Mutex<Option<UpdateRequest>>,
    request_ready: Notify,
    close: watch::Sender<bool>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl ClientConn {
    fn new(info: ClientInfo, events: mpsc::UnboundedSender<ClientEvent>) -> Self {
        let (close, _) = watch::channel(false);
        Self {
            info,
            send: OnceCell::new(),
            pending: Mutex::new(None),
            request_ready: Notify::new(),
            close,
            events,
        }
    }

    pub(crate) fn id(&self) -> ClientId {
        self.info.id
    }

    pub(crate) fn info(&self) -> &ClientInfo {
        &self.info
    }

    /// The send lock, available once the handshake has completed.
    pub(crate) fn send_lock(&self) -> Option<SendLock> {
        self.send.get().cloned()
    }

    /// Asks both client tasks to wind down.
    pub(crate) fn close(&self) {
        self.close.send_replace(true);
    }

    /// Hands an input event to the client's dispatcher without waiting for the host.
    fn queue_event(&self, event: ClientEvent) {
        if self.events.send(event).is_err() {
            warn!("Client {} dispatcher is gone, dropping event", self.id());
        }
    }

    fn queue_request(&self, request: UpdateRequest) {
        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            *pending = Some(match pending.take() {
                Some(previous) => previous.merge(request),
                None => request,
            });
        }
        self.request_ready.notify_one();
    }

    fn take_request_if(&self, ready: impl FnOnce(&UpdateRequest) -> bool) -> Option<UpdateRequest> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.as_ref().map_or(false, ready) {
            pending.take()
        } else {
            None
        }
    }

    /// Pushes server clipboard text to this client.
    pub(crate) async fn send_cut_text(&self, text: &str, wait: Duration) -> Result<()> {
        let Some(send) = self.send_lock() else {
            return Ok(());
        };
        let mut writer = send.lock().await;
        let message = if writer.ext_clipboard {
            clipboard::notify()
        } else {
            clipboard::legacy_cut_text(text)
        };
        writer.write(&message, wait).await
    }
}

/// Connected clients, keyed by identifier.
#[derive(Default)]
pub(crate) struct ClientRegistry {
    clients: Mutex<HashMap<ClientId, Arc<ClientConn>>>,
}

impl ClientRegistry {
    fn insert(&self, conn: Arc<ClientConn>) {
        self.lock().insert(conn.id(), conn);
    }

    fn remove(&self, id: ClientId) {
        self.lock().remove(&id);
    }

    pub(crate) fn get(&self, id: ClientId) -> Option<Arc<ClientConn>> {
        self.lock().get(&id).cloned()
    }

    /// All clients ordered by identifier.
    pub(crate) fn snapshot(&self) -> Vec<Arc<ClientConn>> {
        let mut clients: Vec<_> = self.lock().values().cloned().collect();
        clients.sort_by_key(|conn| conn.id());
        clients
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ClientId, Arc<ClientConn>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Deregisters a client and ends its dispatch queue, which fires the disconnect hook
/// exactly once.
pub(crate) struct ClientGuard {
    registry: Arc<ClientRegistry>,
    id: ClientId,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.registry.remove(self.id);
        let _ = self.events.send(ClientEvent::Gone);
        info!("Client {} gone", self.id);
    }
}

/// A connection registered with the engine whose protocol handling has not started yet.
///
/// Dropping it without starting counts as a disconnect.
pub struct HeldClient {
    conn: Arc<ClientConn>,
    stream: TcpStream,
    /// Fires once the connect hook returned.
    ready: oneshot::Receiver<()>,
    guard: ClientGuard,
}

impl HeldClient {
    pub fn id(&self) -> ClientId {
        self.conn.id()
    }
}

/// Registers `stream` as a new client and starts its dispatcher, which raises the connect
/// hook.
///
/// Fails once the engine is shutting down; the stream is then dropped unannounced.
pub(crate) fn hold(
    ctx: &EngineContext,
    stream: TcpStream,
    host: String,
    destination_port: Option<u16>,
    repeater_id: Option<String>,
) -> std::result::Result<HeldClient, EstablishError> {
    let mut tasks = ctx.open_tasks().ok_or(EstablishError::ShuttingDown)?;

    let id = ClientId(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed));
    let (events, queue) = mpsc::unbounded_channel();
    let (ready_tx, ready) = oneshot::channel();
    let conn = Arc::new(ClientConn::new(
        ClientInfo {
            id,
            host,
            destination_port,
            repeater_id,
        },
        events.clone(),
    ));
    ctx.registry.insert(conn.clone());

    let hooks = ctx.hooks.clone();
    tasks.spawn_blocking(move || dispatch_events(hooks, id, queue, ready_tx));

    Ok(HeldClient {
        conn,
        stream,
        ready,
        guard: ClientGuard {
            registry: ctx.registry.clone(),
            id,
            events,
        },
    })
}

/// Resolves once `rx` observes `true` or its sender is gone.
pub(crate) async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

/// Resolves when either the client or the whole engine is asked to stop.
async fn stopped(ctx: &EngineContext, conn: &ClientConn) {
    let mut client = conn.close.subscribe();
    let mut engine = ctx.closing();
    tokio::select! {
        _ = wait_closed(&mut client) => {}
        _ = wait_closed(&mut engine) => {}
    }
}

/// Drives one client from handshake to disconnect.
pub(crate) async fn run_client(ctx: Arc<EngineContext>, held: HeldClient) {
    let HeldClient {
        conn,
        mut stream,
        ready,
        guard,
    } = held;
    let id = conn.id();
    let wait = ctx.max_client_wait;

    // The host hears about the client before the client hears from us.
    tokio::select! {
        _ = ready => {}
        _ = stopped(&ctx, &conn) => {
            debug!("Client {} closed before connect was reported", id);
            return;
        }
    }

    let handshake = tokio::select! {
        result = tokio::time::timeout(wait, handshake(&mut stream, &ctx)) => {
            result.unwrap_or_else(|_| Err(VncError::HandshakeTimeout(wait)))
        }
        _ = stopped(&ctx, &conn) => {
            debug!("Client {} closed during handshake", id);
            return;
        }
    };

    let size = match handshake {
        Ok(size) => size,
        Err(e) => {
            warn!("Client {} handshake failed: {}", id, e);
            return;
        }
    };
    info!("Client {} ({}) completed handshake", id, conn.info().host);

    let (reader, writer) = stream.into_split();
    let send: SendLock = Arc::new(AsyncMutex::new(ClientWriter::new(writer, size)));
    // Set exactly once, here.
    let _ = conn.send.set(send.clone());

    let writer_task = tokio::spawn(write_loop(ctx.clone(), conn.clone(), send.clone()));

    let result = tokio::select! {
        result = read_loop(&ctx, &conn, &send, reader) => result,
        _ = stopped(&ctx, &conn) => Ok(()),
    };
    match result {
        Err(VncError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            info!("Client {} closed the connection", id);
        }
        Err(e) => warn!("Client {} connection error: {}", id, e),
        Ok(()) => debug!("Client {} stopped", id),
    }

    conn.close();
    writer_task.abort();
    let _ = writer_task.await;
    let _ = send.lock().await.stream.shutdown().await;
    drop(guard);
}

/// Runs the RFB handshake up to and including ServerInit.
///
/// Returns the framebuffer dimensions announced to the client.
async fn handshake(stream: &mut TcpStream, ctx: &EngineContext) -> Result<(u16, u16)> {
    stream.write_all(PROTOCOL_VERSION).await?;
    let mut version = [0u8; 12];
    stream.read_exact(&mut version).await?;
    let minor = parse_client_version(&version).ok_or_else(|| {
        VncError::Protocol(format!(
            "unsupported protocol version {:?}",
            String::from_utf8_lossy(&version)
        ))
    })?;

    let security = if ctx.passwords.is_some() {
        SECURITY_TYPE_VNC_AUTH
    } else {
        SECURITY_TYPE_NONE
    };

    if minor >= 7 {
        stream.write_all(&[1, security]).await?;
        let chosen = stream.read_u8().await?;
        if chosen != security {
            if minor >= 8 {
                fail_security(stream, "security type not offered").await?;
            }
            return Err(VncError::Protocol(format!(
                "client chose security type {chosen}, offered {security}"
            )));
        }
    } else {
        stream.write_u32(u32::from(security)).await?;
    }

    if let Some(passwords) = &ctx.passwords {
        let challenge = auth::generate_challenge();
        stream.write_all(&challenge).await?;
        let mut response = [0u8; CHALLENGE_LEN];
        stream.read_exact(&mut response).await?;
        if !passwords.check(&challenge, &response) {
            if minor >= 8 {
                fail_security(stream, "authentication failed").await?;
            } else {
                stream.write_u32(SECURITY_RESULT_FAILED).await?;
            }
            return Err(VncError::AuthFailed);
        }
        stream.write_u32(SECURITY_RESULT_OK).await?;
    } else if minor >= 8 {
        stream.write_u32(SECURITY_RESULT_OK).await?;
    }

    // ClientInit: every client shares the desktop.
    let _shared = stream.read_u8().await?;

    let (width, height) = ctx.framebuffer.dimensions();
    stream
        .write_all(&server_init(width, height, &ctx.desktop_name))
        .await?;
    Ok((width, height))
}

async fn fail_security(stream: &mut TcpStream, reason: &str) -> Result<()> {
    stream.write_u32(SECURITY_RESULT_FAILED).await?;
    stream.write_u32(reason.len() as u32).await?;
    stream.write_all(reason.as_bytes()).await?;
    Ok(())
}

async fn read_payload(reader: &mut OwnedReadHalf, len: usize) -> Result<Vec<u8>> {
    if len > MAX_CUT_TEXT {
        return Err(VncError::Protocol(format!(
            "cut text of {len} bytes exceeds {MAX_CUT_TEXT}"
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Processes client-to-server messages until the connection ends.
async fn read_loop(
    ctx: &EngineContext,
    conn: &ClientConn,
    send: &SendLock,
    mut reader: OwnedReadHalf,
) -> Result<()> {
    let id = conn.id();
    let wait = ctx.max_client_wait;

    loop {
        match reader.read_u8().await? {
            CLIENT_MSG_SET_PIXEL_FORMAT => {
                let mut raw = [0u8; 3 + PixelFormat::SIZE];
                reader.read_exact(&mut raw).await?;
                let format = PixelFormat::from_bytes(&raw[3..])
                    .filter(PixelFormat::is_supported)
                    .ok_or_else(|| VncError::Protocol("unsupported pixel format".into()))?;
                debug!("Client {} set pixel format {:?}", id, format);
                send.lock().await.format = format;
            }
            CLIENT_MSG_SET_ENCODINGS => {
                let _padding = reader.read_u8().await?;
                let count = reader.read_u16().await?;
                let mut encodings = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    encodings.push(reader.read_i32().await?);
                }

                let mut writer = send.lock().await;
                writer.desktop_size = encodings.contains(&ENCODING_DESKTOP_SIZE);
                let ext_clipboard = encodings.contains(&ENCODING_EXTENDED_CLIPBOARD);
                let announce = ext_clipboard && !writer.ext_clipboard;
                writer.ext_clipboard = ext_clipboard;
                if announce {
                    writer.write(&clipboard::caps(), wait).await?;
                }
            }
            CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST => {
                let incremental = reader.read_u8().await? != 0;
                let x = reader.read_u16().await?;
                let y = reader.read_u16().await?;
                let w = reader.read_u16().await?;
                let h = reader.read_u16().await?;
                conn.queue_request(UpdateRequest {
                    incremental,
                    x,
                    y,
                    w,
                    h,
                });
            }
            CLIENT_MSG_KEY_EVENT => {
                let down = reader.read_u8().await? != 0;
                let _padding = reader.read_u16().await?;
                let keysym = reader.read_u32().await?;
                conn.queue_event(ClientEvent::Key { down, keysym });
            }
            CLIENT_MSG_POINTER_EVENT => {
                let button_mask = reader.read_u8().await?;
                let x = reader.read_u16().await?;
                let y = reader.read_u16().await?;
                let forwarded = ctx.latch.forward(id, button_mask, || {
                    conn.queue_event(ClientEvent::Pointer { button_mask, x, y })
                });
                if !forwarded {
                    debug!("Client {} pointer event dropped, another client owns the pointer", id);
                }
            }
            CLIENT_MSG_CLIENT_CUT_TEXT => {
                let mut padding = [0u8; 3];
                reader.read_exact(&mut padding).await?;
                let len = reader.read_i32().await?;
                if len >= 0 {
                    let text = read_payload(&mut reader, len as usize).await?;
                    conn.queue_event(ClientEvent::CutText(ClipboardText::Latin1(text)));
                } else {
                    let payload = read_payload(&mut reader, len.unsigned_abs() as usize).await?;
                    extended_clipboard(ctx, conn, send, &payload).await?;
                }
            }
            other => {
                return Err(VncError::Protocol(format!("unknown message type {other}")));
            }
        }
    }
}

async fn extended_clipboard(
    ctx: &EngineContext,
    conn: &ClientConn,
    send: &SendLock,
    payload: &[u8],
) -> Result<()> {
    let id = conn.id();
    if payload.len() < 4 {
        return Err(VncError::Protocol("short extended clipboard message".into()));
    }
    let flags = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let data = &payload[4..];
    let wait = ctx.max_client_wait;

    match flags & EXT_CLIP_ACTION_MASK {
        EXT_CLIP_ACTION_CAPS => debug!("Client {} clipboard caps {:#010x}", id, flags),
        EXT_CLIP_ACTION_NOTIFY if flags & EXT_CLIP_FORMAT_TEXT != 0 => {
            send.lock().await.write(&clipboard::request(), wait).await?;
        }
        EXT_CLIP_ACTION_PEEK => {
            if ctx.clipboard_text().is_some() {
                send.lock().await.write(&clipboard::notify(), wait).await?;
            }
        }
        EXT_CLIP_ACTION_REQUEST if flags & EXT_CLIP_FORMAT_TEXT != 0 => {
            if let Some(text) = ctx.clipboard_text() {
                let message = clipboard::provide(&text)?;
                send.lock().await.write(&message, wait).await?;
            }
        }
        EXT_CLIP_ACTION_PROVIDE => match clipboard::parse_provide(flags, data) {
            Ok(Some(text)) => conn.queue_event(ClientEvent::CutText(ClipboardText::Utf8(text))),
            Ok(None) => {}
            Err(e) => warn!("Client {} sent undecodable clipboard data: {}", id, e),
        },
        _ => debug!("Client {} clipboard message {:#010x} ignored", id, flags),
    }
    Ok(())
}

async fn write_loop(ctx: Arc<EngineContext>, conn: Arc<ClientConn>, send: SendLock) {
    if let Err(e) = serve_updates(&ctx, &conn, &send).await {
        debug!("Client {} writer stopped: {}", conn.id(), e);
    }
    conn.close();
}

/// Answers update requests as soon as they can be served.
///
/// Incremental requests wait for the framebuffer to be modified; full requests are
/// answered immediately.
async fn serve_updates(ctx: &EngineContext, conn: &ClientConn, send: &SendLock) -> Result<()> {
    let mut modified = ctx.framebuffer.subscribe();
    let mut closed = conn.close.subscribe();
    let mut dirty = true;

    loop {
        if *closed.borrow() {
            return Ok(());
        }
        dirty |= modified.has_changed().unwrap_or(false);

        if let Some(request) = conn.take_request_if(|r| !r.incremental || dirty) {
            let _ = modified.borrow_and_update();
            dirty = false;
            send_update(ctx, send, request).await?;
            continue;
        }

        tokio::select! {
            _ = conn.request_ready.notified() => {}
            changed = modified.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                dirty = true;
            }
            _ = closed.changed() => {}
        }
    }
}

async fn send_update(ctx: &EngineContext, send: &SendLock, request: UpdateRequest) -> Result<()> {
    let mut writer = send.lock().await;
    let mut buf = BytesMut::new();
    ctx.framebuffer
        .read(|surface| writer.encode_update(surface, request, &mut buf));
    writer.write(&buf, ctx.max_client_wait).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(incremental: bool, x: u16, y: u16, w: u16, h: u16) -> UpdateRequest {
        UpdateRequest {
            incremental,
            x,
            y,
            w,
            h,
        }
    }

    #[test]
    fn merged_requests_cover_both_rects() {
        let merged = request(true, 10, 10, 5, 5).merge(request(false, 0, 12, 4, 10));
        assert_eq!(merged, request(false, 0, 10, 15, 12));
    }

    #[test]
    fn clipping_keeps_rect_inside_surface() {
        assert_eq!(request(true, 0, 0, 1024, 768).clip(800, 600), (0, 0, 800, 600));
        assert_eq!(request(true, 790, 590, 50, 50).clip(800, 600), (790, 590, 10, 10));
        assert_eq!(request(true, 900, 0, 10, 10).clip(800, 600), (800, 0, 0, 10));
    }
}
