//! The protocol engine: listener, client registry, and the operations the session drives.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::error::EstablishError;

use super::auth::PasswordList;
use super::client::{self, ClientInfo, ClientRegistry, HeldClient};
use super::events::{ClientId, EventHooks, PointerLatch};
use super::framebuffer::{Framebuffer, Surface};

/// State shared by the engine and every client task.
pub(crate) struct EngineContext {
    pub(crate) framebuffer: Arc<Framebuffer>,
    pub(crate) desktop_name: Arc<str>,
    pub(crate) passwords: Option<Arc<PasswordList>>,
    pub(crate) hooks: Arc<dyn EventHooks>,
    pub(crate) latch: PointerLatch,
    pub(crate) registry: Arc<ClientRegistry>,
    pub(crate) max_client_wait: Duration,
    clipboard: Mutex<Option<String>>,
    closing: watch::Sender<bool>,
    tasks: Mutex<JoinSet<()>>,
}

impl EngineContext {
    pub(crate) fn closing(&self) -> watch::Receiver<bool> {
        self.closing.subscribe()
    }

    pub(crate) fn clipboard_text(&self) -> Option<String> {
        self.clipboard
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock_tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Locks the task set for spawning, `None` once the engine is closing.
    ///
    /// Closing is only ever set under this lock, so anything spawned through the returned
    /// guard is awaited by [`VncServer::shutdown`]. Tasks that already finished are reaped.
    pub(crate) fn open_tasks(&self) -> Option<MutexGuard<'_, JoinSet<()>>> {
        let mut tasks = self.lock_tasks();
        if *self.closing.borrow() {
            return None;
        }
        while let Some(finished) = tasks.try_join_next() {
            if let Err(e) = finished {
                if e.is_panic() {
                    warn!("Client task panicked: {}", e);
                }
            }
        }
        Some(tasks)
    }

    /// Starts protocol handling for a held client on the engine's task set.
    fn spawn_client(self: &Arc<Self>, held: HeldClient) -> Result<ClientId, EstablishError> {
        let id = held.id();
        let Some(mut tasks) = self.open_tasks() else {
            debug!("Engine shutting down, dropping client {}", id);
            return Err(EstablishError::ShuttingDown);
        };
        tasks.spawn(client::run_client(Arc::clone(self), held));
        Ok(id)
    }
}

/// A running RFB server bound to one framebuffer.
pub struct VncServer {
    ctx: Arc<EngineContext>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl VncServer {
    pub fn new(
        framebuffer: Arc<Framebuffer>,
        desktop_name: Arc<str>,
        passwords: Option<Arc<PasswordList>>,
        hooks: Arc<dyn EventHooks>,
        max_client_wait: Duration,
    ) -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            ctx: Arc::new(EngineContext {
                framebuffer,
                desktop_name,
                passwords,
                hooks,
                latch: PointerLatch::new(),
                registry: Arc::new(ClientRegistry::default()),
                max_client_wait,
                clipboard: Mutex::new(None),
                closing,
                tasks: Mutex::new(JoinSet::new()),
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn framebuffer(&self) -> &Arc<Framebuffer> {
        &self.ctx.framebuffer
    }

    pub fn max_client_wait(&self) -> Duration {
        self.ctx.max_client_wait
    }

    /// Binds the listener and spawns the accept loop, returning once it is listening.
    ///
    /// IPv4 is required; an IPv6 listener on the same port is added when the system
    /// allows it.
    pub async fn listen(&self, port: u16) -> std::io::Result<SocketAddr> {
        let v4 = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        let addr = v4.local_addr()?;
        let mut handles = vec![self.spawn_accept_loop(v4)];

        match TcpListener::bind((Ipv6Addr::UNSPECIFIED, addr.port())).await {
            Ok(v6) => handles.push(self.spawn_accept_loop(v6)),
            Err(e) => info!("No separate IPv6 listener on port {}: {}", addr.port(), e),
        }

        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);
        info!("VNC server listening on port {}", addr.port());
        Ok(addr)
    }

    fn spawn_accept_loop(&self, listener: TcpListener) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let mut closing = ctx.closing();
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let _ = stream.set_nodelay(true);
                            info!("Accepted connection from {}", peer);
                            let started = client::hold(&ctx, stream, peer.ip().to_string(), None, None)
                                .and_then(|held| ctx.spawn_client(held));
                            if let Err(e) = started {
                                debug!("Connection from {} not served: {}", peer, e);
                            }
                        }
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    },
                    _ = client::wait_closed(&mut closing) => break,
                }
            }
            debug!("Accept loop exiting");
        })
    }

    /// Opens a TCP connection, bounded by the client wait timeout.
    pub async fn dial(&self, host: &str, port: u16) -> Result<TcpStream, EstablishError> {
        let wait = self.ctx.max_client_wait;
        match tokio::time::timeout(wait, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(source)) => Err(EstablishError::Dial {
                host: host.to_string(),
                port,
                source,
            }),
            Err(_) => Err(EstablishError::Timeout {
                host: host.to_string(),
                port,
                ms: wait.as_millis(),
            }),
        }
    }

    /// Registers an already-connected socket as a client without starting it.
    pub fn hold(
        &self,
        stream: TcpStream,
        host: String,
        destination_port: Option<u16>,
        repeater_id: Option<String>,
    ) -> Result<HeldClient, EstablishError> {
        client::hold(&self.ctx, stream, host, destination_port, repeater_id)
    }

    /// Releases a held client into normal protocol handling.
    ///
    /// Fails with [`EstablishError::ShuttingDown`] once shutdown has begun; the client is
    /// then dropped and reported as disconnected.
    pub fn start(&self, held: HeldClient) -> Result<ClientId, EstablishError> {
        self.ctx.spawn_client(held)
    }

    /// Dials a listening viewer and serves it like any accepted client.
    pub async fn connect_reverse(&self, host: &str, port: u16) -> Result<ClientId, EstablishError> {
        let stream = self.dial(host, port).await?;
        let held = self.hold(stream, host.to_string(), Some(port), None)?;
        self.start(held)
    }

    /// Swaps in a new surface while every client's send lock is held.
    ///
    /// Returns the previous surface so the caller can free it after the swap.
    pub async fn replace_framebuffer(&self, surface: Surface) -> Surface {
        let locks: Vec<_> = self
            .ctx
            .registry
            .snapshot()
            .iter()
            .filter_map(|conn| conn.send_lock())
            .collect();

        let mut guards = Vec::with_capacity(locks.len());
        for lock in &locks {
            guards.push(lock.lock().await);
        }
        debug!("Holding {} client send locks for framebuffer swap", guards.len());

        let old = self.ctx.framebuffer.replace(surface);
        drop(guards);
        old
    }

    /// Stores `text` as the server clipboard and offers it to every client.
    pub async fn send_cut_text_to_all(&self, text: String) {
        *self
            .ctx
            .clipboard
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(text.clone());

        for conn in self.ctx.registry.snapshot() {
            if let Err(e) = conn.send_cut_text(&text, self.ctx.max_client_wait).await {
                warn!("Failed to send cut text to client {}: {}", conn.id(), e);
                conn.close();
            }
        }
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        self.ctx
            .registry
            .snapshot()
            .iter()
            .map(|conn| conn.info().clone())
            .collect()
    }

    pub fn client_info(&self, id: ClientId) -> Option<ClientInfo> {
        self.ctx.registry.get(id).map(|conn| conn.info().clone())
    }

    /// Closes one client. Returns false if no such client is connected.
    pub fn disconnect(&self, id: ClientId) -> bool {
        match self.ctx.registry.get(id) {
            Some(conn) => {
                conn.close();
                true
            }
            None => false,
        }
    }

    /// Stops accepting, disconnects every client and waits for all tasks to finish,
    /// including every pending disconnect hook.
    pub async fn shutdown(&self) {
        {
            let _tasks = self.ctx.lock_tasks();
            self.ctx.closing.send_replace(true);
        }
        for conn in self.ctx.registry.snapshot() {
            conn.close();
        }

        let listeners = std::mem::take(&mut *self.listeners.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in listeners {
            let _ = handle.await;
        }

        let mut tasks = std::mem::take(&mut *self.ctx.lock_tasks());
        while let Some(finished) = tasks.join_next().await {
            if let Err(e) = finished {
                if e.is_panic() {
                    warn!("Client task panicked: {}", e);
                }
            }
        }
        info!("VNC server shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use super::*;
    use crate::vnc::events::{ClipboardText, DisconnectHook};

    #[derive(Default)]
    struct Tally {
        connected: AtomicUsize,
        gone: Arc<AtomicUsize>,
    }

    impl EventHooks for Tally {
        fn client_connected(&self, _: ClientId) -> DisconnectHook {
            self.connected.fetch_add(1, Ordering::SeqCst);
            let gone = self.gone.clone();
            Box::new(move || {
                gone.fetch_add(1, Ordering::SeqCst);
            })
        }
        fn pointer_event(&self, _: ClientId, _: u8, _: u16, _: u16) {}
        fn key_event(&self, _: ClientId, _: bool, _: u32) {}
        fn cut_text(&self, _: ClientId, _: ClipboardText) {}
    }

    fn server() -> (VncServer, Arc<Tally>) {
        let tally = Arc::new(Tally::default());
        let framebuffer = Arc::new(Framebuffer::new(4, 4).unwrap());
        let server = VncServer::new(
            framebuffer,
            Arc::from("test"),
            None,
            tally.clone(),
            Duration::from_secs(5),
        );
        (server, tally)
    }

    /// A connected socket pair: the server's end and the viewer's end.
    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (viewer, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (accepted.unwrap().0, viewer.unwrap())
    }

    async fn eventually(what: &str, done: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn clients_cannot_be_added_once_closing() {
        let (server, tally) = server();
        let (stream, _viewer) = socket_pair().await;
        let held = server.hold(stream, "viewer".into(), None, None).unwrap();

        // Closing begins between hold and start, as when Stop races a reverse connection.
        {
            let _tasks = server.ctx.lock_tasks();
            server.ctx.closing.send_replace(true);
        }
        assert!(matches!(server.start(held), Err(EstablishError::ShuttingDown)));

        let (stream, _other) = socket_pair().await;
        assert!(matches!(
            server.hold(stream, "viewer".into(), None, None),
            Err(EstablishError::ShuttingDown)
        ));

        server.shutdown().await;
        assert_eq!(tally.connected.load(Ordering::SeqCst), 1);
        assert_eq!(tally.gone.load(Ordering::SeqCst), 1);
        assert!(server.clients().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_waits_for_every_disconnect() {
        let (server, tally) = server();
        let mut viewers = Vec::new();
        for _ in 0..3 {
            let (stream, viewer) = socket_pair().await;
            let held = server.hold(stream, "viewer".into(), None, None).unwrap();
            server.start(held).unwrap();
            viewers.push(viewer);
        }

        server.shutdown().await;
        assert_eq!(tally.gone.load(Ordering::SeqCst), 3);
        assert!(server.ctx.lock_tasks().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn finished_client_tasks_are_reaped() {
        let (server, tally) = server();
        for _ in 0..3 {
            let (stream, viewer) = socket_pair().await;
            let held = server.hold(stream, "viewer".into(), None, None).unwrap();
            server.start(held).unwrap();
            // The handshake fails at once and the client task ends.
            drop(viewer);
        }
        eventually("disconnects", || tally.gone.load(Ordering::SeqCst) == 3).await;

        // Dispatchers return right after the disconnect hook.
        eventually("reaping", || {
            server.ctx.open_tasks().map_or(false, |tasks| tasks.is_empty())
        })
        .await;

        server.shutdown().await;
    }
}
