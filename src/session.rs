//! Lifecycle of the single server session.
//!
//! A [`Session`] moves between `Stopped`, `Starting` and `Running`. Only one session may be
//! running per process; a second one fails to start with [`SessionError::AlreadyRunning`].
//!
//! The state lock is held only long enough to read or swap the state. Every operation
//! clones the handles it needs and works outside the lock, so frame updates never wait on
//! a slow client or a dial in progress.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, info};

use crate::bridge::EventBridge;
use crate::config::{ListenPort, SessionConfig};
use crate::error::SessionError;
use crate::runtime;
use crate::vnc::auth::PasswordList;
use crate::vnc::client::ClientInfo;
use crate::vnc::events::{ClientId, EventHooks};
use crate::vnc::framebuffer::{validate_dimensions, Framebuffer, Surface};
use crate::vnc::server::VncServer;

/// Set while any session in the process is starting or running.
static SESSION_GATE: AtomicBool = AtomicBool::new(false);

/// Exclusive claim on the process-wide session gate, released on drop.
struct GateToken(());

impl GateToken {
    fn claim() -> Option<Self> {
        SESSION_GATE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| GateToken(()))
    }
}

impl Drop for GateToken {
    fn drop(&mut self) {
        SESSION_GATE.store(false, Ordering::Release);
    }
}

enum SessionState {
    Stopped,
    Starting,
    Running(Box<Running>),
}

/// Everything a running session owns.
struct Running {
    server: Arc<VncServer>,
    framebuffer: Arc<Framebuffer>,
    desktop_name: Arc<str>,
    passwords: Option<Arc<PasswordList>>,
    listen_addr: Option<SocketAddr>,
    gate: GateToken,
}

impl Running {
    /// Shuts the engine down and releases the session's resources.
    ///
    /// Release order: engine, pixel storage, desktop name, password list. The engine shares
    /// the other three, so it goes first.
    fn teardown(self) {
        let Running {
            server,
            framebuffer,
            desktop_name,
            passwords,
            listen_addr: _,
            gate,
        } = self;

        if let Err(e) = runtime::block_on(server.shutdown()) {
            error!("Failed to run engine shutdown: {}", e);
        }
        drop(server);

        let (width, height) = framebuffer.dimensions();
        drop(framebuffer);
        debug!("Released {}x{} framebuffer", width, height);

        drop(desktop_name);
        if passwords.is_some() {
            drop(passwords);
            debug!("Released password list");
        }

        drop(gate);
    }
}

/// The VNC server session driven by the host.
pub struct Session {
    hooks: Arc<dyn EventHooks>,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(bridge: EventBridge) -> Self {
        Self {
            hooks: Arc::new(bridge),
            state: Mutex::new(SessionState::Stopped),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_running<R>(&self, f: impl FnOnce(&Running) -> R) -> Result<R, SessionError> {
        match &*self.lock() {
            SessionState::Running(running) => Ok(f(running)),
            _ => Err(SessionError::NotRunning),
        }
    }

    /// The engine of the running session.
    pub(crate) fn server(&self) -> Result<Arc<VncServer>, SessionError> {
        self.with_running(|r| r.server.clone())
    }

    /// Starts serving a fresh framebuffer.
    ///
    /// Returns once the listener is bound, or right away with [`ListenPort::Disabled`].
    /// On failure nothing allocated along the way is kept and the session stays stopped.
    pub fn start(&self, config: SessionConfig) -> Result<(), SessionError> {
        let gate = {
            let mut state = self.lock();
            if !matches!(*state, SessionState::Stopped) {
                return Err(SessionError::AlreadyRunning);
            }
            let gate = GateToken::claim().ok_or(SessionError::AlreadyRunning)?;
            *state = SessionState::Starting;
            gate
        };

        let result = self.launch(config, gate);

        let mut state = self.lock();
        match result {
            Ok(running) => {
                *state = SessionState::Running(Box::new(running));
                Ok(())
            }
            Err(e) => {
                *state = SessionState::Stopped;
                error!("Failed to start session: {}", e);
                Err(e)
            }
        }
    }

    fn launch(&self, config: SessionConfig, gate: GateToken) -> Result<Running, SessionError> {
        let (width, height) = config.validate()?;
        runtime::get_or_init_vnc_runtime().map_err(SessionError::Runtime)?;

        let framebuffer = Arc::new(Framebuffer::new(width, height)?);
        let desktop_name: Arc<str> = Arc::from(config.desktop_name);
        let passwords = config
            .password
            .map(|password| Arc::new(PasswordList::single(password)));

        let server = Arc::new(VncServer::new(
            framebuffer.clone(),
            desktop_name.clone(),
            passwords.clone(),
            self.hooks.clone(),
            config.max_client_wait,
        ));

        let mut running = Running {
            server,
            framebuffer,
            desktop_name,
            passwords,
            listen_addr: None,
            gate,
        };

        if let ListenPort::Port(port) = config.port {
            let server = running.server.clone();
            match runtime::block_on(async move { server.listen(port).await }) {
                Ok(Ok(addr)) => running.listen_addr = Some(addr),
                Ok(Err(source)) => {
                    running.teardown();
                    return Err(SessionError::Bind { port, source });
                }
                Err(e) => {
                    running.teardown();
                    return Err(SessionError::Runtime(e));
                }
            }
        }

        info!(
            "Session started: {}x{}, {}, {}",
            width,
            height,
            match running.listen_addr {
                Some(addr) => format!("listening on port {}", addr.port()),
                None => "no listener".to_string(),
            },
            if running.passwords.is_some() {
                "password protected"
            } else {
                "no authentication"
            }
        );
        Ok(running)
    }

    /// Disconnects every client and releases the session's resources.
    ///
    /// Blocks until all client connections and the listener are gone.
    pub fn stop(&self) -> Result<(), SessionError> {
        let running = {
            let mut state = self.lock();
            match std::mem::replace(&mut *state, SessionState::Stopped) {
                SessionState::Running(running) => running,
                other => {
                    *state = other;
                    return Err(SessionError::NotRunning);
                }
            }
        };

        running.teardown();
        info!("Session stopped");
        Ok(())
    }

    /// Replaces the framebuffer with a zeroed one of the new size.
    ///
    /// Every client's send lock is held across the swap, so no update mixes old and new
    /// pixels. The old storage is released after the swap.
    pub fn resize(&self, width: u32, height: u32) -> Result<(), SessionError> {
        let server = self.server()?;
        let (width, height) = validate_dimensions(width, height)?;
        let surface = Surface::allocate(width, height)?;

        let old = runtime::block_on(async move { server.replace_framebuffer(surface).await })
            .map_err(SessionError::Runtime)?;
        info!(
            "Framebuffer resized from {}x{} to {}x{}",
            old.width(),
            old.height(),
            width,
            height
        );
        drop(old);
        Ok(())
    }

    /// Copies a full frame into the framebuffer and schedules it for every client.
    ///
    /// `data` must be exactly `width * height * 4` bytes; otherwise the framebuffer is left
    /// untouched.
    pub fn update_frame(&self, data: &[u8]) -> Result<(), SessionError> {
        let framebuffer = self.with_running(|r| r.framebuffer.clone())?;
        framebuffer.update_from_slice(data)?;
        Ok(())
    }

    /// Current framebuffer dimensions, `None` when not running.
    pub fn frame_size(&self) -> Option<(u16, u16)> {
        self.with_running(|r| r.framebuffer.dimensions()).ok()
    }

    pub fn is_active(&self) -> bool {
        matches!(*self.lock(), SessionState::Running(_))
    }

    /// Address of the listener, `None` when not running or not listening.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.with_running(|r| r.listen_addr).ok().flatten()
    }

    /// Shared handle to the current framebuffer.
    pub fn framebuffer(&self) -> Option<Arc<Framebuffer>> {
        self.with_running(|r| r.framebuffer.clone()).ok()
    }

    /// Sends host clipboard text to every connected client.
    pub fn send_cut_text(&self, text: &str) -> Result<(), SessionError> {
        let server = self.server()?;
        let text = text.to_string();
        runtime::block_on(async move { server.send_cut_text_to_all(text).await })
            .map_err(SessionError::Runtime)
    }

    /// Connected clients ordered by identifier; empty when not running.
    pub fn clients(&self) -> Vec<ClientInfo> {
        self.server().map(|s| s.clients()).unwrap_or_default()
    }

    pub fn client_info(&self, id: ClientId) -> Option<ClientInfo> {
        self.server().ok()?.client_info(id)
    }

    /// Closes one client connection. Returns `false` if no such client is connected.
    pub fn disconnect_client(&self, id: ClientId) -> Result<bool, SessionError> {
        let server = self.server()?;
        let found = server.disconnect(id);
        if found {
            info!("Disconnecting client {}", id);
        }
        Ok(found)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let state = std::mem::replace(
            self.state.get_mut().unwrap_or_else(PoisonError::into_inner),
            SessionState::Stopped,
        );
        if let SessionState::Running(running) = state {
            running.teardown();
            info!("Session stopped on drop");
        }
    }
}
