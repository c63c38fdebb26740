//! Session configuration as handed over by the host.

use std::time::Duration;

use crate::error::SessionError;
use crate::vnc::framebuffer::validate_dimensions;

/// Default port for inbound viewer connections.
pub const DEFAULT_PORT: u16 = 5900;

/// Default port a listening viewer waits on for reverse connections.
pub const DEFAULT_REVERSE_PORT: u16 = 5500;

/// Default port of an UltraVNC-style repeater.
pub const DEFAULT_REPEATER_PORT: u16 = 5500;

/// Default bound on handshakes and outbound dials.
pub const DEFAULT_MAX_CLIENT_WAIT: Duration = Duration::from_secs(20);

/// Where the session listens for viewers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenPort {
    /// Only reverse and repeater connections are served.
    Disabled,
    /// Listen on this TCP port; `0` picks an ephemeral one.
    Port(u16),
}

impl ListenPort {
    /// Maps the host's raw port value, where any negative number means "no listener".
    pub fn from_raw(port: i32) -> Result<Self, SessionError> {
        if port < 0 {
            return Ok(ListenPort::Disabled);
        }
        u16::try_from(port)
            .map(ListenPort::Port)
            .map_err(|_| SessionError::InvalidConfig {
                reason: format!("port {port} out of range"),
            })
    }
}

impl Default for ListenPort {
    fn default() -> Self {
        ListenPort::Port(DEFAULT_PORT)
    }
}

/// Everything `Session::start` needs.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub width: u32,
    pub height: u32,
    pub port: ListenPort,
    pub desktop_name: String,
    /// `None` disables authentication.
    pub password: Option<String>,
    pub max_client_wait: Duration,
}

impl SessionConfig {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            port: ListenPort::default(),
            desktop_name: "Android".to_string(),
            password: None,
            max_client_wait: DEFAULT_MAX_CLIENT_WAIT,
        }
    }

    pub fn with_port(mut self, port: ListenPort) -> Self {
        self.port = port;
        self
    }

    pub fn with_desktop_name(mut self, name: impl Into<String>) -> Self {
        self.desktop_name = name.into();
        self
    }

    /// Sets the password. An empty string means no authentication, not a blank password.
    pub fn with_password(mut self, password: Option<impl Into<String>>) -> Self {
        self.password = password.map(Into::into).filter(|p| !p.is_empty());
        self
    }

    pub fn with_max_client_wait(mut self, wait: Duration) -> Self {
        self.max_client_wait = wait;
        self
    }

    /// Checks the configuration before anything is allocated.
    ///
    /// Returns the framebuffer dimensions narrowed to what the engine stores.
    pub fn validate(&self) -> Result<(u16, u16), SessionError> {
        let dimensions = validate_dimensions(self.width, self.height)?;
        if self.desktop_name.contains('\0') {
            return Err(SessionError::InvalidConfig {
                reason: "desktop name contains a NUL byte".into(),
            });
        }
        if self.max_client_wait.is_zero() {
            return Err(SessionError::InvalidConfig {
                reason: "max client wait must be positive".into(),
            });
        }
        Ok(dimensions)
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("port", &self.port)
            .field("desktop_name", &self.desktop_name)
            .field("password", &self.password.as_ref().map(|_| "<set>"))
            .field("max_client_wait", &self.max_client_wait)
            .finish()
    }
}
