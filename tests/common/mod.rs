//! Shared helpers for session integration tests: a blocking RFB 3.8 viewer and a
//! recording host.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use droidvnc_ng::vnc::auth::encrypt_challenge;
use droidvnc_ng::{ClientId, EventBridge, HostHandlers, Session};

pub const WAIT: Duration = Duration::from_secs(10);

static SERIAL: Mutex<()> = Mutex::new(());

/// Only one session may run per process, so session tests take turns.
pub fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Pointer { mask: u8, x: u16, y: u16, client: ClientId },
    Key { down: bool, keysym: u32, client: ClientId },
    CutText { text: String, client: ClientId },
    Connected(ClientId),
    Disconnected(ClientId),
}

/// Host handlers that record every call.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<HostEvent>>,
    changed: Condvar,
    /// Pointer events at this x coordinate are recorded, then held for the duration.
    slow_pointer: Option<(u16, Duration)>,
    busy: AtomicBool,
}

impl Recorder {
    /// A recorder whose pointer handler stalls like a busy host at `x`.
    pub fn slow_pointer_at(x: u16, stall: Duration) -> Self {
        Recorder {
            slow_pointer: Some((x, stall)),
            ..Recorder::default()
        }
    }

    /// True while a stalled pointer handler is still running.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    fn push(&self, event: HostEvent) {
        self.events.lock().unwrap().push(event);
        self.changed.notify_all();
    }

    pub fn events(&self) -> Vec<HostEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Waits until `done` holds for the recorded events.
    pub fn wait_until(&self, done: impl Fn(&[HostEvent]) -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        let mut events = self.events.lock().unwrap();
        while !done(&events) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            events = self.changed.wait_timeout(events, deadline - now).unwrap().0;
        }
        true
    }

    pub fn count(&self, wanted: &HostEvent) -> usize {
        self.events().iter().filter(|e| *e == wanted).count()
    }

    pub fn connected(&self) -> Vec<ClientId> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                HostEvent::Connected(id) => Some(id),
                _ => None,
            })
            .collect()
    }
}

impl HostHandlers for Recorder {
    fn on_pointer_event(&self, button_mask: u8, x: u16, y: u16, client: ClientId) {
        let stall = self
            .slow_pointer
            .and_then(|(slow_x, stall)| (slow_x == x).then_some(stall));
        if stall.is_some() {
            self.busy.store(true, Ordering::SeqCst);
        }
        self.push(HostEvent::Pointer {
            mask: button_mask,
            x,
            y,
            client,
        });
        if let Some(stall) = stall {
            std::thread::sleep(stall);
            self.busy.store(false, Ordering::SeqCst);
        }
    }

    fn on_key_event(&self, down: bool, keysym: u32, client: ClientId) {
        self.push(HostEvent::Key { down, keysym, client });
    }

    fn on_cut_text(&self, text: &str, client: ClientId) {
        self.push(HostEvent::CutText {
            text: text.to_string(),
            client,
        });
    }

    fn on_client_connected(&self, client: ClientId) {
        self.push(HostEvent::Connected(client));
    }

    fn on_client_disconnected(&self, client: ClientId) {
        self.push(HostEvent::Disconnected(client));
    }
}

pub fn recording_session() -> (Session, Arc<Recorder>) {
    session_with(Recorder::default())
}

pub fn session_with(recorder: Recorder) -> (Session, Arc<Recorder>) {
    let recorder = Arc::new(recorder);
    let session = Session::new(EventBridge::native(recorder.clone()));
    (session, recorder)
}

/// RGBA test pattern for a `width` x `height` frame.
pub fn pattern(width: usize, height: usize, seed: u8) -> Vec<u8> {
    (0..width * height * 4)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rect {
    pub x: u16,
    pub y: u16,
    pub w: u16,
    pub h: u16,
    pub encoding: i32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Update(Vec<Rect>),
    CutText(Vec<u8>),
}

/// A minimal blocking viewer using the server's native pixel format.
pub struct Viewer {
    stream: TcpStream,
    pub width: u16,
    pub height: u16,
    pub name: String,
}

impl Viewer {
    pub fn connect(addr: SocketAddr, password: Option<&str>) -> Viewer {
        let stream = TcpStream::connect(("127.0.0.1", addr.port())).unwrap();
        Viewer::handshake(stream, password)
    }

    /// Runs the RFB 3.8 handshake on an already-connected socket.
    pub fn handshake(mut stream: TcpStream, password: Option<&str>) -> Viewer {
        stream.set_read_timeout(Some(WAIT)).unwrap();
        stream.set_nodelay(true).unwrap();

        let mut version = [0u8; 12];
        stream.read_exact(&mut version).unwrap();
        assert_eq!(&version, b"RFB 003.008\n");
        stream.write_all(b"RFB 003.008\n").unwrap();

        let mut count = [0u8; 1];
        stream.read_exact(&mut count).unwrap();
        let mut types = vec![0u8; count[0] as usize];
        stream.read_exact(&mut types).unwrap();

        match password {
            Some(password) => {
                assert_eq!(types, vec![2], "server should require VNC auth");
                stream.write_all(&[2]).unwrap();
                let mut challenge = [0u8; 16];
                stream.read_exact(&mut challenge).unwrap();
                stream
                    .write_all(&encrypt_challenge(password, &challenge))
                    .unwrap();
            }
            None => {
                assert_eq!(types, vec![1], "server should not require auth");
                stream.write_all(&[1]).unwrap();
            }
        }
        let mut result = [0u8; 4];
        stream.read_exact(&mut result).unwrap();
        assert_eq!(u32::from_be_bytes(result), 0, "security handshake failed");

        // Shared session.
        stream.write_all(&[1]).unwrap();

        let mut init = [0u8; 24];
        stream.read_exact(&mut init).unwrap();
        let width = u16::from_be_bytes([init[0], init[1]]);
        let height = u16::from_be_bytes([init[2], init[3]]);
        let name_len = u32::from_be_bytes([init[20], init[21], init[22], init[23]]);
        let mut name = vec![0u8; name_len as usize];
        stream.read_exact(&mut name).unwrap();

        Viewer {
            stream,
            width,
            height,
            name: String::from_utf8(name).unwrap(),
        }
    }

    pub fn set_encodings(&mut self, encodings: &[i32]) {
        let mut msg = vec![2, 0];
        msg.extend_from_slice(&(encodings.len() as u16).to_be_bytes());
        for encoding in encodings {
            msg.extend_from_slice(&encoding.to_be_bytes());
        }
        self.stream.write_all(&msg).unwrap();
    }

    pub fn request_update(&mut self, incremental: bool, x: u16, y: u16, w: u16, h: u16) {
        let mut msg = vec![3, incremental as u8];
        for v in [x, y, w, h] {
            msg.extend_from_slice(&v.to_be_bytes());
        }
        self.stream.write_all(&msg).unwrap();
    }

    pub fn request_full_update(&mut self) {
        let (w, h) = (self.width, self.height);
        self.request_update(false, 0, 0, w, h);
    }

    pub fn key(&mut self, down: bool, keysym: u32) {
        let mut msg = vec![4, down as u8, 0, 0];
        msg.extend_from_slice(&keysym.to_be_bytes());
        self.stream.write_all(&msg).unwrap();
    }

    pub fn pointer(&mut self, mask: u8, x: u16, y: u16) {
        let mut msg = vec![5, mask];
        msg.extend_from_slice(&x.to_be_bytes());
        msg.extend_from_slice(&y.to_be_bytes());
        self.stream.write_all(&msg).unwrap();
    }

    /// Sends legacy ClientCutText with raw Latin-1 bytes.
    pub fn cut_text(&mut self, latin1: &[u8]) {
        let mut msg = vec![6, 0, 0, 0];
        msg.extend_from_slice(&(latin1.len() as u32).to_be_bytes());
        msg.extend_from_slice(latin1);
        self.stream.write_all(&msg).unwrap();
    }

    fn read_u16(&mut self) -> u16 {
        let mut buf = [0u8; 2];
        self.stream.read_exact(&mut buf).unwrap();
        u16::from_be_bytes(buf)
    }

    fn read_u32(&mut self) -> u32 {
        let mut buf = [0u8; 4];
        self.stream.read_exact(&mut buf).unwrap();
        u32::from_be_bytes(buf)
    }

    pub fn read_message(&mut self) -> ServerMessage {
        let mut header = [0u8; 1];
        self.stream.read_exact(&mut header).unwrap();
        match header[0] {
            0 => {
                let mut padding = [0u8; 1];
                self.stream.read_exact(&mut padding).unwrap();
                let count = self.read_u16();
                let mut rects = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let x = self.read_u16();
                    let y = self.read_u16();
                    let w = self.read_u16();
                    let h = self.read_u16();
                    let encoding = self.read_u32() as i32;
                    let mut data = Vec::new();
                    if encoding == 0 {
                        data = vec![0u8; w as usize * h as usize * 4];
                        self.stream.read_exact(&mut data).unwrap();
                    }
                    rects.push(Rect {
                        x,
                        y,
                        w,
                        h,
                        encoding,
                        data,
                    });
                }
                ServerMessage::Update(rects)
            }
            3 => {
                let mut padding = [0u8; 3];
                self.stream.read_exact(&mut padding).unwrap();
                let len = self.read_u32() as i32;
                assert!(len >= 0, "viewer did not enable extended clipboard");
                let mut text = vec![0u8; len as usize];
                self.stream.read_exact(&mut text).unwrap();
                ServerMessage::CutText(text)
            }
            other => panic!("unexpected server message type {other}"),
        }
    }

    /// Reads messages until a framebuffer update arrives.
    pub fn read_update(&mut self) -> Vec<Rect> {
        loop {
            if let ServerMessage::Update(rects) = self.read_message() {
                return rects;
            }
        }
    }

    /// True once the server has closed the connection.
    pub fn is_closed(&mut self) -> bool {
        let mut buf = [0u8; 64];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    return false
                }
                Err(_) => return true,
            }
        }
    }

    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}
