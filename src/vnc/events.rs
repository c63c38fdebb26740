//! Callbacks the engine raises for each client, and the types they carry.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot};

/// Stable identifier of a connected client.
///
/// Identifiers start at 1 and are never reused within a process, so `0` can stand for
/// "no client" across the host boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl ClientId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Clipboard payload as it arrived from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClipboardText {
    /// Legacy ClientCutText, ISO 8859-1 encoded.
    Latin1(Vec<u8>),
    /// Extended clipboard text, UTF-8 encoded.
    Utf8(Vec<u8>),
}

impl ClipboardText {
    /// Decodes the payload into a single text representation.
    pub fn into_text(self) -> String {
        match self {
            ClipboardText::Latin1(bytes) => bytes.into_iter().map(char::from).collect(),
            ClipboardText::Utf8(bytes) => String::from_utf8(bytes)
                .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned()),
        }
    }
}

/// Runs once when a client goes away.
pub type DisconnectHook = Box<dyn FnOnce() + Send + 'static>;

/// Engine-wide record of which client owns an in-progress pointer drag.
///
/// The owner is set while a pressed event is handed over and reset right after, so drags
/// from different clients never lock each other out.
#[derive(Debug, Default)]
pub struct PointerLatch {
    owner: Mutex<Option<ClientId>>,
}

impl PointerLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `dispatch` for a pointer event from `client` with the latch taken, then resets it.
    ///
    /// Returns `false` without dispatching if another client owns the pointer. `dispatch`
    /// runs under the latch's lock and must not block.
    pub fn forward(&self, client: ClientId, button_mask: u8, dispatch: impl FnOnce()) -> bool {
        let mut owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*owner, Some(current) if current != client) {
            return false;
        }
        if button_mask != 0 {
            *owner = Some(client);
        }
        dispatch();
        *owner = None;
        true
    }

    pub fn owner(&self) -> Option<ClientId> {
        *self.owner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Receiver of protocol events.
///
/// Each client's events are delivered in arrival order on a blocking thread of its own, so
/// implementations may block. Calls for different clients may arrive concurrently.
pub trait EventHooks: Send + Sync + 'static {
    /// A connection was accepted, before its handshake. The returned hook is run exactly
    /// once when the client goes away, whatever the reason.
    fn client_connected(&self, client: ClientId) -> DisconnectHook;

    fn pointer_event(&self, client: ClientId, button_mask: u8, x: u16, y: u16);

    fn key_event(&self, client: ClientId, down: bool, keysym: u32);

    fn cut_text(&self, client: ClientId, text: ClipboardText);
}

/// An event waiting in a client's dispatch queue.
#[derive(Debug)]
pub(crate) enum ClientEvent {
    Pointer { button_mask: u8, x: u16, y: u16 },
    Key { down: bool, keysym: u32 },
    CutText(ClipboardText),
    /// The client is gone; nothing follows.
    Gone,
}

/// Drains one client's queue into `hooks` until the client is gone.
///
/// Raises the connect hook first and signals `ready` once it returned. The disconnect hook
/// runs last, after every queued event was delivered.
pub(crate) fn dispatch_events(
    hooks: Arc<dyn EventHooks>,
    client: ClientId,
    mut queue: mpsc::UnboundedReceiver<ClientEvent>,
    ready: oneshot::Sender<()>,
) {
    let on_gone = hooks.client_connected(client);
    let _ = ready.send(());

    while let Some(event) = queue.blocking_recv() {
        match event {
            ClientEvent::Pointer { button_mask, x, y } => {
                hooks.pointer_event(client, button_mask, x, y)
            }
            ClientEvent::Key { down, keysym } => hooks.key_event(client, down, keysym),
            ClientEvent::CutText(text) => hooks.cut_text(client, text),
            ClientEvent::Gone => break,
        }
    }
    on_gone();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latin1_decodes_high_bytes() {
        let text = ClipboardText::Latin1(vec![b'c', b'a', b'f', 0xe9]);
        assert_eq!(text.into_text(), "café");
    }

    #[test]
    fn utf8_passes_through() {
        let text = ClipboardText::Utf8("café ☕".as_bytes().to_vec());
        assert_eq!(text.into_text(), "café ☕");
    }

    #[test]
    fn invalid_utf8_is_replaced_not_dropped() {
        let text = ClipboardText::Utf8(vec![b'a', 0xff, b'b']);
        assert_eq!(text.into_text(), "a\u{fffd}b");
    }

    #[test]
    fn latch_is_reset_after_every_forward() {
        let latch = PointerLatch::new();
        let mut delivered = Vec::new();

        assert!(latch.forward(ClientId(1), 1, || delivered.push(1)));
        assert_eq!(latch.owner(), None);
        // Client 1 still holds its button, client 2 presses too.
        assert!(latch.forward(ClientId(2), 1, || delivered.push(2)));
        assert!(latch.forward(ClientId(1), 0, || delivered.push(1)));

        assert_eq!(delivered, vec![1, 2, 1]);
        assert_eq!(latch.owner(), None);
    }

    #[test]
    fn latch_refuses_while_another_client_owns_it() {
        let latch = PointerLatch::new();
        *latch.owner.lock().unwrap() = Some(ClientId(7));

        assert!(!latch.forward(ClientId(8), 1, || panic!("must not dispatch")));
        assert!(latch.forward(ClientId(7), 0, || {}));
        assert_eq!(latch.owner(), None);
    }

    #[derive(Default)]
    struct Journal {
        entries: Mutex<Vec<String>>,
        /// Held by the test to keep pointer hooks waiting.
        gate: Mutex<()>,
    }

    impl Journal {
        fn log(&self, entry: String) {
            self.entries.lock().unwrap().push(entry);
        }

        fn entries(&self) -> Vec<String> {
            self.entries.lock().unwrap().clone()
        }
    }

    struct JournalHooks(Arc<Journal>);

    impl EventHooks for JournalHooks {
        fn client_connected(&self, client: ClientId) -> DisconnectHook {
            self.0.log(format!("connect {client}"));
            let journal = self.0.clone();
            Box::new(move || journal.log(format!("gone {client}")))
        }

        fn pointer_event(&self, client: ClientId, button_mask: u8, x: u16, y: u16) {
            if client == ClientId(1) {
                let _wait = self.0.gate.lock().unwrap();
            }
            self.0.log(format!("pointer {client} {button_mask} {x} {y}"));
        }

        fn key_event(&self, client: ClientId, down: bool, keysym: u32) {
            self.0.log(format!("key {client} {down} {keysym:#x}"));
        }

        fn cut_text(&self, client: ClientId, text: ClipboardText) {
            self.0.log(format!("cut {client} {}", text.into_text()));
        }
    }

    fn spawn_dispatcher(
        journal: &Arc<Journal>,
        client: ClientId,
    ) -> (
        mpsc::UnboundedSender<ClientEvent>,
        oneshot::Receiver<()>,
        std::thread::JoinHandle<()>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready) = oneshot::channel();
        let hooks: Arc<dyn EventHooks> = Arc::new(JournalHooks(journal.clone()));
        let handle = std::thread::spawn(move || dispatch_events(hooks, client, rx, ready_tx));
        (tx, ready, handle)
    }

    #[test]
    fn dispatch_keeps_arrival_order_between_connect_and_gone() {
        let journal = Arc::new(Journal::default());
        let (tx, ready, handle) = spawn_dispatcher(&journal, ClientId(4));

        tx.send(ClientEvent::Key { down: true, keysym: 0x61 }).unwrap();
        tx.send(ClientEvent::Pointer { button_mask: 1, x: 3, y: 4 }).unwrap();
        tx.send(ClientEvent::CutText(ClipboardText::Latin1(b"hi".to_vec()))).unwrap();
        tx.send(ClientEvent::Gone).unwrap();
        handle.join().unwrap();

        assert!(ready.blocking_recv().is_ok());
        assert_eq!(
            journal.entries(),
            vec![
                "connect 4",
                "key 4 true 0x61",
                "pointer 4 1 3 4",
                "cut 4 hi",
                "gone 4",
            ]
        );
    }

    #[test]
    fn blocked_hook_does_not_hold_up_another_client() {
        let journal = Arc::new(Journal::default());
        let held = journal.gate.lock().unwrap();

        let (slow, _, slow_handle) = spawn_dispatcher(&journal, ClientId(1));
        let (fast, _, fast_handle) = spawn_dispatcher(&journal, ClientId(2));

        slow.send(ClientEvent::Pointer { button_mask: 1, x: 10, y: 20 }).unwrap();
        fast.send(ClientEvent::Pointer { button_mask: 1, x: 30, y: 40 }).unwrap();
        fast.send(ClientEvent::Gone).unwrap();
        fast_handle.join().unwrap();

        let entries = journal.entries();
        assert!(entries.contains(&"pointer 2 1 30 40".to_string()));
        assert!(!entries.iter().any(|e| e.starts_with("pointer 1")));

        drop(held);
        slow.send(ClientEvent::Gone).unwrap();
        slow_handle.join().unwrap();
        assert!(journal.entries().contains(&"pointer 1 1 10 20".to_string()));
    }
}
