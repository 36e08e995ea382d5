//! A deterministic **in‑process stand‑in** for the terminal backend.
//!
//! *  **From the test's perspective**
//!    * Hand `Arc::new(backend.clone())` to `RemoteTerminal::with_connector`.
//!    * Steer it with the switches below (`set_pings_answered`, `refuse_opens`,
//!      `kill_link`, ...) and inspect what the client sent via `sent()`.
//!
//! *  **Behaviour**: acknowledges `session_create`, answers `terminal_input`
//!    with a `terminal_output` on the same session (`pwd` yields the home
//!    directory, anything else is echoed) and answers pings with pongs.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use remoterm_core::connections::transport::{
    Connection, Connector, Credentials, Endpoint, Inbound,
};
use remoterm_core::connections::{ConnectionError, ConnectionErrorKind};
use remoterm_core::protocol::{decode, encode, Message};
use tokio::sync::mpsc;

pub const HOME: &str = "/home/dev";

#[derive(Default)]
struct BackendState {
    opens: AtomicUsize,
    open_delay: Mutex<Duration>,
    refuse: Mutex<Option<ConnectionErrorKind>>,
    pings_ignored: AtomicBool,
    creates_ignored: AtomicBool,
    reject_creates: AtomicBool,
    /// `None` on the channel closes the link from the backend side.
    live: Mutex<Option<mpsc::UnboundedSender<Option<Inbound>>>>,
    sent: Mutex<Vec<Message>>,
}

#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<BackendState>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Links opened so far, successful or not.
    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    /// How long the handshake of every following open takes.
    pub fn set_open_delay(&self, delay: Duration) {
        *self.state.open_delay.lock() = delay;
    }

    /// Make every following open fail with `kind`; `None` accepts again.
    pub fn refuse_opens(&self, kind: Option<ConnectionErrorKind>) {
        *self.state.refuse.lock() = kind;
    }

    /// Pings still go out but no pong ever comes back.
    pub fn set_pings_answered(&self, answered: bool) {
        self.state.pings_ignored.store(!answered, Ordering::SeqCst);
    }

    pub fn ignore_creates(&self, ignore: bool) {
        self.state.creates_ignored.store(ignore, Ordering::SeqCst);
    }

    pub fn reject_creates(&self, reject: bool) {
        self.state.reject_creates.store(reject, Ordering::SeqCst);
    }

    /// Close the current link as if the server went away.
    pub fn kill_link(&self) {
        if let Some(tx) = self.state.live.lock().take() {
            let _ = tx.send(None);
        }
    }

    /// Push a raw frame to the client on the current link.
    pub fn inject_raw(&self, frame: Vec<u8>) {
        if let Some(tx) = &*self.state.live.lock() {
            let _ = tx.send(Some(Inbound::Frame(frame)));
        }
    }

    pub fn inject(&self, message: Message) {
        self.inject_raw(encode(&message));
    }

    /// Every decodable frame the client sent, across all links.
    pub fn sent(&self) -> Vec<Message> {
        self.state.sent.lock().clone()
    }

    pub fn sent_of_type(&self, type_name: &str) -> Vec<Message> {
        self.sent()
            .into_iter()
            .filter(|m| m.type_name() == type_name)
            .collect()
    }
}

#[async_trait]
impl Connector for FakeBackend {
    async fn open(
        &self,
        _endpoint: &Endpoint,
        _credentials: &Credentials,
    ) -> Result<Box<dyn Connection>, ConnectionError> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        let delay = *self.state.open_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(kind) = *self.state.refuse.lock() {
            return Err(ConnectionError::new(kind, "fake backend refused the link"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.state.live.lock() = Some(tx.clone());
        Ok(Box::new(FakeLink {
            state: self.state.clone(),
            to_client: tx,
            rx,
        }))
    }
}

struct FakeLink {
    state: Arc<BackendState>,
    to_client: mpsc::UnboundedSender<Option<Inbound>>,
    rx: mpsc::UnboundedReceiver<Option<Inbound>>,
}

impl FakeLink {
    fn reply(&self, message: Message) {
        let _ = self.to_client.send(Some(Inbound::Frame(encode(&message))));
    }
}

#[async_trait]
impl Connection for FakeLink {
    async fn send(&mut self, frame: &[u8]) -> Result<(), ConnectionError> {
        let message = decode(frame).map_err(|e| ConnectionError::protocol(e.to_string()))?;
        self.state.sent.lock().push(message.clone());

        match message {
            Message::SessionCreate { session_id, .. } => {
                if self.state.reject_creates.load(Ordering::SeqCst) {
                    self.reply(Message::Error {
                        session_id,
                        data: "host unreachable".into(),
                    });
                } else if !self.state.creates_ignored.load(Ordering::SeqCst) {
                    self.reply(Message::SessionCreate {
                        session_id,
                        data: None,
                    });
                }
            }
            Message::TerminalInput { session_id, data } => {
                let output = match data.trim() {
                    "pwd" => format!("{HOME}\n"),
                    other => other.to_string(),
                };
                self.reply(Message::TerminalOutput {
                    session_id,
                    data: output,
                });
            }
            _ => {}
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Inbound>, ConnectionError> {
        Ok(self.rx.recv().await.flatten())
    }

    async fn ping(&mut self) -> Result<(), ConnectionError> {
        if !self.state.pings_ignored.load(Ordering::SeqCst) {
            let _ = self.to_client.send(Some(Inbound::Pong));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        Ok(())
    }
}
