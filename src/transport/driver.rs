//! Task plumbing shared by the channel drivers.
//!
//! Each start of a channel bumps a generation counter. I/O tasks carry the
//! generation they were spawned for in a [`Link`], and everything they
//! report after a stop or restart is dropped.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use super::channel::{ChannelHandlers, ChannelState, WireMessage};
use super::connection::{ChannelCore, CoreEvent, CoreOutput, Outbound};
use crate::core::{ErrorKind, Protocol, TransportError, TransportResult};
use crate::compression::Compressor;
use crate::crypto::CipherType;

/// State guarded by the channel lock.
#[derive(Debug)]
struct Shared {
    core: ChannelCore,
    generation: u64,
    tasks: Vec<JoinHandle<()>>,
    writer: Option<mpsc::UnboundedSender<Outbound>>,
    in_flight: usize,
}

impl Shared {
    fn queue_write(&mut self, out: Outbound) {
        let Some(writer) = &self.writer else {
            return;
        };
        trace!(msg_type = %out.msg_type, size = out.body.len(), "queue write");
        if writer.send(out).is_ok() {
            self.in_flight += 1;
        }
    }

    fn teardown(&mut self) {
        self.generation += 1;
        self.writer = None;
        self.in_flight = 0;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Common half of every channel: address, lock and handlers.
#[derive(Debug)]
pub(crate) struct Driver {
    protocol: Protocol,
    host: String,
    port: u16,
    shared: Arc<Mutex<Shared>>,
    handlers: Arc<ChannelHandlers>,
}

impl Driver {
    pub(crate) fn new(
        protocol: Protocol,
        host: impl Into<String>,
        port: u16,
        preset: Option<CipherType>,
        compressor: Option<Compressor>,
    ) -> Self {
        Self {
            protocol,
            host: host.into(),
            port,
            shared: Arc::new(Mutex::new(Shared {
                core: ChannelCore::new(protocol, preset).with_compressor(compressor),
                generation: 0,
                tasks: Vec::new(),
                writer: None,
                in_flight: 0,
            })),
            handlers: Arc::new(ChannelHandlers::noop()),
        }
    }

    pub(crate) fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub(crate) fn host(&self) -> &str {
        &self.host
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn set_address(&mut self, host: &str, port: u16) {
        self.host = host.to_string();
        self.port = port;
    }

    pub(crate) fn set_handlers(&mut self, handlers: ChannelHandlers) {
        self.handlers = Arc::new(handlers);
    }

    /// Runtime handle to spawn on; errors outside a tokio runtime.
    pub(crate) fn runtime() -> TransportResult<Handle> {
        Handle::try_current()
            .map_err(|e| TransportError::ConnectFailure(format!("no tokio runtime: {e}")))
    }

    /// Begin a new connection generation.
    ///
    /// Returns the link for the new tasks and the receiving end of the write
    /// queue.
    pub(crate) fn begin(&self) -> (Link, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut shared = self.shared.lock();
        shared.teardown();
        shared.core.connect();
        shared.writer = Some(tx);
        let link = Link {
            protocol: self.protocol,
            generation: shared.generation,
            shared: Arc::clone(&self.shared),
            handlers: Arc::clone(&self.handlers),
        };
        (link, rx)
    }

    pub(crate) fn stop(&self) {
        let mut shared = self.shared.lock();
        if shared.core.state() != ChannelState::Disconnected {
            trace!(protocol = %self.protocol, "stopping channel");
        }
        shared.teardown();
        shared.core.close();
    }

    /// Encrypt and queue a message.
    ///
    /// With `limit`, frames larger than it are rejected instead.
    pub(crate) fn send(&self, message: WireMessage, limit: Option<usize>) -> TransportResult<()> {
        let mut shared = self.shared.lock();
        let Some(out) = shared.core.send(message)? else {
            return Ok(());
        };
        if let Some(limit) = limit {
            let size = out.frame().len();
            if size > limit {
                warn!(msg_type = %out.msg_type, size, limit, "message truncated, not sent");
                return Err(TransportError::MessageTooLarge { size, limit });
            }
        }
        shared.queue_write(out);
        Ok(())
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.shared.lock().core.state()
    }

    pub(crate) fn has_unsent(&self) -> bool {
        let shared = self.shared.lock();
        shared.in_flight > 0 || shared.core.pending() > 0
    }

    pub(crate) fn last_error(&self) -> ErrorKind {
        self.shared.lock().core.last_error()
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.shared.lock().teardown();
    }
}

/// A task's handle on its channel for one generation.
#[derive(Clone)]
pub(crate) struct Link {
    protocol: Protocol,
    generation: u64,
    shared: Arc<Mutex<Shared>>,
    handlers: Arc<ChannelHandlers>,
}

impl Link {
    /// Register a task so that stop aborts it.
    pub(crate) fn attach(&self, task: JoinHandle<()>) {
        let mut shared = self.shared.lock();
        if shared.generation == self.generation {
            shared.tasks.push(task);
        } else {
            task.abort();
        }
    }

    /// Run `f` against the core and dispatch what it produced.
    ///
    /// Events produced before a fatal error are delivered first, then the
    /// channel closes. Returns false once this generation is over, telling
    /// the task to exit.
    pub(crate) fn with_core<F, R>(&self, f: F) -> bool
    where
        F: FnOnce(&mut ChannelCore) -> R,
        R: Into<CoreOutput>,
    {
        let (notify, fatal) = {
            let mut shared = self.shared.lock();
            if shared.generation != self.generation {
                return false;
            }
            let CoreOutput { events, error } = f(&mut shared.core).into();
            let mut notify = Vec::new();
            for event in events {
                match event {
                    CoreEvent::Write(out) => shared.queue_write(out),
                    other => notify.push(other),
                }
            }
            let fatal = match error {
                Some(error) if !error.is_fatal() => {
                    warn!(protocol = %self.protocol, %error, "dropped message");
                    None
                }
                Some(error) => {
                    shared.core.fail(&error);
                    shared.teardown();
                    Some(error)
                }
                None => None,
            };
            (notify, fatal)
        };

        for event in notify {
            match event {
                CoreEvent::Started => (self.handlers.on_started)(self.protocol),
                CoreEvent::Received(fields, body) => {
                    (self.handlers.on_received)(self.protocol, fields, body)
                }
                CoreEvent::Write(_) => {}
            }
        }
        match fatal {
            Some(error) => {
                (self.handlers.on_closed)(self.protocol, Some(error));
                false
            }
            None => true,
        }
    }

    /// Fail the channel with `error`.
    pub(crate) fn close(&self, error: TransportError) {
        self.with_core(|_| CoreOutput::failed(error));
    }

    /// A queued write reached the socket.
    pub(crate) fn wrote(&self) {
        let mut shared = self.shared.lock();
        if shared.generation == self.generation {
            shared.in_flight = shared.in_flight.saturating_sub(1);
        }
    }

    /// Whether this generation is still current.
    pub(crate) fn is_current(&self) -> bool {
        self.shared.lock().generation == self.generation
    }
}
