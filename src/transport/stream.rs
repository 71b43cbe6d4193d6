//! TCP stream channel.

use std::time::Duration;

use bytes::{Buf, Bytes};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::channel::{ChannelHandlers, ChannelState, Transport, WireMessage};
use super::connection::Outbound;
use super::driver::{Driver, Link};
use super::options::TransportOptions;
use crate::core::{ErrorKind, Protocol, TransportError, TransportResult, UNIT_BUFFER_SIZE};

/// A framed, encrypted channel over one TCP connection.
///
/// The server drives the encryption handshake right after accept; messages
/// sent before it completes are flushed afterwards.
#[derive(Debug)]
pub struct StreamChannel {
    driver: Driver,
    connect_timeout: f32,
}

impl StreamChannel {
    /// Create a channel to `host:port`.
    pub fn new(host: impl Into<String>, port: u16, options: &TransportOptions) -> Self {
        Self {
            driver: Driver::new(Protocol::Tcp, host, port, None, options.compressor()),
            connect_timeout: options.connect_timeout,
        }
    }
}

impl Transport for StreamChannel {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn set_handlers(&mut self, handlers: ChannelHandlers) {
        self.driver.set_handlers(handlers);
    }

    fn start(&mut self) -> TransportResult<()> {
        let runtime = Driver::runtime()?;
        let (link, rx) = self.driver.begin();
        let host = self.driver.host().to_string();
        let port = self.driver.port();
        let timeout = self.connect_timeout;

        info!(%host, port, "connecting tcp channel");
        let task = runtime.spawn(run(link.clone(), host, port, timeout, rx));
        link.attach(task);
        Ok(())
    }

    fn stop(&mut self) {
        self.driver.stop();
    }

    fn send(&mut self, message: WireMessage) -> TransportResult<()> {
        self.driver.send(message, None)
    }

    fn state(&self) -> ChannelState {
        self.driver.state()
    }

    fn has_unsent(&self) -> bool {
        self.driver.has_unsent()
    }

    fn set_address(&mut self, host: &str, port: u16) {
        self.driver.set_address(host, port);
    }

    fn last_error(&self) -> ErrorKind {
        self.driver.last_error()
    }
}

async fn connect(host: &str, port: u16, timeout: f32) -> TransportResult<TcpStream> {
    let attempt = TcpStream::connect((host, port));
    let stream = if timeout > 0.0 {
        tokio::time::timeout(Duration::from_secs_f32(timeout), attempt)
            .await
            .map_err(|_| TransportError::ConnectTimeout)?
    } else {
        attempt.await
    };
    stream.map_err(|e| TransportError::ConnectFailure(format!("{host}:{port}: {e}")))
}

async fn run(
    link: Link,
    host: String,
    port: u16,
    timeout: f32,
    rx: mpsc::UnboundedReceiver<Outbound>,
) {
    let stream = match connect(&host, port, timeout).await {
        Ok(stream) => stream,
        Err(error) => {
            link.close(error);
            return;
        }
    };
    let _ = stream.set_nodelay(true);
    debug!(%host, port, "tcp connected");

    let (reader, writer) = stream.into_split();
    let write_task = tokio::spawn(write_loop(link.clone(), writer, rx));
    link.attach(write_task);

    if link.with_core(|core| core.on_connected()) {
        read_loop(link, reader).await;
    }
}

async fn read_loop(link: Link, mut reader: OwnedReadHalf) {
    let mut buf = vec![0u8; UNIT_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                link.close(TransportError::PeerClosed);
                return;
            }
            Ok(n) => {
                if !link.with_core(|core| core.on_stream_bytes(&buf[..n])) {
                    return;
                }
            }
            Err(e) => {
                link.close(e.into());
                return;
            }
        }
    }
}

async fn write_loop(
    link: Link,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(out) = rx.recv().await {
        let mut frame = Bytes::from(out.frame());
        // Partial writes keep the remainder at the front of the queue.
        while frame.has_remaining() {
            match writer.write(frame.chunk()).await {
                Ok(0) => {
                    link.close(TransportError::PeerClosed);
                    return;
                }
                Ok(n) => frame.advance(n),
                Err(e) => {
                    link.close(e.into());
                    return;
                }
            }
        }
        link.wrote();
    }
    let _ = writer.shutdown().await;
}
