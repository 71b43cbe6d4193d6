//! UDP datagram channel.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::channel::{ChannelHandlers, ChannelState, Transport, WireMessage};
use super::connection::Outbound;
use super::driver::{Driver, Link};
use super::options::TransportOptions;
use crate::core::{ErrorKind, Protocol, TransportError, TransportResult, UNIT_BUFFER_SIZE};

/// A channel sending one frame per datagram.
///
/// There is no handshake: the channel is connected as soon as the socket is,
/// using the preset cipher from the options.
#[derive(Debug)]
pub struct DatagramChannel {
    driver: Driver,
}

impl DatagramChannel {
    /// Create a channel to `host:port`.
    pub fn new(host: impl Into<String>, port: u16, options: &TransportOptions) -> Self {
        Self {
            driver: Driver::new(
                Protocol::Udp,
                host,
                port,
                options.encryption,
                options.compressor(),
            ),
        }
    }
}

impl Transport for DatagramChannel {
    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    fn set_handlers(&mut self, handlers: ChannelHandlers) {
        self.driver.set_handlers(handlers);
    }

    fn start(&mut self) -> TransportResult<()> {
        let runtime = Driver::runtime()?;
        let (link, rx) = self.driver.begin();
        let host = self.driver.host().to_string();
        let port = self.driver.port();

        info!(%host, port, "opening udp channel");
        let task = runtime.spawn(run(link.clone(), host, port, rx));
        link.attach(task);
        Ok(())
    }

    fn stop(&mut self) {
        self.driver.stop();
    }

    fn send(&mut self, message: WireMessage) -> TransportResult<()> {
        self.driver.send(message, Some(UNIT_BUFFER_SIZE))
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

async fn open(host: &str, port: u16) -> TransportResult<UdpSocket> {
    let remote: SocketAddr = tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| TransportError::ConnectFailure(format!("{host}: no address")))?;
    let local = if remote.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };

    let socket = UdpSocket::bind(local).await?;
    socket.connect(remote).await?;
    Ok(socket)
}

async fn run(link: Link, host: String, port: u16, rx: mpsc::UnboundedReceiver<Outbound>) {
    let socket = match open(&host, port).await {
        Ok(socket) => Arc::new(socket),
        Err(error) => {
            let error = match error {
                TransportError::Io(e) => TransportError::ConnectFailure(e.to_string()),
                other => other,
            };
            link.close(error);
            return;
        }
    };
    debug!(%host, port, "udp socket connected");

    let write_task = tokio::spawn(write_loop(link.clone(), Arc::clone(&socket), rx));
    link.attach(write_task);

    if !link.with_core(|core| core.on_connected()) {
        return;
    }

    let mut buf = vec![0u8; UNIT_BUFFER_SIZE];
    loop {
        match socket.recv(&mut buf).await {
            Ok(n) => {
                if !link.with_core(|core| core.on_datagram(&buf[..n])) {
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

async fn write_loop(link: Link, socket: Arc<UdpSocket>, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(out) = rx.recv().await {
        if let Err(e) = socket.send(&out.frame()).await {
            link.close(e.into());
            return;
        }
        link.wrote();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::crypto::{CipherType, ife2_transform};
    use crate::transport::frame;

    #[test_log::test(tokio::test)]
    async fn test_datagram_roundtrip_with_preset_cipher() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let started = tx.clone();
        let mut channel = DatagramChannel::new(
            "127.0.0.1",
            port,
            &TransportOptions::default().with_encryption(CipherType::Ife2),
        );
        channel.set_handlers(ChannelHandlers::new(
            move |_| {
                let _ = started.send(None);
            },
            move |_, _, body| {
                let _ = tx.send(Some(body));
            },
            |_, _| {},
        ));
        channel.start().unwrap();
        assert_eq!(rx.recv().await, Some(None));

        channel
            .send(WireMessage::new("echo", b"ping!".to_vec()))
            .unwrap();

        let mut buf = vec![0u8; 2048];
        let (n, peer) = server.recv_from(&mut buf).await.unwrap();
        let decoded = frame::decode(&buf[..n], &mut 0).unwrap().unwrap();
        assert_eq!(decoded.fields.encryption(), Some("3-"));
        let mut body = buf[decoded.body].to_vec();
        ife2_transform(&mut body, false);
        assert_eq!(body, b"ping!");

        let mut reply = b"pong!".to_vec();
        ife2_transform(&mut reply, true);
        server
            .send_to(&frame::encode_with_encryption(Some("3-"), &reply), peer)
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(Some(b"pong!".to_vec())));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!channel.has_unsent());
    }

    #[test_log::test(tokio::test)]
    async fn test_oversized_message_is_rejected() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut channel = DatagramChannel::new("127.0.0.1", port, &TransportOptions::default());
        channel.set_handlers(ChannelHandlers::new(
            move |_| {
                let _ = tx.send(());
            },
            |_, _, _| {},
            |_, _| {},
        ));
        channel.start().unwrap();
        rx.recv().await.unwrap();

        let err = channel
            .send(WireMessage::new("big", vec![b'x'; UNIT_BUFFER_SIZE]))
            .unwrap_err();
        assert!(matches!(err, TransportError::MessageTooLarge { .. }));
        assert_eq!(channel.state(), ChannelState::Connected);
    }
}
