//! HTTP request/response channel.
//!
//! Every message is POSTed to `/v1/` with its `ENC` value in the
//! `X-iFun-Enc` header and its `C` value in `X-iFun-C`. The response body is
//! handled as one frame.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};

use super::channel::{ChannelHandlers, ChannelState, Transport, WireMessage};
use super::connection::Outbound;
use super::driver::{Driver, Link};
use super::options::TransportOptions;
use crate::core::{
    ErrorKind, HTTP_ENCRYPTION_FIELD, HTTP_PATH, HTTP_UNCOMPRESSED_LENGTH_FIELD, Protocol,
    TransportError, TransportResult,
};

/// A channel that turns each message into one HTTP request.
///
/// Requests are issued one at a time in send order. The channel reports
/// connected as soon as it starts.
#[derive(Debug)]
pub struct HttpChannel {
    driver: Driver,
    use_https: bool,
    request_timeout: f32,
}

impl HttpChannel {
    /// Create a channel to `host:port`.
    pub fn new(host: impl Into<String>, port: u16, options: &TransportOptions) -> Self {
        Self {
            driver: Driver::new(
                Protocol::Http,
                host,
                port,
                options.encryption,
                options.compressor(),
            ),
            use_https: options.use_https,
            request_timeout: options.request_timeout,
        }
    }

    /// The URL requests are posted to.
    pub fn url(&self) -> String {
        let scheme = if self.use_https { "https" } else { "http" };
        format!(
            "{scheme}://{}:{}{HTTP_PATH}",
            self.driver.host(),
            self.driver.port()
        )
    }

    fn client(&self) -> TransportResult<reqwest::Client> {
        let mut builder = reqwest::Client::builder();
        if self.request_timeout > 0.0 {
            builder = builder.timeout(Duration::from_secs_f32(self.request_timeout));
        }
        builder
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))
    }
}

impl Transport for HttpChannel {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    fn set_handlers(&mut self, handlers: ChannelHandlers) {
        self.driver.set_handlers(handlers);
    }

    fn start(&mut self) -> TransportResult<()> {
        let runtime = Driver::runtime()?;
        let client = self.client()?;
        let url = self.url();
        let (link, rx) = self.driver.begin();

        info!(%url, "starting http channel");
        let task = runtime.spawn(request_loop(link.clone(), client, url, rx));
        link.attach(task);
        link.with_core(|core| core.on_connected());
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

/// Headers and body of a successful response.
struct Reply {
    encryption: Option<String>,
    uncompressed_size: Option<String>,
    body: Vec<u8>,
}

async fn post(client: &reqwest::Client, url: &str, out: Outbound) -> TransportResult<Reply> {
    let mut request = client.post(url).body(out.body);
    if let Some(enc) = out.encryption {
        request = request.header(HTTP_ENCRYPTION_FIELD, enc);
    }
    if let Some(size) = out.uncompressed_size {
        request = request.header(HTTP_UNCOMPRESSED_LENGTH_FIELD, size.to_string());
    }

    let response = request
        .send()
        .await
        .map_err(|e| TransportError::Http(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::Http(format!("status {status}")));
    }

    let header = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let encryption = header(HTTP_ENCRYPTION_FIELD);
    let uncompressed_size = header(HTTP_UNCOMPRESSED_LENGTH_FIELD);
    let body = response
        .bytes()
        .await
        .map_err(|e| TransportError::Http(e.to_string()))?;
    Ok(Reply {
        encryption,
        uncompressed_size,
        body: body.to_vec(),
    })
}

async fn request_loop(
    link: Link,
    client: reqwest::Client,
    url: String,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(out) = rx.recv().await {
        debug!(msg_type = %out.msg_type, "http request");
        match post(&client, &url, out).await {
            Ok(reply) => {
                link.wrote();
                let Reply {
                    encryption,
                    uncompressed_size,
                    body,
                } = reply;
                let delivered = link.with_core(|core| {
                    core.on_http_response(encryption.as_deref(), uncompressed_size.as_deref(), body)
                });
                if !delivered {
                    return;
                }
            }
            Err(error) => {
                link.close(error);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::compression::Compressor;
    use crate::core::CompressionType;
    use crate::crypto::CipherType;

    /// Read one request; returns its headers (lowercased) and body.
    async fn read_request(stream: &mut TcpStream) -> (String, Vec<u8>) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        let head_end = loop {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0);
            buf.extend_from_slice(&chunk[..n]);
            if let Some(at) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break at + 4;
            }
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_lowercase();
        let length: usize = head
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .map(|v| v.trim().parse().unwrap())
            .unwrap_or(0);
        while buf.len() < head_end + length {
            let n = stream.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
        }
        (head, buf[head_end..head_end + length].to_vec())
    }

    #[test_log::test(tokio::test)]
    async fn test_post_and_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (head, body) = read_request(&mut stream).await;
            assert!(head.starts_with("post /v1/ "));
            assert!(head.contains("x-ifun-enc: 1-"));

            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nX-iFun-Enc: 1-\r\nConnection: close\r\n\r\n",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.write_all(&body).await.unwrap();
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let options = TransportOptions::default().with_encryption(CipherType::Dummy);
        let mut channel = HttpChannel::new("127.0.0.1", port, &options);
        assert_eq!(channel.url(), format!("http://127.0.0.1:{port}/v1/"));

        channel.set_handlers(ChannelHandlers::new(
            |_| {},
            move |_, fields, body| {
                let _ = tx.send((fields.get("LEN").map(str::to_string), body));
            },
            |_, _| {},
        ));
        channel.start().unwrap();
        assert_eq!(channel.state(), ChannelState::Connected);

        channel
            .send(WireMessage::new("echo", b"{\"n\":1}".to_vec()))
            .unwrap();
        let (len, body) = rx.recv().await.unwrap();
        assert_eq!(len.as_deref(), Some("7"));
        assert_eq!(body, b"{\"n\":1}");
    }

    #[test_log::test(tokio::test)]
    async fn test_compressed_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let message = format!("{{\"text\":\"{}\"}}", "la".repeat(200)).into_bytes();
        let expected = message.clone();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (head, body) = read_request(&mut stream).await;
            let size = expected.len();
            assert!(head.contains(&format!("x-ifun-c: {size}")));
            let codec = Compressor::new(CompressionType::Deflate).unwrap();
            assert_eq!(codec.decompress(&body, size).unwrap(), expected);

            // Echo the compressed body back.
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nX-iFun-C: {size}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.write_all(&body).await.unwrap();
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let options = TransportOptions::default().with_compression(CompressionType::Deflate, 128);
        let mut channel = HttpChannel::new("127.0.0.1", port, &options);
        channel.set_handlers(ChannelHandlers::new(
            |_| {},
            move |_, _, body| {
                let _ = tx.send(body);
            },
            |_, _| {},
        ));
        channel.start().unwrap();
        channel.send(WireMessage::new("echo", message.clone())).unwrap();
        assert_eq!(rx.recv().await.unwrap(), message);
    }

    #[test_log::test(tokio::test)]
    async fn test_error_status_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_request(&mut stream).await;
            stream
                .write_all(b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut channel = HttpChannel::new("127.0.0.1", port, &TransportOptions::default());
        channel.set_handlers(ChannelHandlers::new(
            |_| {},
            |_, _, _| {},
            move |_, err| {
                let _ = tx.send(err.map(|e| e.kind()));
            },
        ));
        channel.start().unwrap();
        channel.send(WireMessage::new("echo", b"{}".to_vec())).unwrap();

        assert_eq!(rx.recv().await, Some(Some(ErrorKind::ConnectFailure)));
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }
}
