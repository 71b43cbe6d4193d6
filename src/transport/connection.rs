//! Connection state machine shared by every channel driver.
//!
//! [`ChannelCore`] performs no I/O. Drivers feed it received bytes and
//! outgoing messages, and act on the [`CoreEvent`]s it returns:
//!
//! ```text
//! Disconnected --connect()--> Connecting --on_connected()--> EncryptionHandshaking
//!                                                 |                   |
//!                                       (no handshake)        all ciphers established
//!                                                 v                   v
//!                                              Connected <------------+
//! ```

use std::collections::VecDeque;

use tracing::{debug, trace, warn};

use super::buffer::ReceiveBuffer;
use super::channel::{ChannelState, WireMessage};
use super::frame::{self, FrameDecoder, HeaderFields};
use crate::compression::Compressor;
use crate::core::{
    CompressionError, ENCRYPTION_FIELD, ErrorKind, LENGTH_FIELD, PROTOCOL_VERSION, Protocol,
    TransportError, TransportResult, UNCOMPRESSED_LENGTH_FIELD, VERSION_FIELD,
};
use crate::crypto::{CipherType, EncryptionNegotiator};

/// An encrypted body ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    /// Message type, for logging.
    pub msg_type: String,
    /// Encrypted body.
    pub body: Vec<u8>,
    /// `ENC` header value.
    pub encryption: Option<String>,
    /// `C` header value: the body length before compression.
    pub uncompressed_size: Option<usize>,
}

impl Outbound {
    fn control(encryption: String) -> Self {
        Self {
            msg_type: String::new(),
            body: Vec::new(),
            encryption: Some(encryption),
            uncompressed_size: None,
        }
    }

    /// Frame the body with its headers.
    pub fn frame(&self) -> Vec<u8> {
        let mut fields = HeaderFields::new();
        if let Some(enc) = &self.encryption {
            fields.insert(ENCRYPTION_FIELD, enc.as_str());
        }
        if let Some(size) = self.uncompressed_size {
            fields.insert(UNCOMPRESSED_LENGTH_FIELD, size.to_string());
        }
        frame::encode(&fields, &self.body)
    }
}

/// Something the driver must act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    /// Write these bytes to the peer.
    Write(Outbound),
    /// The channel became connected.
    Started,
    /// A decrypted payload arrived.
    Received(HeaderFields, Vec<u8>),
}

/// What one batch of input produced.
///
/// Events decoded before a failure are kept, so the driver can deliver them
/// before it reports `error`.
#[derive(Debug, Default)]
pub struct CoreOutput {
    /// Events in the order they were produced.
    pub events: Vec<CoreEvent>,
    /// The error that stopped processing, after the last event.
    pub error: Option<TransportError>,
}

impl CoreOutput {
    /// Output carrying only a failure.
    pub fn failed(error: TransportError) -> Self {
        Self {
            events: Vec::new(),
            error: Some(error),
        }
    }
}

impl From<TransportResult<Vec<CoreEvent>>> for CoreOutput {
    fn from(result: TransportResult<Vec<CoreEvent>>) -> Self {
        match result {
            Ok(events) => Self {
                events,
                error: None,
            },
            Err(error) => Self::failed(error),
        }
    }
}

/// Transport-independent channel state.
#[derive(Debug)]
pub struct ChannelCore {
    protocol: Protocol,
    state: ChannelState,
    handshake: bool,
    preset: Option<CipherType>,
    negotiator: EncryptionNegotiator,
    decoder: FrameDecoder,
    buffer: ReceiveBuffer,
    pending: VecDeque<WireMessage>,
    compressor: Option<Compressor>,
    last_error: ErrorKind,
}

impl ChannelCore {
    /// Create a core for `protocol`.
    ///
    /// Stream channels wait for the server's encryption handshake; the
    /// others use `preset` directly.
    pub fn new(protocol: Protocol, preset: Option<CipherType>) -> Self {
        Self {
            protocol,
            state: ChannelState::Disconnected,
            handshake: protocol == Protocol::Tcp,
            preset,
            negotiator: EncryptionNegotiator::new(),
            decoder: FrameDecoder::new(),
            buffer: ReceiveBuffer::new(),
            pending: VecDeque::new(),
            compressor: None,
            last_error: ErrorKind::None,
        }
    }

    /// Compress outgoing bodies and accept compressed ones.
    pub fn with_compressor(mut self, compressor: Option<Compressor>) -> Self {
        self.compressor = compressor;
        self
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Classification of the most recent failure.
    pub fn last_error(&self) -> ErrorKind {
        self.last_error
    }

    /// Messages waiting for the channel to connect.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// The negotiated default cipher.
    pub fn default_cipher(&self) -> Option<CipherType> {
        self.negotiator.default_cipher()
    }

    /// Enter `Connecting`, discarding state of any previous connection.
    pub fn connect(&mut self) {
        self.reset_io();
        self.last_error = ErrorKind::None;
        self.state = ChannelState::Connecting;
    }

    /// The underlying socket is up.
    pub fn on_connected(&mut self) -> TransportResult<Vec<CoreEvent>> {
        if self.handshake {
            debug!(protocol = %self.protocol, "waiting for encryption handshake");
            self.state = ChannelState::EncryptionHandshaking;
            return Ok(Vec::new());
        }
        self.negotiator = EncryptionNegotiator::preset(self.preset)?;
        self.established()
    }

    /// Queue or encrypt an outgoing message.
    ///
    /// Returns the encrypted message when it can be written now.
    pub fn send(&mut self, message: WireMessage) -> TransportResult<Option<Outbound>> {
        match self.state {
            ChannelState::Connected => self.seal(message).map(Some),
            ChannelState::Connecting | ChannelState::EncryptionHandshaking => {
                trace!(msg_type = %message.msg_type, "queued until connected");
                self.pending.push_back(message);
                Ok(None)
            }
            ChannelState::Disconnected => Err(TransportError::NotConnected),
        }
    }

    /// Feed bytes read from a stream.
    ///
    /// A message that fails on its own is skipped; a fatal error stops the
    /// batch and is returned together with everything decoded before it.
    pub fn on_stream_bytes(&mut self, bytes: &[u8]) -> CoreOutput {
        self.buffer.extend_from_slice(bytes);
        let mut output = CoreOutput::default();
        loop {
            let (decoded, body) = match self.buffer.decode_next(&mut self.decoder) {
                Ok(Some(next)) => next,
                Ok(None) => break,
                Err(error) => {
                    output.error = Some(error.into());
                    break;
                }
            };
            match self.on_frame(decoded.fields, body, &mut output.events) {
                Ok(()) => {}
                Err(error) if !error.is_fatal() => {
                    warn!(protocol = %self.protocol, %error, "dropped message");
                }
                Err(error) => {
                    output.error = Some(error);
                    break;
                }
            }
        }
        output
    }

    /// Feed one datagram. Each datagram carries exactly one frame.
    pub fn on_datagram(&mut self, packet: &[u8]) -> TransportResult<Vec<CoreEvent>> {
        let mut events = Vec::new();
        let mut cursor = 0;
        match frame::decode(packet, &mut cursor)? {
            Some(decoded) => {
                if cursor < packet.len() {
                    warn!(extra = packet.len() - cursor, "trailing bytes after datagram frame");
                }
                let body = packet[decoded.body].to_vec();
                self.on_frame(decoded.fields, body, &mut events)?;
            }
            None => warn!(size = packet.len(), "dropping truncated datagram"),
        }
        Ok(events)
    }

    /// Feed an HTTP response; the `ENC` and `C` values come from response
    /// headers.
    pub fn on_http_response(
        &mut self,
        encryption: Option<&str>,
        uncompressed_size: Option<&str>,
        body: Vec<u8>,
    ) -> TransportResult<Vec<CoreEvent>> {
        let mut fields = HeaderFields::new();
        fields.insert(VERSION_FIELD, PROTOCOL_VERSION.to_string());
        fields.insert(LENGTH_FIELD, body.len().to_string());
        if let Some(enc) = encryption {
            fields.insert(ENCRYPTION_FIELD, enc);
        }
        if let Some(size) = uncompressed_size {
            fields.insert(UNCOMPRESSED_LENGTH_FIELD, size);
        }
        let mut events = Vec::new();
        self.on_frame(fields, body, &mut events)?;
        Ok(events)
    }

    /// Record a failure and drop the connection.
    pub fn fail(&mut self, error: &TransportError) {
        warn!(protocol = %self.protocol, %error, "channel failed");
        self.last_error = error.kind();
        self.close();
    }

    /// Drop the connection and anything queued.
    pub fn close(&mut self) {
        self.reset_io();
        self.state = ChannelState::Disconnected;
    }

    fn reset_io(&mut self) {
        self.negotiator.reset();
        self.decoder.reset();
        self.buffer.clear();
        self.pending.clear();
    }

    /// Compress, then encrypt.
    fn seal(&mut self, message: WireMessage) -> TransportResult<Outbound> {
        let WireMessage {
            msg_type,
            body,
            encryption,
        } = message;

        let packed = match &self.compressor {
            Some(compressor) => compressor.compress(&body)?,
            None => None,
        };
        let (body, uncompressed_size) = match packed {
            Some(packed) => {
                trace!(%msg_type, from = body.len(), to = packed.len(), "compressed");
                (packed, Some(body.len()))
            }
            None => (body, None),
        };

        let (body, encryption) = self.negotiator.encrypt(encryption, body)?;
        Ok(Outbound {
            msg_type,
            body,
            encryption,
            uncompressed_size,
        })
    }

    /// Undo compression announced by the `C` header.
    fn inflate(&self, fields: &HeaderFields, body: Vec<u8>) -> TransportResult<Vec<u8>> {
        let Some(size) = fields.get(UNCOMPRESSED_LENGTH_FIELD) else {
            return Ok(body);
        };
        let expected: usize = size
            .trim()
            .parse()
            .map_err(|_| CompressionError::InvalidLength(size.to_string()))?;
        if expected == 0 {
            return Ok(body);
        }
        let compressor = self
            .compressor
            .as_ref()
            .ok_or(CompressionError::NotConfigured)?;
        Ok(compressor.decompress(&body, expected)?)
    }

    fn established(&mut self) -> TransportResult<Vec<CoreEvent>> {
        self.state = ChannelState::Connected;
        debug!(protocol = %self.protocol, "channel connected");

        let mut events = vec![CoreEvent::Started];
        while let Some(message) = self.pending.pop_front() {
            events.push(CoreEvent::Write(self.seal(message)?));
        }
        Ok(events)
    }

    fn on_frame(
        &mut self,
        fields: HeaderFields,
        body: Vec<u8>,
        events: &mut Vec<CoreEvent>,
    ) -> TransportResult<()> {
        if self.state == ChannelState::EncryptionHandshaking {
            if !body.is_empty() {
                return Err(TransportError::UnexpectedPayload);
            }
            let step = self.negotiator.on_handshake_frame(fields.encryption())?;
            for reply in step.replies {
                events.push(CoreEvent::Write(Outbound::control(reply)));
            }
            if step.complete {
                events.extend(self.established()?);
            }
            return Ok(());
        }

        if body.is_empty() {
            trace!(protocol = %self.protocol, "ignoring empty frame");
            return Ok(());
        }
        if self.state != ChannelState::Connected {
            return Err(TransportError::UnexpectedPayload);
        }

        let body = self.negotiator.decrypt(fields.encryption(), body)?;
        let body = self.inflate(&fields, body)?;
        events.push(CoreEvent::Received(fields, body));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CompressionType, EncryptionError};
    use crate::crypto::{Ife1Cipher, ife2_transform};

    fn chat(len: usize) -> Vec<u8> {
        format!("{{\"_msgtype\":\"chat\",\"text\":\"{}\"}}", "ha".repeat(len / 2)).into_bytes()
    }

    fn control(enc: &str) -> Vec<u8> {
        frame::encode_with_encryption(Some(enc), b"")
    }

    fn feed(core: &mut ChannelCore, bytes: &[u8]) -> TransportResult<Vec<CoreEvent>> {
        let output = core.on_stream_bytes(bytes);
        match output.error {
            Some(error) => Err(error),
            None => Ok(output.events),
        }
    }

    fn writes(events: &[CoreEvent]) -> Vec<&Outbound> {
        events
            .iter()
            .filter_map(|e| match e {
                CoreEvent::Write(out) => Some(out),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_stream_handshake_with_ife1() {
        let mut core = ChannelCore::new(Protocol::Tcp, None);
        core.connect();
        assert!(core.on_connected().unwrap().is_empty());
        assert_eq!(core.state(), ChannelState::EncryptionHandshaking);

        // Sent before the handshake completes: held back.
        assert!(core.send(WireMessage::new("early", b"{}".to_vec())).unwrap().is_none());

        let events = feed(&mut core, &control("0-HELLO!,1,2")).unwrap();
        assert!(events.is_empty());
        assert_eq!(core.state(), ChannelState::EncryptionHandshaking);

        let events = feed(&mut core, &control("2-4242")).unwrap();
        assert_eq!(core.state(), ChannelState::Connected);
        assert_eq!(events[0], CoreEvent::Started);
        let out = writes(&events);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].msg_type, "early");
        assert_eq!(out[0].encryption.as_deref(), Some("1-"));
    }

    #[test]
    fn test_empty_hello_completes_immediately() {
        let mut core = ChannelCore::new(Protocol::Tcp, None);
        core.connect();
        core.on_connected().unwrap();
        let events = feed(&mut core, &control("HELLO!-")).unwrap();
        assert_eq!(events, vec![CoreEvent::Started]);

        let out = core
            .send(WireMessage::new("echo", b"hi".to_vec()))
            .unwrap()
            .unwrap();
        assert_eq!(out.encryption, None);
        assert_eq!(out.frame(), b"VER:1\nLEN:2\n\nhi");
    }

    #[test]
    fn test_payload_during_handshake_is_fatal() {
        let mut core = ChannelCore::new(Protocol::Tcp, None);
        core.connect();
        core.on_connected().unwrap();
        let payload = frame::encode(&HeaderFields::new(), b"{}");
        let err = feed(&mut core, &payload).unwrap_err();
        assert!(matches!(err, TransportError::UnexpectedPayload));

        core.fail(&err);
        assert_eq!(core.state(), ChannelState::Disconnected);
        assert_eq!(core.last_error(), ErrorKind::EncryptionFailure);
    }

    #[test]
    fn test_receive_ife1_encrypted_payload() {
        let mut core = ChannelCore::new(Protocol::Tcp, None);
        core.connect();
        core.on_connected().unwrap();
        feed(&mut core, &control("HELLO!-2")).unwrap();
        feed(&mut core, &control("2-77")).unwrap();
        assert_eq!(core.state(), ChannelState::Connected);

        // The server encrypts with the same key schedule.
        let mut server = Ife1Cipher::default();
        server.handshake("77").unwrap();
        let mut body = b"{\"_msgtype\":\"echo\"}".to_vec();
        server.encrypt(&mut body);

        let frame = frame::encode_with_encryption(Some("2-"), &body);
        let events = feed(&mut core, &frame).unwrap();
        match &events[..] {
            [CoreEvent::Received(_, body)] => assert_eq!(body, b"{\"_msgtype\":\"echo\"}"),
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn test_frames_before_a_bad_one_are_kept() {
        let mut core = ChannelCore::new(Protocol::Tcp, None);
        core.connect();
        core.on_connected().unwrap();
        feed(&mut core, &control("HELLO!-")).unwrap();

        let mut bytes = frame::encode(&HeaderFields::new(), b"{\"n\":1}");
        bytes.extend_from_slice(&frame::encode(&HeaderFields::new(), b"{\"n\":2}"));
        bytes.extend_from_slice(b"VER:9\nLEN:2\n\n{}");

        let output = core.on_stream_bytes(&bytes);
        let bodies: Vec<&[u8]> = output
            .events
            .iter()
            .filter_map(|e| match e {
                CoreEvent::Received(_, body) => Some(body.as_slice()),
                _ => None,
            })
            .collect();
        assert_eq!(bodies, vec![&b"{\"n\":1}"[..], &b"{\"n\":2}"[..]]);
        assert!(output.error.is_some());
    }

    #[test]
    fn test_missing_enc_with_negotiated_cipher() {
        let mut core = ChannelCore::new(Protocol::Tcp, None);
        core.connect();
        core.on_connected().unwrap();
        feed(&mut core, &control("HELLO!-1")).unwrap();
        let payload = frame::encode(&HeaderFields::new(), b"{}");
        let err = feed(&mut core, &payload).unwrap_err();
        assert!(matches!(
            err,
            TransportError::Encryption(EncryptionError::MissingHeader(_))
        ));
    }

    #[test]
    fn test_datagram_preset_ife2() {
        let mut core = ChannelCore::new(Protocol::Udp, Some(CipherType::Ife2));
        core.connect();
        let events = core.on_connected().unwrap();
        assert_eq!(events, vec![CoreEvent::Started]);

        let mut body = b"abcdef".to_vec();
        ife2_transform(&mut body, true);
        let packet = frame::encode_with_encryption(Some("3-"), &body);
        let events = core.on_datagram(&packet).unwrap();
        assert_eq!(
            events,
            vec![CoreEvent::Received(
                frame::decode(&packet, &mut 0).unwrap().unwrap().fields,
                b"abcdef".to_vec()
            )]
        );
    }

    #[test]
    fn test_truncated_datagram_is_dropped() {
        let mut core = ChannelCore::new(Protocol::Udp, None);
        core.connect();
        core.on_connected().unwrap();
        let packet = frame::encode(&HeaderFields::new(), b"0123456789");
        assert!(core.on_datagram(&packet[..packet.len() - 3]).unwrap().is_empty());
        assert_eq!(core.state(), ChannelState::Connected);
    }

    #[test]
    fn test_http_response() {
        let mut core = ChannelCore::new(Protocol::Http, None);
        core.connect();
        core.on_connected().unwrap();
        let events = core.on_http_response(Some(" "), None, b"{}".to_vec()).unwrap();
        match &events[..] {
            [CoreEvent::Received(fields, body)] => {
                assert_eq!(fields.get("LEN"), Some("2"));
                assert_eq!(body, b"{}");
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn test_compressed_datagram_loop() {
        let mut core = ChannelCore::new(Protocol::Udp, None)
            .with_compressor(Compressor::new(CompressionType::Zstd));
        core.connect();
        core.on_connected().unwrap();

        let body = chat(400);
        let out = core
            .send(WireMessage::new("chat", body.clone()))
            .unwrap()
            .unwrap();
        assert_eq!(out.uncompressed_size, Some(body.len()));
        assert!(out.body.len() < body.len());
        let framed = out.frame();
        let header = format!("C:{}\n", body.len());
        assert!(framed.windows(header.len()).any(|w| w == header.as_bytes()));

        match &core.on_datagram(&framed).unwrap()[..] {
            [CoreEvent::Received(_, received)] => assert_eq!(received, &body),
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn test_short_body_is_not_compressed() {
        let mut core = ChannelCore::new(Protocol::Udp, None)
            .with_compressor(Compressor::new(CompressionType::Deflate));
        core.connect();
        core.on_connected().unwrap();

        let out = core
            .send(WireMessage::new("chat", b"{}".to_vec()))
            .unwrap()
            .unwrap();
        assert_eq!(out.uncompressed_size, None);
        assert_eq!(out.frame(), b"VER:1\nLEN:2\n\n{}");
    }

    #[test]
    fn test_compressed_body_without_compressor() {
        let mut core = ChannelCore::new(Protocol::Udp, None);
        core.connect();
        core.on_connected().unwrap();

        let mut fields = HeaderFields::new();
        fields.insert(UNCOMPRESSED_LENGTH_FIELD, "300");
        let err = core.on_datagram(&frame::encode(&fields, b"packed")).unwrap_err();
        assert!(matches!(
            err,
            TransportError::Compression(CompressionError::NotConfigured)
        ));
        assert_eq!(err.kind(), ErrorKind::DecodeError);
    }

    #[test]
    fn test_http_response_compressed() {
        let compressor = Compressor::new(CompressionType::Deflate);
        let mut core = ChannelCore::new(Protocol::Http, None).with_compressor(compressor.clone());
        core.connect();
        core.on_connected().unwrap();

        let body = chat(300);
        let packed = compressor.unwrap().compress(&body).unwrap().unwrap();
        let size = body.len().to_string();
        let events = core.on_http_response(None, Some(&size), packed).unwrap();
        match &events[..] {
            [CoreEvent::Received(_, received)] => assert_eq!(received, &body),
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn test_send_while_disconnected() {
        let mut core = ChannelCore::new(Protocol::Tcp, None);
        let err = core.send(WireMessage::new("x", Vec::new())).unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[test]
    fn test_connect_resets_previous_connection() {
        let mut core = ChannelCore::new(Protocol::Tcp, None);
        core.connect();
        core.on_connected().unwrap();
        core.send(WireMessage::new("x", Vec::new())).unwrap();
        assert_eq!(core.pending(), 1);

        core.connect();
        assert_eq!(core.pending(), 0);
        assert_eq!(core.state(), ChannelState::Connecting);
    }
}
