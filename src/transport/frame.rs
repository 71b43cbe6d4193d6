//! Frame encoding and resumable decoding.
//!
//! Wire format:
//!
//! ```text
//! VER:1\n
//! LEN:<body length>\n
//! [ENC:<cipher>-<cipher header>\n]
//! \n
//! <body, LEN bytes>
//! ```

use std::collections::BTreeMap;
use std::ops::Range;

use crate::core::{
    DecodeError, ENCRYPTION_FIELD, HEADER_DELIMITER, HEADER_FIELD_DELIMITER, LENGTH_FIELD,
    PROTOCOL_VERSION, VERSION_FIELD,
};

/// Header fields of one frame, keyed by uppercased name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderFields {
    fields: BTreeMap<String, String>,
}

impl HeaderFields {
    /// Create an empty field set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a field; the name is uppercased and an existing value replaced.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.fields.insert(name.to_ascii_uppercase(), value.into());
    }

    /// Look up a field by name, case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .get(&name.to_ascii_uppercase())
            .map(String::as_str)
    }

    /// Remove a field.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.fields.remove(&name.to_ascii_uppercase())
    }

    /// The `ENC` value, if present.
    pub fn encryption(&self) -> Option<&str> {
        self.get(ENCRYPTION_FIELD)
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether no field is set.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate over `(name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn clear(&mut self) {
        self.fields.clear();
    }
}

/// Encode a frame.
///
/// `VER` and `LEN` are always written first and computed here; any `VER` or
/// `LEN` in `fields` is ignored. Remaining fields follow in name order.
pub fn encode(fields: &HeaderFields, body: &[u8]) -> Vec<u8> {
    let mut header = format!(
        "{VERSION_FIELD}{HEADER_FIELD_DELIMITER}{PROTOCOL_VERSION}\n\
         {LENGTH_FIELD}{HEADER_FIELD_DELIMITER}{}\n",
        body.len()
    );
    for (name, value) in fields.iter() {
        if name == VERSION_FIELD || name == LENGTH_FIELD {
            continue;
        }
        header.push_str(name);
        header.push(HEADER_FIELD_DELIMITER);
        header.push_str(value);
        header.push('\n');
    }
    header.push('\n');

    let mut frame = header.into_bytes();
    frame.extend_from_slice(body);
    frame
}

/// Encode a frame with an optional `ENC` header and no other fields.
pub fn encode_with_encryption(encryption: Option<&str>, body: &[u8]) -> Vec<u8> {
    let mut fields = HeaderFields::new();
    if let Some(enc) = encryption {
        fields.insert(ENCRYPTION_FIELD, enc);
    }
    encode(&fields, body)
}

/// A complete frame found in a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    /// Header fields, including `VER` and `LEN`.
    pub fields: HeaderFields,
    /// Location of the body in the buffer passed to the decoder.
    pub body: Range<usize>,
}

/// Resumable frame decoder.
///
/// Keeps the header lines parsed so far, so that repeated calls with a
/// growing buffer and the same cursor yield the same frames as one call on
/// the complete buffer.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    fields: HeaderFields,
    body_len: Option<usize>,
}

impl FrameDecoder {
    /// Create a decoder positioned at a frame boundary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop any partially decoded header.
    pub fn reset(&mut self) {
        self.fields.clear();
        self.body_len = None;
    }

    /// Whether a header is partially or fully decoded.
    pub fn in_progress(&self) -> bool {
        self.body_len.is_some() || !self.fields.is_empty()
    }

    /// Try to decode one frame from `buf[*cursor..]`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. The cursor advances past
    /// every consumed header line, and past the body once a frame is returned.
    pub fn decode(
        &mut self,
        buf: &[u8],
        cursor: &mut usize,
    ) -> Result<Option<DecodedFrame>, DecodeError> {
        if self.body_len.is_none() && !self.decode_header(buf, cursor)? {
            return Ok(None);
        }

        let len = self.body_len.unwrap_or_default();
        if buf.len() - *cursor < len {
            return Ok(None);
        }

        let body = *cursor..*cursor + len;
        *cursor += len;
        self.body_len = None;

        Ok(Some(DecodedFrame {
            fields: std::mem::take(&mut self.fields),
            body,
        }))
    }

    /// Consume header lines; true once the blank terminator was seen.
    fn decode_header(&mut self, buf: &[u8], cursor: &mut usize) -> Result<bool, DecodeError> {
        loop {
            let rest = &buf[*cursor..];
            let Some(end) = rest.iter().position(|b| *b == HEADER_DELIMITER) else {
                return Ok(false);
            };
            let line = &rest[..end];
            *cursor += end + 1;

            if line.is_empty() {
                self.body_len = Some(self.validate()?);
                return Ok(true);
            }

            let line = std::str::from_utf8(line)
                .map_err(|_| DecodeError::MalformedHeader(String::from_utf8_lossy(line).into()))?;
            let (name, value) = line
                .split_once(HEADER_FIELD_DELIMITER)
                .ok_or_else(|| DecodeError::MalformedHeader(line.to_string()))?;
            self.fields.insert(name.trim(), value.trim_end_matches('\r'));
        }
    }

    fn validate(&self) -> Result<usize, DecodeError> {
        let version = self
            .fields
            .get(VERSION_FIELD)
            .ok_or(DecodeError::MissingField(VERSION_FIELD))?;
        if version.trim().parse::<u32>() != Ok(PROTOCOL_VERSION) {
            return Err(DecodeError::UnsupportedVersion(version.to_string()));
        }

        let length = self
            .fields
            .get(LENGTH_FIELD)
            .ok_or(DecodeError::MissingField(LENGTH_FIELD))?;
        length
            .trim()
            .parse::<usize>()
            .map_err(|_| DecodeError::InvalidLength(length.to_string()))
    }
}

/// Stateless decode of one frame at `*cursor`.
///
/// The cursor only moves when a complete frame is returned.
pub fn decode(buf: &[u8], cursor: &mut usize) -> Result<Option<DecodedFrame>, DecodeError> {
    let mut at = *cursor;
    let frame = FrameDecoder::new().decode(buf, &mut at)?;
    if frame.is_some() {
        *cursor = at;
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn body_of<'a>(buf: &'a [u8], frame: &DecodedFrame) -> &'a [u8] {
        &buf[frame.body.clone()]
    }

    #[test]
    fn test_encode_layout() {
        let mut fields = HeaderFields::new();
        fields.insert("enc", "3-");
        let frame = encode(&fields, b"hi");
        assert_eq!(frame, b"VER:1\nLEN:2\nENC:3-\n\nhi");
    }

    #[test]
    fn test_roundtrip_empty_body() {
        let frame = encode(&HeaderFields::new(), b"");
        let mut cursor = 0;
        let decoded = decode(&frame, &mut cursor).unwrap().unwrap();
        assert_eq!(decoded.body, frame.len()..frame.len());
        assert_eq!(decoded.fields.get("LEN"), Some("0"));
        assert_eq!(cursor, frame.len());
    }

    #[test]
    fn test_field_names_uppercased_and_duplicates_overwrite() {
        let buf = b"ver:1\nLen:3\nx-custom:a\nX-CUSTOM:b\n\nabc";
        let mut cursor = 0;
        let frame = decode(buf, &mut cursor).unwrap().unwrap();
        assert_eq!(frame.fields.get("X-CUSTOM"), Some("b"));
        assert_eq!(frame.fields.get("x-custom"), Some("b"));
        assert_eq!(body_of(buf, &frame), b"abc");
    }

    #[test]
    fn test_value_may_contain_delimiter() {
        let buf = b"VER:1\nLEN:0\nENC:4-ab:cd\n\n";
        let frame = decode(buf, &mut 0).unwrap().unwrap();
        assert_eq!(frame.fields.encryption(), Some("4-ab:cd"));
    }

    #[test]
    fn test_malformed_header() {
        let buf = b"VER:1\nGARBAGE\n\n";
        assert!(matches!(
            decode(buf, &mut 0),
            Err(DecodeError::MalformedHeader(line)) if line == "GARBAGE"
        ));
    }

    #[test]
    fn test_missing_fields() {
        assert_eq!(
            decode(b"LEN:0\n\n", &mut 0),
            Err(DecodeError::MissingField("VER"))
        );
        assert_eq!(
            decode(b"VER:1\n\n", &mut 0),
            Err(DecodeError::MissingField("LEN"))
        );
    }

    #[test]
    fn test_version_mismatch() {
        assert_eq!(
            decode(b"VER:2\nLEN:0\n\n", &mut 0),
            Err(DecodeError::UnsupportedVersion("2".into()))
        );
    }

    #[test]
    fn test_invalid_length() {
        assert_eq!(
            decode(b"VER:1\nLEN:-4\n\n", &mut 0),
            Err(DecodeError::InvalidLength("-4".into()))
        );
    }

    #[test]
    fn test_needs_more_bytes() {
        let frame = encode(&HeaderFields::new(), b"hello");
        let mut cursor = 0;
        assert_eq!(decode(&frame[..frame.len() - 1], &mut cursor), Ok(None));
        assert_eq!(cursor, 0);
        assert_eq!(decode(&frame[..4], &mut cursor), Ok(None));
        assert_eq!(cursor, 0);
    }

    #[test]
    fn test_decoder_resumes_mid_header() {
        let frame = encode(&HeaderFields::new(), b"payload");
        let mut decoder = FrameDecoder::new();
        let mut cursor = 0;

        // Stop in the middle of the LEN line.
        assert_eq!(decoder.decode(&frame[..9], &mut cursor), Ok(None));
        assert!(decoder.in_progress());
        assert_eq!(cursor, 6);

        let decoded = decoder.decode(&frame, &mut cursor).unwrap().unwrap();
        assert_eq!(body_of(&frame, &decoded), b"payload");
        assert!(!decoder.in_progress());
    }

    fn field_name() -> impl Strategy<Value = String> {
        "[A-Z][A-Z0-9_-]{0,8}".prop_filter("reserved", |n| n != "VER" && n != "LEN")
    }

    fn header_set() -> impl Strategy<Value = Vec<(String, String)>> {
        prop::collection::vec((field_name(), "[ -9;-~]{0,16}"), 0..4)
    }

    fn frames() -> impl Strategy<Value = Vec<(Vec<(String, String)>, Vec<u8>)>> {
        prop::collection::vec(
            (header_set(), prop::collection::vec(any::<u8>(), 0..64)),
            1..5,
        )
    }

    fn build(spec: &[(String, String)]) -> HeaderFields {
        let mut fields = HeaderFields::new();
        for (name, value) in spec {
            fields.insert(name, value.as_str());
        }
        fields
    }

    proptest! {
        #[test]
        fn prop_roundtrip(spec in header_set(), body in prop::collection::vec(any::<u8>(), 0..256)) {
            let fields = build(&spec);
            let frame = encode(&fields, &body);

            let mut cursor = 0;
            let decoded = decode(&frame, &mut cursor).unwrap().unwrap();

            let mut expected = fields.clone();
            expected.insert(VERSION_FIELD, PROTOCOL_VERSION.to_string());
            expected.insert(LENGTH_FIELD, body.len().to_string());
            prop_assert_eq!(decoded.fields, expected);
            prop_assert_eq!(&frame[decoded.body], &body[..]);
            prop_assert_eq!(cursor, frame.len());
        }

        #[test]
        fn prop_incremental_decode_equivalence(input in frames()) {
            let mut wire = Vec::new();
            for (spec, body) in &input {
                wire.extend(encode(&build(spec), body));
            }

            let mut whole = Vec::new();
            let mut decoder = FrameDecoder::new();
            let mut cursor = 0;
            while let Some(frame) = decoder.decode(&wire, &mut cursor).unwrap() {
                whole.push((frame.fields, wire[frame.body].to_vec()));
            }

            let mut incremental = Vec::new();
            let mut decoder = FrameDecoder::new();
            let mut cursor = 0;
            for end in 1..=wire.len() {
                while let Some(frame) = decoder.decode(&wire[..end], &mut cursor).unwrap() {
                    incremental.push((frame.fields, wire[frame.body].to_vec()));
                }
            }

            prop_assert_eq!(whole.len(), input.len());
            prop_assert_eq!(whole, incremental);
        }
    }
}
