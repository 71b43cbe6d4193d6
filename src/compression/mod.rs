//! Tickwire - Compression Layer
//!
//! Optional body compression, configured per transport:
//!
//! - **zstd**: Zstandard, optionally primed with a dictionary shared with the
//!   server
//! - **deflate**: raw DEFLATE
//!
//! Bodies are compressed before encryption and decompressed after
//! decryption. A compressed frame carries the original length in its `C`
//! header; frames without it are passed through untouched.

mod codec;

pub use codec::Compressor;
pub use crate::core::{CompressionError, CompressionType};
