use std::collections::HashMap;
use std::error::Error as StdError;
use std::io::{self, Read, Write};
use std::sync::RwLock;

use bytes::Bytes;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::Error;
use crate::stream_ext::StreamExt;

mod framed;

/// The per-message control record, exchanged ahead of every body.
///
/// A request carries an empty `error`; a response carries a non-empty
/// `error` exactly when dispatch failed, in which case the body is an
/// empty frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Identifier of the form `"Service.Method"`, split on the last `.`.
    pub service_method: String,
    /// Client-assigned sequence number correlating request and response.
    pub seq: u64,
    /// Error text; empty on requests and on successful responses.
    pub error: String,
}

/// The value format a codec encodes headers and bodies with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Self-contained binary encoding (bincode).
    Binary,
    /// UTF-8 JSON encoding (serde_json).
    Json,
}

impl Encoding {
    /// Encode one value to bytes in this format.
    pub fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>, Box<dyn StdError + Send + Sync>> {
        match self {
            Encoding::Binary => bincode::serialize(value).map_err(Into::into),
            Encoding::Json => serde_json::to_vec(value).map_err(Into::into),
        }
    }

    /// Decode one value of this format from bytes.
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, Box<dyn StdError + Send + Sync>> {
        match self {
            Encoding::Binary => bincode::deserialize(bytes).map_err(Into::into),
            Encoding::Json => serde_json::from_slice(bytes).map_err(Into::into),
        }
    }
}

/// The read half of a negotiated codec, owned by the connection's one
/// reader task.
pub trait CodecReader: Send {
    /// Read the next message header.
    fn read_header(&mut self, header: &mut Header) -> Result<(), Error>;
    /// Read the next message body as its raw codec-encoded bytes.
    ///
    /// Discarding a body is simply dropping the returned bytes.
    fn read_body(&mut self) -> Result<Bytes, Error>;
}

/// The write half of a negotiated codec.
///
/// `write` is a compound header-then-body operation, so concurrent users
/// must serialize calls through a mutex.
pub trait CodecWriter: Send {
    /// Write one header/body pair and flush so the peer can progress.
    ///
    /// On a write error the codec shuts the underlying connection down,
    /// which unblocks the connection's reader and starts teardown.
    fn write(&mut self, header: &Header, body: &[u8]) -> Result<(), Error>;
    /// Flush any buffered output, then shut the connection down.
    fn close(&mut self) -> Result<(), Error>;
}

/// The write half of a connection as handed to a codec constructor: a
/// byte sink that can also terminate the connection, so a codec can tear
/// the stream down on a failed write.
pub trait WriteConn: Write + Send {
    /// Shut the underlying connection down, both directions.
    fn shutdown(&self) -> io::Result<()>;
}

impl<S: StreamExt> WriteConn for S {
    fn shutdown(&self) -> io::Result<()> {
        StreamExt::shutdown(self)
    }
}

/// Boxed read half of a connection.
pub type ConnReader = Box<dyn Read + Send>;
/// Boxed write half of a connection.
pub type ConnWriter = Box<dyn WriteConn>;

/// Constructor stored in the codec registry: builds the codec halves over
/// the two halves of a connection.
pub type NewCodecFn = fn(ConnReader, ConnWriter) -> (Box<dyn CodecReader>, Box<dyn CodecWriter>);

/// Registry name of the binary codec; always present.
pub const BINARY_CODEC: &str = "application/gob";
/// Registry name of the JSON codec.
pub const JSON_CODEC: &str = "application/json";

#[derive(Clone, Copy)]
pub(crate) struct CodecEntry {
    pub new_codec: NewCodecFn,
    pub encoding: Encoding,
}

static REGISTRY: Lazy<RwLock<HashMap<String, CodecEntry>>> = Lazy::new(|| {
    let mut codecs = HashMap::new();
    codecs.insert(
        BINARY_CODEC.to_owned(),
        CodecEntry {
            new_codec: framed::new_binary as NewCodecFn,
            encoding: Encoding::Binary,
        },
    );
    codecs.insert(
        JSON_CODEC.to_owned(),
        CodecEntry {
            new_codec: framed::new_json as NewCodecFn,
            encoding: Encoding::Json,
        },
    );
    RwLock::new(codecs)
});

/// Register a codec constructor under `name`, replacing any previous
/// entry. Intended for startup, before any connection is made; lookups
/// afterwards only take the read lock.
pub fn register_codec(name: &str, new_codec: NewCodecFn, encoding: Encoding) {
    let entry = CodecEntry { new_codec, encoding };
    REGISTRY.write().unwrap().insert(name.to_owned(), entry);
}

pub(crate) fn lookup_codec(name: &str) -> Option<CodecEntry> {
    REGISTRY.read().unwrap().get(name).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_codecs_are_registered() {
        assert!(lookup_codec(BINARY_CODEC).is_some());
        assert!(lookup_codec(JSON_CODEC).is_some());
        assert!(lookup_codec("application/protobuf").is_none());
    }

    #[test]
    fn encoding_round_trip() {
        for encoding in [Encoding::Binary, Encoding::Json] {
            let bytes = encoding.encode(&("hi".to_owned(), 7u64)).unwrap();
            let value: (String, u64) = encoding.decode(&bytes).unwrap();
            assert_eq!(value, ("hi".to_owned(), 7));
        }
    }
}
