use std::io;

use thiserror::Error;

/// All errors that can occur during the use of mux_rpc.
#[derive(Debug, Error)]
pub enum Error {
    /// Any IO error on the underlying stream, including a failed
    /// header/body frame read.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// The client is closing or the connection has already terminated.
    #[error("connection is shut down")]
    Shutdown,
    /// The requested codec name is not present in the codec registry.
    #[error("invalid codec type: {0}")]
    InvalidCodec(String),
    /// The option preamble could not be written or decoded.
    #[error("option handshake failed: {0}")]
    Handshake(String),
    /// Malformed dial options.
    #[error("invalid dial options: {0}")]
    Options(String),
    /// Error in serializing a request value.
    ///
    /// Typically this indicates a faulty implementation of `serde::Serialize`.
    #[error("serializing request: {0}")]
    Serialize(String),
    /// Error in deserializing a response body into the caller's reply slot.
    ///
    /// This is scoped to the one call it happened on; the connection
    /// stays usable.
    #[error("deserializing response body: {0}")]
    Deserialize(String),
    /// A dispatch error reported by the peer in the response header.
    #[error("{0}")]
    Remote(String),
    /// A service with the same receiver type name is already registered.
    #[error("service already defined: {0}")]
    DuplicateService(String),
    /// The receiver type name is empty or not exported.
    #[error("invalid service name: {0}")]
    InvalidService(String),
}

// One terminating error fans out to every pending call, so the type must
// be clonable; io errors clone by kind and message.
impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::Io(e) => Error::Io(io::Error::new(e.kind(), e.to_string())),
            Error::Shutdown => Error::Shutdown,
            Error::InvalidCodec(s) => Error::InvalidCodec(s.clone()),
            Error::Handshake(s) => Error::Handshake(s.clone()),
            Error::Options(s) => Error::Options(s.clone()),
            Error::Serialize(s) => Error::Serialize(s.clone()),
            Error::Deserialize(s) => Error::Deserialize(s.clone()),
            Error::Remote(s) => Error::Remote(s.clone()),
            Error::DuplicateService(s) => Error::DuplicateService(s.clone()),
            Error::InvalidService(s) => Error::InvalidService(s.clone()),
        }
    }
}

/// A server-side dispatch failure.
///
/// The display text is what travels back to the caller in the response
/// header's `error` field; none of these are fatal to the connection.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The `service_method` string has no `.` separator.
    #[error("rpc server: service/method request ill-formed: {0}")]
    IllFormed(String),
    /// No service is registered under the requested name.
    #[error("rpc server: can't find service {0}")]
    ServiceNotFound(String),
    /// The service has no method with the requested name.
    #[error("rpc server: can't find method {0}")]
    MethodNotFound(String),
    /// Error in deserializing the request body into the argument type.
    #[error("rpc server: deserializing request body: {0}")]
    Deserialize(String),
    /// Error in serializing the reply value.
    #[error("rpc server: serializing response body: {0}")]
    Serialize(String),
    /// The handler itself returned an error; the text is the handler
    /// error's display form, unchanged.
    #[error("{0}")]
    Handler(String),
}
