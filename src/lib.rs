//! mux_rpc is a symmetric client/server RPC runtime based on coroutines.
//! A single connection carries any number of interleaved calls: the
//! client tags every request with a sequence number, the server handles
//! requests concurrently and answers in whatever order handlers finish,
//! and the client's receive task routes each response back to its caller.
//!
//! ## Wire protocol
//!
//! A connection starts with one JSON-encoded option value declaring a
//! magic number and the name of the codec to use; everything after it is
//! a stream of header/body pairs encoded by that codec. Two codecs are
//! registered out of the box, `"application/gob"` (binary) and
//! `"application/json"`, and more can be added with [`register_codec`].
//!
//! ## Services
//!
//! Methods are registered through a typed builder; each handler takes the
//! receiver, an owned argument and a mutable reply slot, and its error
//! text travels back to the caller verbatim:
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Args {
//!     num1: i64,
//!     num2: i64,
//! }
//!
//! struct Foo;
//!
//! fn main() -> Result<(), mux_rpc::Error> {
//!     let service = mux_rpc::ServiceBuilder::new(Foo)?
//!         .method("Sum", |_: &Foo, args: Args, reply: &mut i64| {
//!             *reply = args.num1 + args.num2;
//!             Ok(())
//!         })
//!         .build();
//!
//!     let server = Arc::new(mux_rpc::Server::new());
//!     server.register(service)?;
//!     let _instance = server.start("127.0.0.1:4000")?;
//!
//!     let client = mux_rpc::dial("127.0.0.1:4000", &[])?;
//!     let mut reply = 0i64;
//!     client.call("Foo.Sum", &Args { num1: 1, num2: 3 }, &mut reply)?;
//!     assert_eq!(reply, 4);
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]

mod client;
mod codec;
mod errors;
mod handshake;
mod server;
mod service;
mod stream_ext;

pub use client::{dial, done_channel, Call, Client, DoneReceiver, DoneSender};
#[cfg(unix)]
pub use client::dial_unix;
pub use codec::{
    register_codec, CodecReader, CodecWriter, ConnReader, ConnWriter, Encoding, Header,
    NewCodecFn, WriteConn, BINARY_CODEC, JSON_CODEC,
};
pub use errors::{DispatchError, Error};
pub use handshake::{ConnectOption, MAGIC_NUMBER};
pub use server::{accept, default_server, register, Server, ServerInstance};
pub use service::{HandlerError, MethodDescriptor, Service, ServiceBuilder};
pub use stream_ext::StreamExt;
