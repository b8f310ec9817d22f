use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::net::ToSocketAddrs;
use std::sync::Arc;

use bytes::Bytes;
use log::{error, info, warn};
use may::net::TcpStream;
use may::sync::{mpsc, Mutex};
use may::{coroutine, go};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{self, CodecReader, CodecWriter, Encoding, Header};
use crate::errors::Error;
use crate::handshake::{self, parse_options, ConnectOption};
use crate::stream_ext::StreamExt;

/// One in-flight invocation, shared between the caller, the pending map
/// and the receive task.
pub struct Call {
    seq: u64,
    service_method: String,
    encoding: Encoding,
    outcome: Mutex<Outcome>,
    // the mpsc sender is not Sync, keep it behind a lock
    done: Mutex<DoneSender>,
    waiter: Mutex<Option<DoneReceiver>>,
}

#[derive(Default)]
struct Outcome {
    reply: Option<Bytes>,
    error: Option<Error>,
}

impl Call {
    fn new(
        seq: u64,
        service_method: &str,
        encoding: Encoding,
        done: DoneSender,
        waiter: Option<DoneReceiver>,
    ) -> Call {
        Call {
            seq,
            service_method: service_method.to_owned(),
            encoding,
            outcome: Mutex::new(Outcome::default()),
            done: Mutex::new(done),
            waiter: Mutex::new(waiter),
        }
    }

    /// The sequence number assigned when the call was registered.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// The `"Service.Method"` identifier this call was made with.
    pub fn service_method(&self) -> &str {
        &self.service_method
    }

    /// The call's error, if it completed unsuccessfully.
    pub fn error(&self) -> Option<Error> {
        self.outcome.lock().unwrap().error.clone()
    }

    /// Decode the reply of a completed call.
    ///
    /// Returns the call's own error if it failed, [`Error::Deserialize`]
    /// if the reply bytes do not decode into `R`, and [`Error::Shutdown`]
    /// if the call has not completed yet.
    pub fn reply<R: DeserializeOwned>(&self) -> Result<R, Error> {
        let outcome = self.outcome.lock().unwrap();
        if let Some(err) = &outcome.error {
            return Err(err.clone());
        }
        let bytes = outcome.reply.as_ref().ok_or(Error::Shutdown)?;
        self.encoding
            .decode(bytes)
            .map_err(|e| Error::Deserialize(e.to_string()))
    }

    /// Block until the call completes.
    ///
    /// Only meaningful when [`Client::go`] allocated the completion queue
    /// itself; with a caller-supplied [`DoneSender`] the caller already
    /// holds the receiving end and this returns immediately. A second
    /// `wait` also returns immediately.
    pub fn wait(&self) -> Result<(), Error> {
        let waiter = self.waiter.lock().unwrap().take();
        if let Some(rx) = waiter {
            rx.recv()?;
        }
        Ok(())
    }

    // completion is signalled exactly once per call
    fn complete(self: &Arc<Self>, reply: Option<Bytes>, error: Option<Error>) {
        {
            let mut outcome = self.outcome.lock().unwrap();
            outcome.reply = reply;
            outcome.error = error;
        }
        self.done.lock().unwrap().send(self.clone());
    }
}

/// The sending half of a completion queue; clone it to share one queue
/// between several calls.
#[derive(Clone)]
pub struct DoneSender {
    tx: mpsc::Sender<Arc<Call>>,
    capacity: usize,
}

impl DoneSender {
    /// The capacity the queue was declared with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn send(&self, call: Arc<Call>) {
        // a dropped receiver just means nobody is watching this call
        let _ = self.tx.send(call);
    }
}

/// The receiving half of a completion queue.
pub struct DoneReceiver {
    rx: mpsc::Receiver<Arc<Call>>,
}

impl DoneReceiver {
    /// Receive the next completed call.
    pub fn recv(&self) -> Result<Arc<Call>, Error> {
        self.rx.recv().map_err(|_| Error::Shutdown)
    }
}

/// Create a completion queue for [`Client::go`].
///
/// The queue never blocks the sender, so the client's receive task cannot
/// wedge on signalling a completion; `capacity` is the declared depth a
/// Go-style bounded channel would have, kept for callers that size their
/// queues explicitly.
pub fn done_channel(capacity: usize) -> (DoneSender, DoneReceiver) {
    let (tx, rx) = mpsc::channel();
    (DoneSender { tx, capacity }, DoneReceiver { rx })
}

struct SendState {
    codec: Box<dyn CodecWriter>,
    // reusable request header, only touched while holding the send lock
    header: Header,
}

struct ClientState {
    pending: HashMap<u64, Arc<Call>>,
    seq: u64,
    closing: bool,
    shutdown: bool,
}

struct ClientCore {
    // lock order: writer before state, everywhere
    writer: Mutex<SendState>,
    state: Mutex<ClientState>,
    encoding: Encoding,
}

impl ClientCore {
    fn send(
        &self,
        service_method: &str,
        body: &[u8],
        done: DoneSender,
        waiter: Option<DoneReceiver>,
    ) -> Arc<Call> {
        let mut sender = self.writer.lock().unwrap();

        // register: assign a seq and park the call in the pending map
        let mut state = self.state.lock().unwrap();
        if state.closing || state.shutdown {
            drop(state);
            drop(sender);
            let call = Arc::new(Call::new(0, service_method, self.encoding, done, waiter));
            call.complete(None, Some(Error::Shutdown));
            return call;
        }
        let seq = state.seq;
        state.seq += 1;
        let call = Arc::new(Call::new(seq, service_method, self.encoding, done, waiter));
        state.pending.insert(seq, call.clone());
        drop(state);
        info!("rpc client: send req, seq={} method={}", seq, service_method);

        let SendState { codec, header } = &mut *sender;
        header.service_method.clear();
        header.service_method.push_str(service_method);
        header.seq = call.seq;
        header.error.clear();

        if let Err(e) = codec.write(header, body) {
            drop(sender);
            if let Some(call) = self.remove_call(call.seq) {
                call.complete(None, Some(e));
            }
        }
        call
    }

    // removal is idempotent, an absent seq yields nothing
    fn remove_call(&self, seq: u64) -> Option<Arc<Call>> {
        self.state.lock().unwrap().pending.remove(&seq)
    }

    fn terminate_calls(&self, err: Error) {
        let _sender = self.writer.lock().unwrap();
        let calls: Vec<Arc<Call>> = {
            let mut state = self.state.lock().unwrap();
            state.shutdown = true;
            state.pending.drain().map(|(_, call)| call).collect()
        };
        for call in calls {
            call.complete(None, Some(err.clone()));
        }
    }
}

fn receive(core: &ClientCore, mut codec: Box<dyn CodecReader>) {
    let err = loop {
        let mut header = Header::default();
        if let Err(e) = codec.read_header(&mut header) {
            break e;
        }
        info!("rpc client: receive rsp, seq={}", header.seq);

        match core.remove_call(header.seq) {
            // response for an unknown or cancelled seq: discard the body
            None => {
                if let Err(e) = codec.read_body() {
                    break e;
                }
            }
            Some(call) if !header.error.is_empty() => {
                let body = codec.read_body();
                call.complete(None, Some(Error::Remote(header.error)));
                if let Err(e) = body {
                    break e;
                }
            }
            Some(call) => match codec.read_body() {
                Ok(bytes) => call.complete(Some(bytes), None),
                Err(e) => {
                    call.complete(None, Some(e.clone()));
                    break e;
                }
            },
        }
    };

    match &err {
        Error::Io(e) if e.kind() == ErrorKind::UnexpectedEof => {
            info!("rpc client: connection closed")
        }
        e => error!("rpc client: receive loop err = {:?}", e),
    }
    core.terminate_calls(err);
}

/// A connection to an RPC server, usable from any number of coroutines.
///
/// All in-flight calls share the one underlying stream; requests are
/// interleaved by sequence number and the receive task routes each
/// response back to its caller.
pub struct Client<S: StreamExt> {
    core: Arc<ClientCore>,
    ctrl: S,
    receiver: Option<coroutine::JoinHandle<()>>,
}

impl<S: StreamExt> fmt::Debug for Client<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl<S: StreamExt> Client<S> {
    /// Perform the option handshake on `conn` and start the receive task.
    pub fn new(conn: S, opt: &ConnectOption) -> Result<Self, Error> {
        let entry = codec::lookup_codec(&opt.codec_type)
            .ok_or_else(|| Error::InvalidCodec(opt.codec_type.clone()))?;

        let mut conn = conn;
        handshake::write_option(&mut conn, opt)?;

        let ctrl = conn.try_clone()?;
        let read_half = conn.try_clone()?;
        let (reader, writer) = (entry.new_codec)(Box::new(read_half), Box::new(conn));

        let core = Arc::new(ClientCore {
            writer: Mutex::new(SendState {
                codec: writer,
                header: Header::default(),
            }),
            state: Mutex::new(ClientState {
                pending: HashMap::new(),
                seq: 1,
                closing: false,
                shutdown: false,
            }),
            encoding: entry.encoding,
        });

        let rx_core = core.clone();
        let receiver = go!(
            coroutine::Builder::new().name("MuxClientReceiver".to_owned()),
            move || receive(&rx_core, reader)
        )?;

        Ok(Client {
            core,
            ctrl,
            receiver: Some(receiver),
        })
    }

    /// Invoke `service_method` asynchronously.
    ///
    /// When `done` is `None` a completion queue of capacity 10 is
    /// allocated and the returned call can be awaited with
    /// [`Call::wait`]; a supplied sender is signalled with the completed
    /// call instead. A sender declared with capacity 0 draws a warning,
    /// since an unbuffered queue would stall a Go-style receive loop.
    pub fn go<A: Serialize>(
        &self,
        service_method: &str,
        args: &A,
        done: Option<DoneSender>,
    ) -> Arc<Call> {
        let (done, waiter) = match done {
            Some(done) => {
                if done.capacity() == 0 {
                    warn!("rpc client: done channel is unbuffered");
                }
                (done, None)
            }
            None => {
                let (tx, rx) = done_channel(10);
                (tx, Some(rx))
            }
        };

        let body = match self.core.encoding.encode(args) {
            Ok(body) => body,
            Err(e) => {
                let call = Arc::new(Call::new(0, service_method, self.core.encoding, done, waiter));
                call.complete(None, Some(Error::Serialize(e.to_string())));
                return call;
            }
        };

        self.core.send(service_method, &body, done, waiter)
    }

    /// Invoke `service_method` and block until the reply is decoded into
    /// `*reply` or the call fails.
    pub fn call<A: Serialize, R: DeserializeOwned>(
        &self,
        service_method: &str,
        args: &A,
        reply: &mut R,
    ) -> Result<(), Error> {
        let (tx, rx) = done_channel(1);
        self.go(service_method, args, Some(tx));
        let call = rx.recv()?;
        *reply = call.reply()?;
        Ok(())
    }

    /// Whether the client can still issue calls.
    pub fn is_available(&self) -> bool {
        let state = self.core.state.lock().unwrap();
        !state.closing && !state.shutdown
    }

    /// Close the connection.
    ///
    /// Every call still pending fails with the terminating error; a second
    /// close returns [`Error::Shutdown`].
    pub fn close(&self) -> Result<(), Error> {
        {
            let mut state = self.core.state.lock().unwrap();
            if state.closing {
                return Err(Error::Shutdown);
            }
            state.closing = true;
        }
        // flushes and shuts the connection down, which unblocks the
        // receive task, which then terminates pending calls
        self.core.writer.lock().unwrap().codec.close()?;
        Ok(())
    }
}

impl<S: StreamExt> Drop for Client<S> {
    fn drop(&mut self) {
        self.ctrl.shutdown().ok();
        if let Some(receiver) = self.receiver.take() {
            receiver.join().ok();
        }
    }
}

/// Connect to a TCP server and build a client over the connection.
///
/// At most one option may be supplied; an omitted or partial option is
/// filled in with the defaults. The connection is closed again if client
/// construction fails.
pub fn dial<A: ToSocketAddrs>(addr: A, opts: &[ConnectOption]) -> Result<Client<TcpStream>, Error> {
    let opt = parse_options(opts)?;
    let conn = TcpStream::connect(addr)?;
    conn.set_nodelay(true).ok();
    Client::new(conn, &opt)
}

/// Connect to a Unix-socket server and build a client over the connection.
#[cfg(unix)]
pub fn dial_unix<P: AsRef<std::path::Path>>(
    path: P,
    opts: &[ConnectOption],
) -> Result<Client<may::os::unix::net::UnixStream>, Error> {
    let opt = parse_options(opts)?;
    let conn = may::os::unix::net::UnixStream::connect(path)?;
    Client::new(conn, &opt)
}
