use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::net::ToSocketAddrs;
#[cfg(unix)]
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use co_managed::Manager;
use log::{error, info};
use may::net::TcpListener;
#[cfg(unix)]
use may::os::unix::net::UnixListener;
use may::sync::Mutex;
use may::{coroutine, go};
use once_cell::sync::Lazy;

use crate::codec::{self, CodecReader, CodecWriter, Encoding, Header};
use crate::errors::{DispatchError, Error};
use crate::handshake::{self, MAGIC_NUMBER};
use crate::service::{split_service_method, Service};
use crate::stream_ext::StreamExt;

/// The registry of services plus the connection-serving loop.
///
/// A server is shared behind an [`Arc`]: registration may happen at any
/// time, every accepted connection runs on its own coroutine, and within
/// a connection each request is handled concurrently while responses are
/// serialized through one write lock.
pub struct Server {
    services: RwLock<HashMap<String, Arc<Service>>>,
}

impl Default for Server {
    fn default() -> Self {
        Server::new()
    }
}

// one ephemeral record per accepted request
struct Request {
    header: Header,
    body: Bytes,
    resolution: Result<(Arc<Service>, String), DispatchError>,
}

impl Server {
    /// Create an empty server.
    pub fn new() -> Server {
        Server {
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Register a built service under its receiver type name.
    ///
    /// Fails with [`Error::DuplicateService`] if a service of the same
    /// name already exists. The returned handle can be used to inspect
    /// per-method call counters.
    pub fn register(&self, service: Service) -> Result<Arc<Service>, Error> {
        let mut services = self.services.write().unwrap();
        if services.contains_key(service.name()) {
            return Err(Error::DuplicateService(service.name().to_owned()));
        }
        let service = Arc::new(service);
        services.insert(service.name().to_owned(), service.clone());
        info!("rpc server: service {} registered", service.name());
        Ok(service)
    }

    fn find(&self, service_method: &str) -> Result<(Arc<Service>, String), DispatchError> {
        let (service_name, method_name) = split_service_method(service_method)?;
        let service = self
            .services
            .read()
            .unwrap()
            .get(service_name)
            .cloned()
            .ok_or_else(|| DispatchError::ServiceNotFound(service_name.to_owned()))?;
        if service.method(method_name).is_none() {
            return Err(DispatchError::MethodNotFound(method_name.to_owned()));
        }
        Ok((service, method_name.to_owned()))
    }

    /// Accept connections on the listener and serve each on its own
    /// coroutine until the listener fails.
    pub fn accept(self: &Arc<Self>, listener: TcpListener) {
        let manager = Manager::new();
        for stream in listener.incoming() {
            let conn = match stream {
                Ok(conn) => conn,
                Err(e) => {
                    error!("rpc server: accept error: {}", e);
                    return;
                }
            };
            conn.set_nodelay(true).ok();
            let server = self.clone();
            manager.add(move |_| server.serve_conn(conn));
        }
    }

    /// Accept connections on a Unix socket listener.
    #[cfg(unix)]
    pub fn accept_unix(self: &Arc<Self>, listener: UnixListener) {
        let manager = Manager::new();
        for stream in listener.incoming() {
            let conn = match stream {
                Ok(conn) => conn,
                Err(e) => {
                    error!("rpc server: accept error: {}", e);
                    return;
                }
            };
            let server = self.clone();
            manager.add(move |_| server.serve_conn(conn));
        }
    }

    /// Serve a single connection until the peer hangs up.
    ///
    /// Runs the option handshake, instantiates the negotiated codec and
    /// enters the dispatch pump; returns once the reader fails and every
    /// in-flight handler has completed.
    pub fn serve_conn<S: StreamExt>(&self, conn: S) {
        let mut conn = conn;
        let opt = match handshake::read_option(&mut conn) {
            Ok(opt) => opt,
            Err(e) => {
                error!("rpc server: option error: {}", e);
                return;
            }
        };
        if opt.magic_number != MAGIC_NUMBER {
            error!(
                "rpc server: invalid magic number {:#x}",
                opt.magic_number
            );
            return;
        }
        let entry = match codec::lookup_codec(&opt.codec_type) {
            Some(entry) => entry,
            None => {
                error!("rpc server: invalid codec type {}", opt.codec_type);
                return;
            }
        };

        let read_half = match conn.try_clone() {
            Ok(read_half) => read_half,
            Err(e) => {
                error!("rpc server: clone stream error: {}", e);
                return;
            }
        };
        let (reader, writer) = (entry.new_codec)(Box::new(read_half), Box::new(conn));
        self.serve_codec(reader, writer, entry.encoding);
    }

    // the dispatch pump: one reader, one handler coroutine per request,
    // one write lock
    fn serve_codec(
        &self,
        mut reader: Box<dyn CodecReader>,
        writer: Box<dyn CodecWriter>,
        encoding: Encoding,
    ) {
        let writer = Mutex::new(writer);
        let writer = &writer;

        coroutine::scope(|scope| {
            loop {
                let mut header = Header::default();
                if let Err(e) = reader.read_header(&mut header) {
                    match &e {
                        Error::Io(e) if e.kind() == ErrorKind::UnexpectedEof => {
                            info!("rpc server: connection closed")
                        }
                        e => error!("rpc server: read header err = {:?}", e),
                    }
                    break;
                }
                info!(
                    "rpc server: request seq={} method={}",
                    header.seq, header.service_method
                );

                let resolution = self.find(&header.service_method);

                // the body is consumed even when resolution failed, so the
                // stream stays positioned at the next header
                match reader.read_body() {
                    Ok(body) => {
                        let req = Request {
                            header,
                            body,
                            resolution,
                        };
                        go!(scope, move || handle_request(writer, encoding, req));
                    }
                    Err(e) => {
                        error!("rpc server: read body err = {:?}", e);
                        let req = Request {
                            header,
                            body: Bytes::new(),
                            resolution: Err(DispatchError::Deserialize(e.to_string())),
                        };
                        go!(scope, move || handle_request(writer, encoding, req));
                        break;
                    }
                }
            }
            // leaving the scope joins every in-flight handler
        });

        let close_result = writer.lock().unwrap().close();
        if let Err(e) = close_result {
            error!("rpc server: close codec err = {:?}", e);
        }
    }

    /// Bind a TCP listener on `addr` and run [`Server::accept`] on a new
    /// coroutine; the returned instance stops the loop when dropped.
    pub fn start<L: ToSocketAddrs>(self: &Arc<Self>, addr: L) -> io::Result<ServerInstance> {
        let listener = TcpListener::bind(addr)?;
        let server = self.clone();
        let handle = go!(
            coroutine::Builder::new().name("MuxRpcServer".to_owned()),
            move || server.accept(listener)
        )?;
        Ok(ServerInstance(Some(handle)))
    }

    /// Bind a Unix socket listener on `path` and serve it on a new
    /// coroutine; the socket file is removed when the instance stops.
    #[cfg(unix)]
    pub fn start_unix<P: AsRef<Path>>(self: &Arc<Self>, path: P) -> io::Result<ServerInstance> {
        struct SocketFile(PathBuf);
        impl Drop for SocketFile {
            fn drop(&mut self) {
                std::fs::remove_file(&self.0).ok();
            }
        }

        std::fs::remove_file(&path).ok();
        let listener = UnixListener::bind(&path)?;
        let socket_file = SocketFile(path.as_ref().to_owned());
        let server = self.clone();
        let handle = go!(
            coroutine::Builder::new().name("MuxRpcUnixServer".to_owned()),
            move || {
                let _socket_file = socket_file;
                server.accept_unix(listener);
            }
        )?;
        Ok(ServerInstance(Some(handle)))
    }
}

fn handle_request(writer: &Mutex<Box<dyn CodecWriter>>, encoding: Encoding, req: Request) {
    let Request {
        mut header,
        body,
        resolution,
    } = req;

    let result =
        resolution.and_then(|(service, method)| service.dispatch(&method, encoding, &body));
    match result {
        Ok(reply) => send_response(writer, &header, &reply),
        Err(e) => {
            header.error = e.to_string();
            // a failed dispatch answers with an empty body
            send_response(writer, &header, &[]);
        }
    }
}

fn send_response(writer: &Mutex<Box<dyn CodecWriter>>, header: &Header, body: &[u8]) {
    let mut writer = writer.lock().unwrap();
    if let Err(e) = writer.write(header, body) {
        error!("rpc server: write response error: {}", e);
    }
}

/// A running server loop.
pub struct ServerInstance(Option<coroutine::JoinHandle<()>>);

impl ServerInstance {
    /// Wait until the server loop stops.
    pub fn join(mut self) -> std::thread::Result<()> {
        if let Some(handle) = self.0.take() {
            handle.join()
        } else {
            Ok(())
        }
    }
}

impl Drop for ServerInstance {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            unsafe { handle.coroutine().cancel() };
            handle.join().ok();
        }
    }
}

static DEFAULT_SERVER: Lazy<Arc<Server>> = Lazy::new(|| Arc::new(Server::new()));

/// The process-wide default server used by [`register`] and [`accept`].
pub fn default_server() -> Arc<Server> {
    DEFAULT_SERVER.clone()
}

/// Register a service with the default server.
pub fn register(service: Service) -> Result<Arc<Service>, Error> {
    DEFAULT_SERVER.register(service)
}

/// Serve a listener with the default server.
pub fn accept(listener: TcpListener) {
    DEFAULT_SERVER.accept(listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceBuilder;

    struct Echo;

    fn echo_service() -> Service {
        ServiceBuilder::new(Echo)
            .unwrap()
            .method("Echo", |_: &Echo, msg: String, reply: &mut String| {
                *reply = msg;
                Ok(())
            })
            .build()
    }

    #[test]
    fn duplicate_registration_is_refused() {
        let server = Server::new();
        server.register(echo_service()).unwrap();
        assert!(matches!(
            server.register(echo_service()),
            Err(Error::DuplicateService(_))
        ));
    }

    #[test]
    fn find_reports_each_failure_kind() {
        let server = Server::new();
        server.register(echo_service()).unwrap();

        assert!(server.find("Echo.Echo").is_ok());
        assert!(matches!(
            server.find("EchoEcho"),
            Err(DispatchError::IllFormed(_))
        ));
        assert!(matches!(
            server.find("Nope.Echo"),
            Err(DispatchError::ServiceNotFound(_))
        ));
        assert!(matches!(
            server.find("Echo.Nope"),
            Err(DispatchError::MethodNotFound(_))
        ));
    }
}
