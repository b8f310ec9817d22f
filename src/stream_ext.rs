use std::io::{self, Read, Write};
use std::net::Shutdown;

/// Stream Extension
///
/// The connection type the client and server operate on: a bidirectional,
/// reliable, ordered byte stream that can be cloned into independent read
/// and write handles and shut down from either.
pub trait StreamExt: Sized + Read + Write + Send + Sync + 'static {
    /// try clone the stream
    fn try_clone(&self) -> io::Result<Self>;
    /// shut down both directions, unblocking any pending read
    fn shutdown(&self) -> io::Result<()>;
}

macro_rules! impl_stream_ext {
    ($name: ty) => {
        impl StreamExt for $name {
            fn try_clone(&self) -> io::Result<Self> {
                (*self).try_clone()
            }
            fn shutdown(&self) -> io::Result<()> {
                (*self).shutdown(Shutdown::Both)
            }
        }
    };
}

impl_stream_ext!(may::net::TcpStream);
#[cfg(unix)]
impl_stream_ext!(may::os::unix::net::UnixStream);
