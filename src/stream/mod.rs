use crate::errors::*;
use snafu::ResultExt;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};

#[cfg(feature = "native-tls")]
mod native_tls;

#[cfg(feature = "native-tls")]
pub use self::native_tls::TlsConnector;

/// The halves of a stream after [`IoStream::split`]. The read half is owned
/// exclusively by the connection's reader thread; the write half lives behind
/// the transport's write mutex; the shutdown hook closes the underlying socket
/// from any thread, unblocking a reader stuck in a blocking `read`.
pub struct SplitStream {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub shutdown: Box<dyn Fn() + Send + Sync>,
}

/// A blocking byte stream usable as an AMQP transport.
///
/// Implementations must allow the read half to block indefinitely without
/// starving writes on the other half.
pub trait IoStream: Send + 'static {
    fn split(self: Box<Self>) -> Result<SplitStream>;
}

impl IoStream for TcpStream {
    fn split(self: Box<Self>) -> Result<SplitStream> {
        let reader = self.try_clone().context(IoSnafu)?;
        let closer = self.try_clone().context(IoSnafu)?;
        Ok(SplitStream {
            reader: Box::new(reader),
            writer: self,
            shutdown: Box::new(move || {
                let _ = closer.shutdown(Shutdown::Both);
            }),
        })
    }
}
