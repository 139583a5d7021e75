use super::{IoStream, SplitStream};
use crate::errors::*;
use native_tls::HandshakeError;
use snafu::ResultExt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// Both halves of a TLS stream share one session behind a mutex. A blocking
// read would hold that mutex indefinitely, so the read half runs with a short
// socket read timeout and retries, releasing the lock between attempts.
const READ_SLICE: Duration = Duration::from_millis(250);

/// Newtype wrapper around a `native_tls::TlsConnector` to make it usable as a
/// burrow transport factory.
pub struct TlsConnector(native_tls::TlsConnector);

impl TlsConnector {
    pub(crate) fn connect(
        &self,
        domain: &str,
        stream: TcpStream,
    ) -> Result<TlsStream> {
        let inner = self.0.connect(domain, stream).map_err(|err| match err {
            HandshakeError::Failure(err) => Error::TlsHandshake {
                message: err.to_string(),
            },
            // the handshake runs on a blocking socket; WouldBlock means the
            // socket was handed to us in nonblocking mode, which we treat as
            // a handshake failure rather than polling
            HandshakeError::WouldBlock(_) => Error::TlsHandshake {
                message: "TLS handshake would block on a blocking socket".to_string(),
            },
        })?;
        Ok(TlsStream(inner))
    }
}

impl From<native_tls::TlsConnector> for TlsConnector {
    fn from(inner: native_tls::TlsConnector) -> TlsConnector {
        TlsConnector(inner)
    }
}

pub struct TlsStream(native_tls::TlsStream<TcpStream>);

impl IoStream for TlsStream {
    fn split(self: Box<Self>) -> Result<SplitStream> {
        let tcp = self.0.get_ref();
        let closer = tcp.try_clone().context(IoSnafu)?;
        tcp.set_read_timeout(Some(READ_SLICE)).context(IoSnafu)?;
        let shared = Arc::new(Mutex::new(self.0));
        Ok(SplitStream {
            reader: Box::new(TlsHalf(Arc::clone(&shared))),
            writer: Box::new(TlsHalf(shared)),
            shutdown: Box::new(move || {
                let _ = closer.shutdown(Shutdown::Both);
            }),
        })
    }
}

struct TlsHalf(Arc<Mutex<native_tls::TlsStream<TcpStream>>>);

impl Read for TlsHalf {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut stream = self.0.lock().unwrap();
            match stream.read(buf) {
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut =>
                {
                    drop(stream);
                    continue;
                }
                other => return other,
            }
        }
    }
}

impl Write for TlsHalf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().unwrap().flush()
    }
}
