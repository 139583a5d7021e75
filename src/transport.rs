use crate::errors::*;
use crate::frames::OutputBuffer;
use crate::stream::IoStream;
use amq_protocol::frame::{parse_frame, AMQPFrame};
use bytes::Buf;
use log::trace;
use snafu::ResultExt;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

// Frame wire layout: 1 byte type + 2 byte channel + 4 byte payload size,
// then the payload, then the frame-end octet.
const FRAME_HEADER_LEN: usize = 7;
const FRAME_OVERHEAD: u32 = 8;
const FRAME_END: u8 = 0xCE;

/// Establish the TCP leg of a connection, trying every resolved address.
pub(crate) fn connect_tcp(
    host: &str,
    port: u16,
    timeout: Option<Duration>,
) -> Result<TcpStream> {
    let addr = format!("{}:{}", host, port);
    let addrs = addr
        .to_socket_addrs()
        .context(TcpConnectionFailedSnafu { addr: addr.clone() })?;

    let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no addresses resolved");
    for sock_addr in addrs {
        let result = match timeout {
            Some(timeout) => TcpStream::connect_timeout(&sock_addr, timeout),
            None => TcpStream::connect(&sock_addr),
        };
        match result {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = err,
        }
    }
    Err(last_err).context(TcpConnectionFailedSnafu { addr })
}

/// The shared, write-side half of a connection's socket.
///
/// All frame writes from all threads funnel through [`write`](Self::write),
/// which holds one mutex for the duration of the write; a caller that needs a
/// multi-frame sequence to hit the wire contiguously assembles it into a
/// single [`OutputBuffer`] first. Activity timestamps feed the heartbeat
/// sender.
pub(crate) struct Transport {
    writer: Mutex<Box<dyn Write + Send>>,
    shutdown: Box<dyn Fn() + Send + Sync>,
    closed: AtomicBool,
    last_tx: Mutex<Instant>,
    last_rx: Mutex<Instant>,
}

impl Transport {
    /// Split `stream` into the shared transport and the reader half consumed
    /// by the reader thread.
    pub(crate) fn new(stream: Box<dyn IoStream>) -> Result<(Transport, FrameReader)> {
        let split = stream.split()?;
        let now = Instant::now();
        let transport = Transport {
            writer: Mutex::new(split.writer),
            shutdown: split.shutdown,
            closed: AtomicBool::new(false),
            last_tx: Mutex::new(now),
            last_rx: Mutex::new(now),
        };
        Ok((transport, FrameReader::new(split.reader)))
    }

    pub(crate) fn write(&self, buf: &OutputBuffer) -> Result<()> {
        if self.is_closed() {
            return ConnectionDroppedSnafu {
                message: "transport is closed",
            }
            .fail();
        }
        let mut writer = self.writer.lock().unwrap();
        trace!("writing {} bytes", buf.len());
        writer.write_all(buf.as_ref()).context(IoSnafu)?;
        writer.flush().context(IoSnafu)?;
        *self.last_tx.lock().unwrap() = Instant::now();
        Ok(())
    }

    /// Shut the socket down in both directions. Unblocks the reader thread if
    /// it is parked in a blocking read.
    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            (self.shutdown)();
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn record_rx_activity(&self) {
        *self.last_rx.lock().unwrap() = Instant::now();
    }

    pub(crate) fn tx_idle(&self) -> Duration {
        self.last_tx.lock().unwrap().elapsed()
    }

    pub(crate) fn rx_idle(&self) -> Duration {
        self.last_rx.lock().unwrap().elapsed()
    }
}

/// The read-side half of the socket, owned exclusively by the reader thread.
///
/// Reads are byte-exact: the 7-byte frame header declares the payload size;
/// exactly that many bytes plus the frame-end octet are read before the codec
/// parses the frame.
pub(crate) struct FrameReader {
    stream: Box<dyn Read + Send>,
    frame_max: u32,
}

impl FrameReader {
    pub(crate) fn new(stream: Box<dyn Read + Send>) -> FrameReader {
        FrameReader {
            stream,
            frame_max: 0,
        }
    }

    /// Bound payload sizes once `frame_max` has been negotiated. Zero leaves
    /// reads unbounded (pre-tune handshake frames).
    pub(crate) fn set_frame_max(&mut self, frame_max: u32) {
        self.frame_max = frame_max;
    }

    pub(crate) fn read_frame(&mut self) -> Result<AMQPFrame> {
        let mut frame = vec![0; FRAME_HEADER_LEN];
        self.read_fully(&mut frame)?;

        let mut size_bytes = &frame[3..FRAME_HEADER_LEN];
        let size = size_bytes.get_u32();
        if self.frame_max != 0 && size.saturating_add(FRAME_OVERHEAD) > self.frame_max {
            return BadFrameLengthSnafu {
                size,
                max: self.frame_max - FRAME_OVERHEAD,
            }
            .fail();
        }

        let total = FRAME_HEADER_LEN + size as usize + 1;
        frame.resize(total, 0);
        self.read_fully(&mut frame[FRAME_HEADER_LEN..])?;
        if frame[total - 1] != FRAME_END {
            return NoFinalOctetSnafu.fail();
        }

        match parse_frame(&frame) {
            Ok((rest, frame)) if rest.is_empty() => {
                trace!("read frame {:?}", frame);
                Ok(frame)
            }
            _ => MalformedFrameSnafu.fail(),
        }
    }

    fn read_fully(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream.read_exact(buf).map_err(|err| match err.kind() {
            io::ErrorKind::UnexpectedEof => Error::UnexpectedSocketClose,
            _ => Error::Io { source: err },
        })
    }
}
