use crate::connection_options::ConnectionOptions;
use crate::errors::*;
use crate::frames::OutputBuffer;
use crate::transport::{FrameReader, Transport};
use crate::Sasl;
use amq_protocol::frame::AMQPFrame;
use amq_protocol::protocol::connection::AMQPMethod as AmqpConnection;
use amq_protocol::protocol::connection::{Close, CloseOk, TuneOk};
use amq_protocol::protocol::AMQPClass;
use amq_protocol::types::FieldTable;
use log::debug;

#[derive(Debug)]
pub(crate) struct HandshakeOutcome {
    pub(crate) server_properties: FieldTable,
    pub(crate) tune: TuneOk,
}

/// Drive the connection handshake to completion on the calling thread.
///
/// The reader thread does not exist yet; frames are read inline. Because a
/// server rejecting credentials may either send `connection.close` or simply
/// drop the socket, a socket close before `tune` is reported as a *possible*
/// authentication failure, while an explicit close in that window is a
/// definitive one.
pub(crate) fn run<Auth: Sasl>(
    transport: &Transport,
    reader: &mut FrameReader,
    options: &ConnectionOptions<Auth>,
) -> Result<HandshakeOutcome> {
    transport.write(&OutputBuffer::with_protocol_header())?;

    let start = match next_method(reader).map_err(mask_socket_close)? {
        AMQPClass::Connection(AmqpConnection::Start(start)) => start,
        AMQPClass::Connection(AmqpConnection::Close(close)) => {
            return authentication_failure(transport, close);
        }
        _ => return FrameUnexpectedSnafu.fail(),
    };
    debug!("received handshake {:?}", start);

    let (start_ok, server_properties) = options.make_start_ok(start)?;
    debug!("sending handshake {:?}", start_ok);
    let mut buf = OutputBuffer::empty();
    buf.push_method(0, AmqpConnection::StartOk(start_ok))?;
    transport.write(&buf)?;

    let tune = match next_method(reader).map_err(mask_socket_close)? {
        AMQPClass::Connection(AmqpConnection::Tune(tune)) => tune,
        // We only support PLAIN and EXTERNAL, neither of which uses
        // secure/secure-ok challenges.
        AMQPClass::Connection(AmqpConnection::Secure(_)) => {
            return SaslSecureNotSupportedSnafu.fail();
        }
        AMQPClass::Connection(AmqpConnection::Close(close)) => {
            return authentication_failure(transport, close);
        }
        _ => return FrameUnexpectedSnafu.fail(),
    };
    debug!("received handshake {:?}", tune);

    let tune_ok = options.make_tune_ok(tune)?;
    reader.set_frame_max(tune_ok.frame_max);
    debug!("sending handshake {:?}", tune_ok);
    let mut buf = OutputBuffer::empty();
    buf.push_method(0, AmqpConnection::TuneOk(tune_ok.clone()))?;
    buf.push_method(0, AmqpConnection::Open(options.make_open()))?;
    transport.write(&buf)?;

    // Past tune-ok a close is no longer an authentication problem; it is the
    // server rejecting our tune values or the virtual host.
    match next_method(reader)? {
        AMQPClass::Connection(AmqpConnection::OpenOk(open_ok)) => {
            debug!("received handshake {:?}", open_ok);
        }
        AMQPClass::Connection(AmqpConnection::Close(close)) => {
            send_close_ok(transport);
            return ServerClosedConnectionSnafu {
                code: close.reply_code,
                message: close.reply_text,
            }
            .fail();
        }
        _ => return FrameUnexpectedSnafu.fail(),
    }

    Ok(HandshakeOutcome {
        server_properties,
        tune: tune_ok,
    })
}

fn next_method(reader: &mut FrameReader) -> Result<AMQPClass> {
    loop {
        match reader.read_frame()? {
            // unlikely but not impossible to receive a heartbeat mid-handshake
            AMQPFrame::Heartbeat(0) => continue,
            AMQPFrame::Method(0, class) => return Ok(class),
            _ => return FrameUnexpectedSnafu.fail(),
        }
    }
}

fn mask_socket_close(err: Error) -> Error {
    match err {
        Error::UnexpectedSocketClose => Error::PossibleAuthenticationFailure,
        other => other,
    }
}

fn authentication_failure(transport: &Transport, close: Close) -> Result<HandshakeOutcome> {
    send_close_ok(transport);
    AuthenticationFailureSnafu {
        code: close.reply_code,
        message: close.reply_text,
    }
    .fail()
}

fn send_close_ok(transport: &Transport) {
    let mut buf = OutputBuffer::empty();
    if buf.push_method(0, AmqpConnection::CloseOk(CloseOk {})).is_ok() {
        let _ = transport.write(&buf);
    }
}
