//! A minimal in-process AMQP broker for end-to-end tests.
//!
//! Speaks just enough 0.9.1 to exercise the client: handshake, channel
//! lifecycle, queue/exchange declarations, publishes routed through the
//! default exchange (routing key == queue name), deliveries to one consumer
//! per queue, publisher confirms, and `basic.get`. State lives behind an
//! `Arc` so a broker survives client reconnects, which is what the recovery
//! tests need; exclusive and server-named queues die with their connection
//! like the real thing.

use crate::errors::Result;
use crate::frames::{IntoAmqpClass, OutputBuffer};
use crate::stream::{IoStream, SplitStream};
use crate::FieldTable;
use amq_protocol::frame::{parse_frame, AMQPFrame};
use amq_protocol::protocol::basic::AMQPMethod as AmqpBasic;
use amq_protocol::protocol::basic::{
    CancelOk, ConsumeOk, Deliver, GetEmpty, GetOk, QosOk,
};
use amq_protocol::protocol::channel::AMQPMethod as AmqpChannel;
use amq_protocol::protocol::channel::{CloseOk as ChannelCloseOk, OpenOk as ChannelOpenOk};
use amq_protocol::protocol::confirm::AMQPMethod as AmqpConfirm;
use amq_protocol::protocol::confirm::SelectOk as ConfirmSelectOk;
use amq_protocol::protocol::connection::AMQPMethod as AmqpConnection;
use amq_protocol::protocol::connection::{
    CloseOk as ConnectionCloseOk, OpenOk as ConnectionOpenOk, Start, Tune,
};
use amq_protocol::protocol::exchange::AMQPMethod as AmqpExchange;
use amq_protocol::protocol::exchange::{
    BindOk as ExchangeBindOk, DeclareOk as ExchangeDeclareOk, DeleteOk as ExchangeDeleteOk,
    UnbindOk as ExchangeUnbindOk,
};
use amq_protocol::protocol::queue::AMQPMethod as AmqpQueue;
use amq_protocol::protocol::queue::{
    BindOk as QueueBindOk, DeclareOk as QueueDeclareOk, DeleteOk as QueueDeleteOk,
    PurgeOk as QueuePurgeOk, UnbindOk as QueueUnbindOk,
};
use amq_protocol::protocol::tx::AMQPMethod as AmqpTx;
use amq_protocol::protocol::tx::{
    CommitOk as TxCommitOk, RollbackOk as TxRollbackOk, SelectOk as TxSelectOk,
};
use amq_protocol::protocol::AMQPClass;
use crossbeam_channel::{Receiver, Sender};
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;

#[derive(Clone)]
pub(crate) struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<Vec<u8>>>,
    name_counter: u64,
    tag_counter: u64,
    client_eofs: Vec<Sender<Vec<u8>>>,
}

impl MockBroker {
    pub(crate) fn new() -> MockBroker {
        MockBroker {
            state: Arc::new(Mutex::new(BrokerState::default())),
        }
    }

    /// Open a fresh client-facing stream backed by its own session thread.
    pub(crate) fn stream(&self) -> BrokerStream {
        let (to_client_tx, to_client_rx) = crossbeam_channel::unbounded::<Vec<u8>>();
        let (from_client_tx, from_client_rx) = crossbeam_channel::unbounded::<Vec<u8>>();
        self.state
            .lock()
            .unwrap()
            .client_eofs
            .push(to_client_tx.clone());
        let state = Arc::clone(&self.state);
        let session_out = to_client_tx.clone();
        thread::spawn(move || session_main(state, from_client_rx, session_out));
        BrokerStream {
            incoming: to_client_rx,
            incoming_eof: to_client_tx,
            outgoing: from_client_tx,
        }
    }

    /// Simulate a network failure: every live client sees EOF on its next
    /// read.
    pub(crate) fn drop_connections(&self) {
        let mut state = self.state.lock().unwrap();
        for eof in state.client_eofs.drain(..) {
            let _ = eof.send(Vec::new());
        }
    }
}

/// The client's side of a broker session. Empty chunks mark EOF in both
/// directions.
pub(crate) struct BrokerStream {
    incoming: Receiver<Vec<u8>>,
    incoming_eof: Sender<Vec<u8>>,
    outgoing: Sender<Vec<u8>>,
}

impl IoStream for BrokerStream {
    fn split(self: Box<Self>) -> Result<SplitStream> {
        let eof = self.incoming_eof;
        let out = self.outgoing.clone();
        Ok(SplitStream {
            reader: Box::new(ChunkReader {
                rx: self.incoming,
                pending: Vec::new(),
                pos: 0,
                eof: false,
            }),
            writer: Box::new(ChunkWriter { tx: self.outgoing }),
            shutdown: Box::new(move || {
                let _ = eof.send(Vec::new());
                let _ = out.send(Vec::new());
            }),
        })
    }
}

struct ChunkReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.eof {
            return Ok(0);
        }
        if self.pos == self.pending.len() {
            match self.rx.recv() {
                Ok(chunk) if chunk.is_empty() => {
                    self.eof = true;
                    return Ok(0);
                }
                Ok(chunk) => {
                    self.pending = chunk;
                    self.pos = 0;
                }
                Err(_) => {
                    self.eof = true;
                    return Ok(0);
                }
            }
        }
        let n = usize::min(buf.len(), self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

struct ChunkWriter {
    tx: Sender<Vec<u8>>,
}

impl Write for ChunkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "broker session gone"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct SessionState {
    // channel -> next confirm sequence number, present once confirm.select
    confirms: HashMap<u16, u64>,
    // queue -> (channel, consumer tag)
    consumers: HashMap<String, (u16, String)>,
    delivery_tags: HashMap<u16, u64>,
    pending_publish: Option<PendingPublish>,
    my_queues: Vec<String>,
}

struct PendingPublish {
    channel: u16,
    routing_key: String,
    body_size: u64,
    body: Vec<u8>,
}

fn session_main(
    state: Arc<Mutex<BrokerState>>,
    from_client: Receiver<Vec<u8>>,
    to_client: Sender<Vec<u8>>,
) {
    let mut session = SessionState::default();
    let mut buf: Vec<u8> = Vec::new();
    let mut saw_preamble = false;

    'outer: loop {
        let chunk = match from_client.recv() {
            Ok(chunk) if !chunk.is_empty() => chunk,
            _ => break,
        };
        buf.extend_from_slice(&chunk);

        loop {
            if !saw_preamble {
                if buf.len() < 8 {
                    break;
                }
                buf.drain(..8);
                saw_preamble = true;
                send_method(
                    &to_client,
                    0,
                    AmqpConnection::Start(Start {
                        version_major: 0,
                        version_minor: 9,
                        server_properties: FieldTable::new(),
                        mechanisms: "PLAIN EXTERNAL".to_string(),
                        locales: "en_US".to_string(),
                    }),
                );
                continue;
            }
            if buf.len() < 7 {
                break;
            }
            let size = u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]) as usize;
            let total = size + 8;
            if buf.len() < total {
                break;
            }
            let frame = match parse_frame(&buf[..total]) {
                Ok((rest, frame)) if rest.is_empty() => frame,
                _ => break 'outer,
            };
            buf.drain(..total);
            if !handle_frame(&state, &mut session, &to_client, frame) {
                break 'outer;
            }
        }
    }

    // exclusive and server-named queues die with the connection
    let mut broker = state.lock().unwrap();
    for queue in &session.my_queues {
        broker.queues.remove(queue);
    }
}

fn handle_frame(
    state: &Arc<Mutex<BrokerState>>,
    session: &mut SessionState,
    out: &Sender<Vec<u8>>,
    frame: AMQPFrame,
) -> bool {
    match frame {
        AMQPFrame::Heartbeat(_) => true,
        AMQPFrame::Method(0, AMQPClass::Connection(method)) => match method {
            AmqpConnection::StartOk(_) => {
                send_method(
                    out,
                    0,
                    AmqpConnection::Tune(Tune {
                        channel_max: 2047,
                        frame_max: 1 << 17,
                        heartbeat: 0,
                    }),
                );
                true
            }
            AmqpConnection::TuneOk(_) => true,
            AmqpConnection::Open(_) => {
                send_method(
                    out,
                    0,
                    AmqpConnection::OpenOk(ConnectionOpenOk {
                        known_hosts: String::new(),
                    }),
                );
                true
            }
            AmqpConnection::Close(_) => {
                send_method(out, 0, AmqpConnection::CloseOk(ConnectionCloseOk {}));
                false
            }
            _ => true,
        },
        AMQPFrame::Method(channel, class) => handle_channel_method(state, session, out, channel, class),
        AMQPFrame::Header(_, _, header) => {
            let done = match session.pending_publish.as_mut() {
                Some(pending) => {
                    pending.body_size = header.body_size;
                    header.body_size == 0
                }
                None => false,
            };
            if done {
                complete_publish(state, session, out);
            }
            true
        }
        AMQPFrame::Body(_, payload) => {
            let done = match session.pending_publish.as_mut() {
                Some(pending) => {
                    pending.body.extend_from_slice(&payload);
                    pending.body.len() as u64 >= pending.body_size
                }
                None => false,
            };
            if done {
                complete_publish(state, session, out);
            }
            true
        }
        _ => true,
    }
}

fn handle_channel_method(
    state: &Arc<Mutex<BrokerState>>,
    session: &mut SessionState,
    out: &Sender<Vec<u8>>,
    channel: u16,
    class: AMQPClass,
) -> bool {
    match class {
        AMQPClass::Channel(AmqpChannel::Open(_)) => send_method(
            out,
            channel,
            AmqpChannel::OpenOk(ChannelOpenOk {
                channel_id: String::new(),
            }),
        ),
        AMQPClass::Channel(AmqpChannel::Close(_)) => {
            session.consumers.retain(|_, (ch, _)| *ch != channel);
            send_method(out, channel, AmqpChannel::CloseOk(ChannelCloseOk {}));
        }
        AMQPClass::Queue(AmqpQueue::Declare(declare)) => {
            let mut broker = state.lock().unwrap();
            let server_named = declare.queue.is_empty();
            let name = if server_named {
                let name = format!("amq.gen-{}", broker.name_counter);
                broker.name_counter += 1;
                name
            } else {
                declare.queue
            };
            let message_count = {
                let queue = broker.queues.entry(name.clone()).or_default();
                queue.len() as u32
            };
            drop(broker);
            if server_named || declare.exclusive {
                session.my_queues.push(name.clone());
            }
            send_method(
                out,
                channel,
                AmqpQueue::DeclareOk(QueueDeclareOk {
                    queue: name,
                    message_count,
                    consumer_count: 0,
                }),
            );
        }
        AMQPClass::Queue(AmqpQueue::Bind(_)) => {
            send_method(out, channel, AmqpQueue::BindOk(QueueBindOk {}))
        }
        AMQPClass::Queue(AmqpQueue::Unbind(_)) => {
            send_method(out, channel, AmqpQueue::UnbindOk(QueueUnbindOk {}))
        }
        AMQPClass::Queue(AmqpQueue::Purge(purge)) => {
            let mut broker = state.lock().unwrap();
            let purged = broker
                .queues
                .get_mut(&purge.queue)
                .map(|q| {
                    let n = q.len() as u32;
                    q.clear();
                    n
                })
                .unwrap_or(0);
            drop(broker);
            send_method(
                out,
                channel,
                AmqpQueue::PurgeOk(QueuePurgeOk {
                    message_count: purged,
                }),
            );
        }
        AMQPClass::Queue(AmqpQueue::Delete(delete)) => {
            let mut broker = state.lock().unwrap();
            let deleted = broker
                .queues
                .remove(&delete.queue)
                .map(|q| q.len() as u32)
                .unwrap_or(0);
            drop(broker);
            send_method(
                out,
                channel,
                AmqpQueue::DeleteOk(QueueDeleteOk {
                    message_count: deleted,
                }),
            );
        }
        AMQPClass::Exchange(AmqpExchange::Declare(_)) => {
            send_method(out, channel, AmqpExchange::DeclareOk(ExchangeDeclareOk {}))
        }
        AMQPClass::Exchange(AmqpExchange::Delete(_)) => {
            send_method(out, channel, AmqpExchange::DeleteOk(ExchangeDeleteOk {}))
        }
        AMQPClass::Exchange(AmqpExchange::Bind(_)) => {
            send_method(out, channel, AmqpExchange::BindOk(ExchangeBindOk {}))
        }
        AMQPClass::Exchange(AmqpExchange::Unbind(_)) => {
            send_method(out, channel, AmqpExchange::UnbindOk(ExchangeUnbindOk {}))
        }
        AMQPClass::Basic(AmqpBasic::Qos(_)) => {
            send_method(out, channel, AmqpBasic::QosOk(QosOk {}))
        }
        AMQPClass::Basic(AmqpBasic::Consume(consume)) => {
            let tag = if consume.consumer_tag.is_empty() {
                let mut broker = state.lock().unwrap();
                let tag = format!("ctag-{}", broker.tag_counter);
                broker.tag_counter += 1;
                tag
            } else {
                consume.consumer_tag
            };
            session
                .consumers
                .insert(consume.queue.clone(), (channel, tag.clone()));
            send_method(
                out,
                channel,
                AmqpBasic::ConsumeOk(ConsumeOk {
                    consumer_tag: tag.clone(),
                }),
            );
            // backlogged messages flow as soon as the consumer exists
            let backlog: Vec<Vec<u8>> = {
                let mut broker = state.lock().unwrap();
                broker
                    .queues
                    .get_mut(&consume.queue)
                    .map(|q| q.drain(..).collect())
                    .unwrap_or_default()
            };
            for body in backlog {
                deliver(session, out, channel, &tag, &consume.queue, body);
            }
        }
        AMQPClass::Basic(AmqpBasic::Cancel(cancel)) => {
            session.consumers.retain(|_, (_, tag)| *tag != cancel.consumer_tag);
            send_method(
                out,
                channel,
                AmqpBasic::CancelOk(CancelOk {
                    consumer_tag: cancel.consumer_tag,
                }),
            );
        }
        AMQPClass::Basic(AmqpBasic::Publish(publish)) => {
            session.pending_publish = Some(PendingPublish {
                channel,
                routing_key: publish.routing_key,
                body_size: 0,
                body: Vec::new(),
            });
        }
        AMQPClass::Basic(AmqpBasic::Get(get)) => {
            let popped = {
                let mut broker = state.lock().unwrap();
                broker
                    .queues
                    .get_mut(&get.queue)
                    .and_then(|q| q.pop_front().map(|body| (body, q.len() as u32)))
            };
            match popped {
                Some((body, remaining)) => {
                    let tag = next_delivery_tag(session, channel);
                    let mut buf = OutputBuffer::empty();
                    buf.push_method(
                        channel,
                        AmqpBasic::GetOk(GetOk {
                            delivery_tag: tag,
                            redelivered: false,
                            exchange: String::new(),
                            routing_key: get.queue,
                            message_count: remaining,
                        }),
                    )
                    .unwrap();
                    push_content(&mut buf, channel, &body);
                    let _ = out.send(buf.as_ref().to_vec());
                }
                None => send_method(
                    out,
                    channel,
                    AmqpBasic::GetEmpty(GetEmpty {
                        cluster_id: String::new(),
                    }),
                ),
            }
        }
        AMQPClass::Basic(AmqpBasic::Ack(_))
        | AMQPClass::Basic(AmqpBasic::Nack(_))
        | AMQPClass::Basic(AmqpBasic::Reject(_)) => (),
        AMQPClass::Confirm(AmqpConfirm::Select(_)) => {
            session.confirms.insert(channel, 1);
            send_method(out, channel, AmqpConfirm::SelectOk(ConfirmSelectOk {}));
        }
        AMQPClass::Tx(AmqpTx::Select(_)) => {
            send_method(out, channel, AmqpTx::SelectOk(TxSelectOk {}))
        }
        AMQPClass::Tx(AmqpTx::Commit(_)) => {
            send_method(out, channel, AmqpTx::CommitOk(TxCommitOk {}))
        }
        AMQPClass::Tx(AmqpTx::Rollback(_)) => {
            send_method(out, channel, AmqpTx::RollbackOk(TxRollbackOk {}))
        }
        _ => (),
    }
    true
}

fn complete_publish(
    state: &Arc<Mutex<BrokerState>>,
    session: &mut SessionState,
    out: &Sender<Vec<u8>>,
) {
    let pending = match session.pending_publish.take() {
        Some(pending) => pending,
        None => return,
    };

    match session.consumers.get(&pending.routing_key).cloned() {
        Some((consumer_channel, tag)) => {
            deliver(
                session,
                out,
                consumer_channel,
                &tag,
                &pending.routing_key,
                pending.body,
            );
        }
        None => {
            let mut broker = state.lock().unwrap();
            broker
                .queues
                .entry(pending.routing_key.clone())
                .or_default()
                .push_back(pending.body);
        }
    }

    if let Some(seq) = session.confirms.get_mut(&pending.channel) {
        let delivery_tag = *seq;
        *seq += 1;
        send_method(
            out,
            pending.channel,
            AmqpBasic::Ack(amq_protocol::protocol::basic::Ack {
                delivery_tag,
                multiple: false,
            }),
        );
    }
}

fn deliver(
    session: &mut SessionState,
    out: &Sender<Vec<u8>>,
    channel: u16,
    consumer_tag: &str,
    queue: &str,
    body: Vec<u8>,
) {
    let delivery_tag = next_delivery_tag(session, channel);
    let mut buf = OutputBuffer::empty();
    buf.push_method(
        channel,
        AmqpBasic::Deliver(Deliver {
            consumer_tag: consumer_tag.to_string(),
            delivery_tag,
            redelivered: false,
            exchange: String::new(),
            routing_key: queue.to_string(),
        }),
    )
    .unwrap();
    push_content(&mut buf, channel, &body);
    let _ = out.send(buf.as_ref().to_vec());
}

fn next_delivery_tag(session: &mut SessionState, channel: u16) -> u64 {
    let tag = session.delivery_tags.entry(channel).or_insert(1);
    let current = *tag;
    *tag += 1;
    current
}

fn push_content(buf: &mut OutputBuffer, channel: u16, body: &[u8]) {
    buf.push_content_header(
        channel,
        Deliver::get_class_id(),
        body.len(),
        &crate::AmqpProperties::default(),
    )
    .unwrap();
    if !body.is_empty() {
        buf.push_content_body(channel, body).unwrap();
    }
}

fn send_method<M: IntoAmqpClass>(out: &Sender<Vec<u8>>, channel: u16, method: M) {
    let mut buf = OutputBuffer::empty();
    buf.push_method(channel, method).unwrap();
    let _ = out.send(buf.as_ref().to_vec());
}
