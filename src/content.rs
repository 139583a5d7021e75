use crate::errors::*;
use crate::{Delivery, Get, Return};
use amq_protocol::frame::AMQPContentHeader;
use amq_protocol::protocol::basic::Deliver;
use amq_protocol::protocol::basic::GetOk;
use amq_protocol::protocol::basic::Return as AmqpReturn;

/// The method frame that opened a content sequence.
pub(crate) enum ContentStart {
    Deliver(Deliver),
    Return(AmqpReturn),
    GetOk(GetOk),
}

/// A fully reassembled content: the method, its properties, and a body built
/// from however many body frames the declared size required.
#[derive(Debug)]
pub(crate) enum CollectedContent {
    Delivery {
        consumer_tag: String,
        delivery: Delivery,
    },
    Return(Return),
    Get(Get),
}

enum Phase {
    Start(ContentStart),
    Body {
        start: ContentStart,
        header: AMQPContentHeader,
        buf: Vec<u8>,
    },
}

/// Per-channel reassembly state for the reader thread.
///
/// AMQP interleaves content frames per channel but never within one: after a
/// content-carrying method we must see exactly one header frame and then body
/// frames until the declared size is reached. Anything else is a protocol
/// error.
pub(crate) struct ContentCollector {
    phase: Option<Phase>,
    recovery_epoch: u64,
}

impl ContentCollector {
    pub(crate) fn new(recovery_epoch: u64) -> ContentCollector {
        ContentCollector {
            phase: None,
            recovery_epoch,
        }
    }

    pub(crate) fn collect_method(&mut self, start: ContentStart) -> Result<()> {
        match self.phase.take() {
            None => {
                self.phase = Some(Phase::Start(start));
                Ok(())
            }
            Some(_) => FrameUnexpectedSnafu.fail(),
        }
    }

    pub(crate) fn collect_header(
        &mut self,
        header: AMQPContentHeader,
    ) -> Result<Option<CollectedContent>> {
        match self.phase.take() {
            Some(Phase::Start(start)) => {
                if header.body_size == 0 {
                    return Ok(Some(self.finish(start, header, Vec::new())));
                }
                let buf = Vec::with_capacity(header.body_size as usize);
                self.phase = Some(Phase::Body { start, header, buf });
                Ok(None)
            }
            _ => FrameUnexpectedSnafu.fail(),
        }
    }

    pub(crate) fn collect_body(&mut self, mut body: Vec<u8>) -> Result<Option<CollectedContent>> {
        match self.phase.take() {
            Some(Phase::Body {
                start,
                header,
                mut buf,
            }) => {
                let body_size = header.body_size as usize;
                buf.append(&mut body);
                if buf.len() == body_size {
                    Ok(Some(self.finish(start, header, buf)))
                } else if buf.len() < body_size {
                    self.phase = Some(Phase::Body { start, header, buf });
                    Ok(None)
                } else {
                    FrameUnexpectedSnafu.fail()
                }
            }
            _ => FrameUnexpectedSnafu.fail(),
        }
    }

    fn finish(
        &self,
        start: ContentStart,
        header: AMQPContentHeader,
        buf: Vec<u8>,
    ) -> CollectedContent {
        match start {
            ContentStart::Deliver(deliver) => {
                let (consumer_tag, delivery) =
                    Delivery::new(deliver, buf, header.properties, self.recovery_epoch);
                CollectedContent::Delivery {
                    consumer_tag,
                    delivery,
                }
            }
            ContentStart::Return(ret) => {
                CollectedContent::Return(Return::new(ret, buf, header.properties))
            }
            ContentStart::GetOk(get_ok) => {
                let message_count = get_ok.message_count;
                let delivery =
                    Delivery::new_get_ok(get_ok, buf, header.properties, self.recovery_epoch);
                CollectedContent::Get(Get {
                    delivery,
                    message_count,
                })
            }
        }
    }
}
