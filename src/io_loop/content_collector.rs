use crate::errors::*;
use crate::wire::method::basic::{Deliver, GetOk, Return as AmqpReturn};
use crate::wire::{AmqpProperties, ContentHeader};
use crate::{Delivery, Get, Return};

/// Reassembles HEADER + BODY frame sequences into complete messages for one
/// channel. Exactly one content sequence can be in flight per channel; any
/// interleaved method or body overrun is a connection-fatal framing error.
pub(super) struct ContentCollector {
    max_body_size: u64,
    kind: Option<Kind>,
}

pub(super) enum CollectorResult {
    Delivery((String, Delivery)),
    Return(Return),
    Get(Get),
}

impl ContentCollector {
    pub(super) fn new(max_body_size: u64) -> ContentCollector {
        ContentCollector {
            max_body_size,
            kind: None,
        }
    }

    pub(super) fn collect_deliver(&mut self, deliver: Deliver) -> Result<()> {
        match self.kind.take() {
            None => {
                self.kind = Some(Kind::Delivery(State::Start(deliver)));
                Ok(())
            }
            Some(_) => FrameUnexpectedSnafu.fail(),
        }
    }

    pub(super) fn collect_return(&mut self, return_: AmqpReturn) -> Result<()> {
        match self.kind.take() {
            None => {
                self.kind = Some(Kind::Return(State::Start(return_)));
                Ok(())
            }
            Some(_) => FrameUnexpectedSnafu.fail(),
        }
    }

    pub(super) fn collect_get(&mut self, get_ok: GetOk) -> Result<()> {
        match self.kind.take() {
            None => {
                self.kind = Some(Kind::Get(State::Start(get_ok)));
                Ok(())
            }
            Some(_) => FrameUnexpectedSnafu.fail(),
        }
    }

    /// True if a content-bearing method is waiting for its header/body.
    /// Non-content frames arriving while this is true are framing errors.
    pub(super) fn mid_content(&self) -> bool {
        self.kind.is_some()
    }

    pub(super) fn collect_header(&mut self, header: ContentHeader) -> Result<Option<CollectorResult>> {
        if header.body_size > self.max_body_size {
            return MessageTooLargeSnafu {
                body_size: header.body_size,
                limit: self.max_body_size,
            }
            .fail();
        }
        match self.kind.take() {
            Some(Kind::Delivery(state)) => match state.collect_header(header)? {
                Content::Done((tag, delivery)) => Ok(Some(CollectorResult::Delivery((tag, delivery)))),
                Content::NeedMore(state) => {
                    self.kind = Some(Kind::Delivery(state));
                    Ok(None)
                }
            },
            Some(Kind::Return(state)) => match state.collect_header(header)? {
                Content::Done(return_) => Ok(Some(CollectorResult::Return(return_))),
                Content::NeedMore(state) => {
                    self.kind = Some(Kind::Return(state));
                    Ok(None)
                }
            },
            Some(Kind::Get(state)) => match state.collect_header(header)? {
                Content::Done(get) => Ok(Some(CollectorResult::Get(get))),
                Content::NeedMore(state) => {
                    self.kind = Some(Kind::Get(state));
                    Ok(None)
                }
            },
            None => FrameUnexpectedSnafu.fail(),
        }
    }

    pub(super) fn collect_body(&mut self, body: Vec<u8>) -> Result<Option<CollectorResult>> {
        match self.kind.take() {
            Some(Kind::Delivery(state)) => match state.collect_body(body)? {
                Content::Done((tag, delivery)) => Ok(Some(CollectorResult::Delivery((tag, delivery)))),
                Content::NeedMore(state) => {
                    self.kind = Some(Kind::Delivery(state));
                    Ok(None)
                }
            },
            Some(Kind::Return(state)) => match state.collect_body(body)? {
                Content::Done(return_) => Ok(Some(CollectorResult::Return(return_))),
                Content::NeedMore(state) => {
                    self.kind = Some(Kind::Return(state));
                    Ok(None)
                }
            },
            Some(Kind::Get(state)) => match state.collect_body(body)? {
                Content::Done(get) => Ok(Some(CollectorResult::Get(get))),
                Content::NeedMore(state) => {
                    self.kind = Some(Kind::Get(state));
                    Ok(None)
                }
            },
            None => FrameUnexpectedSnafu.fail(),
        }
    }

}

enum Kind {
    Delivery(State<Delivery>),
    Return(State<Return>),
    Get(State<Get>),
}

trait ContentType {
    type Start;
    type Finish;

    fn assemble(start: Self::Start, buf: Vec<u8>, properties: AmqpProperties) -> Self::Finish;
}

impl ContentType for Delivery {
    type Start = Deliver;
    type Finish = (String, Delivery);

    fn assemble(start: Deliver, buf: Vec<u8>, properties: AmqpProperties) -> Self::Finish {
        Delivery::new(start, buf, properties)
    }
}

impl ContentType for Return {
    type Start = AmqpReturn;
    type Finish = Return;

    fn assemble(start: AmqpReturn, buf: Vec<u8>, properties: AmqpProperties) -> Self::Finish {
        Return::new(start, buf, properties)
    }
}

impl ContentType for Get {
    type Start = GetOk;
    type Finish = Get;

    fn assemble(get_ok: GetOk, buf: Vec<u8>, properties: AmqpProperties) -> Self::Finish {
        let message_count = get_ok.message_count;
        let delivery = Delivery::new_get_ok(get_ok, buf, properties);
        Get {
            delivery,
            message_count,
        }
    }
}

enum Content<T: ContentType> {
    Done(T::Finish),
    NeedMore(State<T>),
}

// Clippy warns about State::Body being much larger than the other variant,
// but we expect almost all instances of State to transition to Body.
#[allow(clippy::large_enum_variant)]
enum State<T: ContentType> {
    Start(T::Start),
    Body(T::Start, ContentHeader, Vec<u8>),
}

impl<T: ContentType> State<T> {
    fn collect_header(self, header: ContentHeader) -> Result<Content<T>> {
        match self {
            State::Start(start) => {
                if header.body_size == 0 {
                    Ok(Content::Done(T::assemble(start, Vec::new(), header.properties)))
                } else {
                    let buf = Vec::with_capacity(header.body_size as usize);
                    Ok(Content::NeedMore(State::Body(start, header, buf)))
                }
            }
            State::Body(_, _, _) => FrameUnexpectedSnafu.fail(),
        }
    }

    fn collect_body(self, mut body: Vec<u8>) -> Result<Content<T>> {
        match self {
            State::Body(start, header, mut buf) => {
                let body_size = header.body_size as usize;
                buf.append(&mut body);
                if buf.len() == body_size {
                    Ok(Content::Done(T::assemble(start, buf, header.properties)))
                } else if buf.len() < body_size {
                    Ok(Content::NeedMore(State::Body(start, header, buf)))
                } else {
                    // body overran the announced size - framing error
                    FrameUnexpectedSnafu.fail()
                }
            }
            State::Start(_) => FrameUnexpectedSnafu.fail(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deliver() -> Deliver {
        Deliver {
            consumer_tag: "ctag".to_string(),
            delivery_tag: 1,
            redelivered: false,
            exchange: String::new(),
            routing_key: "rk".to_string(),
        }
    }

    fn header(body_size: u64) -> ContentHeader {
        ContentHeader {
            class_id: 60,
            body_size,
            properties: AmqpProperties::default(),
        }
    }

    #[test]
    fn body_reassembled_across_fragments() {
        let mut collector = ContentCollector::new(1024);
        collector.collect_deliver(deliver()).unwrap();
        assert!(collector.collect_header(header(6)).unwrap().is_none());
        assert!(collector.collect_body(b"abc".to_vec()).unwrap().is_none());
        match collector.collect_body(b"def".to_vec()).unwrap() {
            Some(CollectorResult::Delivery((tag, delivery))) => {
                assert_eq!(tag, "ctag");
                assert_eq!(delivery.content, b"abcdef");
            }
            _ => panic!("expected completed delivery"),
        }
        assert!(!collector.mid_content());
    }

    #[test]
    fn zero_length_body_completes_on_header() {
        let mut collector = ContentCollector::new(1024);
        collector.collect_deliver(deliver()).unwrap();
        match collector.collect_header(header(0)).unwrap() {
            Some(CollectorResult::Delivery((_, delivery))) => {
                assert!(delivery.content.is_empty())
            }
            _ => panic!("expected completed delivery"),
        }
    }

    #[test]
    fn body_overrun_is_framing_error() {
        let mut collector = ContentCollector::new(1024);
        collector.collect_deliver(deliver()).unwrap();
        collector.collect_header(header(2)).unwrap();
        match collector.collect_body(b"abc".to_vec()) {
            Err(Error::FrameUnexpected) => (),
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn header_without_method_is_framing_error() {
        let mut collector = ContentCollector::new(1024);
        assert!(collector.collect_header(header(1)).is_err());
    }

    #[test]
    fn second_method_mid_content_is_framing_error() {
        let mut collector = ContentCollector::new(1024);
        collector.collect_deliver(deliver()).unwrap();
        assert!(collector.mid_content());
        assert!(collector.collect_deliver(deliver()).is_err());
    }

    #[test]
    fn oversized_body_rejected_at_header() {
        let mut collector = ContentCollector::new(8);
        collector.collect_deliver(deliver()).unwrap();
        match collector.collect_header(header(9)) {
            Err(Error::MessageTooLarge {
                body_size: 9,
                limit: 8,
            }) => (),
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
    }
}
