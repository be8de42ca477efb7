//! Byte-level framing of the EventSocket wire format.
//!
//! The framer only understands "read a header block, then maybe read N
//! exact bytes of body" — it has no notion of command replies, events, or
//! `text/event-plain` nesting. That demultiplexing happens one layer up,
//! in the dispatcher that owns a decoded [`Message`](crate::message::Message).

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use crate::error::{Error, Result};
use crate::message::{HeaderMap, Message};

enum State {
    AwaitHeaders,
    AwaitBody { headers: HeaderMap, content_length: usize },
}

/// A [`Decoder`] that turns a byte stream into a sequence of [`Message`]s.
pub(crate) struct Framer {
    state: State,
}

impl Framer {
    pub(crate) fn new() -> Framer {
        Framer {
            state: State::AwaitHeaders,
        }
    }
}

impl Decoder for Framer {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        loop {
            match &self.state {
                State::AwaitHeaders => match Message::parse_head(src)? {
                    None => return Ok(None),
                    Some((headers, consumed)) => {
                        let content_length = headers.content_length()?;
                        src.advance(consumed);
                        self.state = State::AwaitBody { headers, content_length };
                    }
                },
                State::AwaitBody { content_length, .. } => {
                    if src.len() < *content_length {
                        return Ok(None);
                    }
                    let body = src.split_to(*content_length).freeze();
                    let headers = match std::mem::replace(&mut self.state, State::AwaitHeaders) {
                        State::AwaitBody { headers, .. } => headers,
                        State::AwaitHeaders => unreachable!(),
                    };
                    return Ok(Some(Message::new(headers, body)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_headers_only_frame() {
        let mut framer = Framer::new();
        let mut buf = BytesMut::from(&b"Content-Type: command/reply\nReply-Text: +OK\n\n"[..]);
        let msg = framer.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.header("Reply-Text"), Some("+OK"));
        assert!(msg.body.is_empty());
    }

    #[test]
    fn waits_for_full_body() {
        let mut framer = Framer::new();
        let mut buf = BytesMut::from(&b"Content-Type: api/response\nContent-Length: 5\n\nhel"[..]);
        assert!(framer.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"lo");
        let msg = framer.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&msg.body[..], b"hello");
    }

    #[test]
    fn decodes_back_to_back_frames_from_one_buffer() {
        let mut framer = Framer::new();
        let mut buf = BytesMut::from(
            &b"Content-Type: command/reply\nReply-Text: +OK\n\nContent-Type: command/reply\nReply-Text: +OK\n\n"[..],
        );
        assert!(framer.decode(&mut buf).unwrap().is_some());
        assert!(framer.decode(&mut buf).unwrap().is_some());
        assert!(framer.decode(&mut buf).unwrap().is_none());
    }
}
