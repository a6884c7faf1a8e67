use crate::errors::*;
use crate::wire::AmqpFrame;
use bytes::{Buf, BytesMut};
use log::trace;
use snafu::ResultExt;
use std::io;
use std::marker::PhantomData;

// Smallest amount of capacity to reserve before reading from the stream.
const MIN_READ: usize = 4096;

pub struct FrameBuffer(Inner<AmqpFrameKind>);

impl FrameBuffer {
    pub fn new() -> FrameBuffer {
        FrameBuffer(Inner::new())
    }

    /// Cap the size of frames we will accept; a frame above the cap is a
    /// framing error that terminates the connection. Set once the frame-max
    /// has been negotiated.
    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.0.max_frame_size = Some(max_frame_size);
    }

    pub fn read_from<S, F>(&mut self, stream: &mut S, handler: F) -> Result<usize>
    where
        S: io::Read,
        F: FnMut(AmqpFrame) -> Result<()>,
    {
        self.0.read_from(stream, handler)
    }
}

// Dep. injection helper primarily for unit testing.
trait FrameKind {
    type Frame;

    // Should return None if not enough data is available to know the size of
    // the next frame, or Some(n) if the next frame requires n bytes.
    fn parse_size(buf: &[u8]) -> Option<usize>;

    // Attempt to parse a frame. Will only be called if parse_size() already
    // returned Some(n), and buf will have length exactly n.
    fn parse_frame(buf: &[u8]) -> Result<Self::Frame>;
}

// Standard FrameKind - parses AMQP frames.
enum AmqpFrameKind {}

impl FrameKind for AmqpFrameKind {
    type Frame = AmqpFrame;

    fn parse_size(buf: &[u8]) -> Option<usize> {
        AmqpFrame::parse_size(buf)
    }

    fn parse_frame(buf: &[u8]) -> Result<AmqpFrame> {
        AmqpFrame::parse(buf).map_err(|err| MalformedFrameSnafu { reason: err.0 }.build())
    }
}

struct Inner<Kind: FrameKind> {
    buf: BytesMut,
    max_frame_size: Option<usize>,
    phantom: PhantomData<Kind>,
}

impl<Kind: FrameKind> Inner<Kind> {
    fn new() -> Inner<Kind> {
        Inner {
            buf: BytesMut::with_capacity(2 * MIN_READ),
            max_frame_size: None,
            phantom: PhantomData,
        }
    }

    fn read_from<S, F>(&mut self, stream: &mut S, mut handler: F) -> Result<usize>
    where
        S: io::Read,
        F: FnMut(Kind::Frame) -> Result<()>,
    {
        let mut bytes_read = 0;

        loop {
            let frame_size = Kind::parse_size(&self.buf);
            let mut reserve = MIN_READ;

            // if we already have enough data buffered to read a frame, do
            // that before trying to read from the stream.
            if let Some(frame_size) = frame_size {
                if let Some(max) = self.max_frame_size {
                    if frame_size > max {
                        return FrameTooLargeSnafu {
                            size: frame_size,
                            frame_max: max,
                        }
                        .fail();
                    }
                }
                if self.buf.len() >= frame_size {
                    let frame = Kind::parse_frame(&self.buf[..frame_size])?;
                    handler(frame)?;
                    self.buf.advance(frame_size);
                    continue;
                } else {
                    // not enough data, but we know how much we need; try to
                    // read at least the remainder in one pass
                    reserve = usize::max(MIN_READ, frame_size - self.buf.len());
                }
            }

            // need to read more data from the stream to get to a frame
            let old_len = self.buf.len();
            self.buf.resize(old_len + reserve, 0);
            let read_result = stream.read(&mut self.buf[old_len..]);
            match read_result {
                Ok(0) => {
                    self.buf.truncate(old_len);
                    return UnexpectedSocketCloseSnafu.fail();
                }
                Ok(n) => {
                    self.buf.truncate(old_len + n);
                    trace!("read {} bytes", n);
                    bytes_read += n;
                }
                Err(err) => {
                    self.buf.truncate(old_len);
                    match err.kind() {
                        io::ErrorKind::WouldBlock => return Ok(bytes_read),
                        _ => return Err(err).context(IoErrorReadingSocketSnafu),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FrameKind, Inner};
    use crate::errors::*;
    use mockstream::FailingMockStream;
    use std::io::{self, Cursor, Read};

    struct FakeFrameKind {}

    impl FrameKind for FakeFrameKind {
        type Frame = Vec<u8>;

        fn parse_size(buf: &[u8]) -> Option<usize> {
            if buf.len() >= 2 {
                Some(buf[1] as usize)
            } else {
                None
            }
        }

        fn parse_frame(buf: &[u8]) -> Result<Self::Frame> {
            assert!(buf.len() == buf[1] as usize);
            if buf.len() == 6 && &buf[2..] == b"fail" {
                MalformedFrameSnafu { reason: "fake" }.fail()
            } else {
                Ok(Vec::from(buf))
            }
        }
    }

    fn make_buffer() -> Inner<FakeFrameKind> {
        Inner::new()
    }

    fn would_block() -> FailingMockStream {
        FailingMockStream::new(io::ErrorKind::WouldBlock, "", 1)
    }

    #[test]
    fn full_frame_available() {
        let frame0 = b"a\x04aa";
        let mut c = Cursor::new(frame0).chain(would_block());

        let mut got = None;
        let mut buf = make_buffer();
        let n = buf
            .read_from(&mut c, |f| {
                got = Some(f);
                Ok(())
            })
            .unwrap();

        assert_eq!(n, 4);
        assert_eq!(got, Some(Vec::from(&frame0[..])));
    }

    #[test]
    fn two_full_frames_available() {
        let frame0 = b"a\x04aa";
        let frame1 = b"b\x04bb";
        let mut c = Cursor::new(frame0)
            .chain(Cursor::new(frame1))
            .chain(would_block());

        let mut got = Vec::new();
        let mut buf = make_buffer();
        let n = buf.read_from(&mut c, |f| Ok(got.push(f))).unwrap();

        assert_eq!(n, 8);
        assert_eq!(got, vec![Vec::from(&frame0[..]), Vec::from(&frame1[..])]);
    }

    #[test]
    fn partial_first_frame() {
        let mut c = Cursor::new(b"a\x04")
            .chain(would_block())
            .chain(Cursor::new(b"aa"))
            .chain(would_block());

        let mut got = None;
        let mut buf = make_buffer();
        let n = buf
            .read_from(&mut c, |f| {
                got = Some(f);
                Ok(())
            })
            .unwrap();
        assert_eq!(n, 2);
        assert!(got.is_none());

        let n = buf
            .read_from(&mut c, |f| {
                got = Some(f);
                Ok(())
            })
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(got, Some(Vec::from("a\x04aa".as_bytes())));
    }

    #[test]
    fn split_frames() {
        let mut c = Cursor::new(b"a\x04")
            .chain(would_block())
            .chain(Cursor::new(b"aab\x04b"))
            .chain(would_block())
            .chain(Cursor::new(b"bc\x04"))
            .chain(would_block());

        let mut got = Vec::new();
        let mut buf = make_buffer();
        let n = buf.read_from(&mut c, |f| Ok(got.push(f))).unwrap();
        assert_eq!(n, 2);
        assert!(got.is_empty());

        let n = buf.read_from(&mut c, |f| Ok(got.push(f))).unwrap();
        assert_eq!(n, 5);
        assert_eq!(got, vec![Vec::from("a\x04aa".as_bytes())]);

        let n = buf.read_from(&mut c, |f| Ok(got.push(f))).unwrap();
        assert_eq!(n, 3);
        assert_eq!(
            got,
            vec![
                Vec::from("a\x04aa".as_bytes()),
                Vec::from("b\x04bb".as_bytes())
            ]
        );
    }

    #[test]
    fn parse_fail() {
        let mut c = Cursor::new(b"x\x06fail").chain(would_block());

        let mut buf = make_buffer();
        let res = buf.read_from(&mut c, |_| panic!("should not be called"));
        match res.unwrap_err() {
            Error::MalformedFrame { .. } => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn callback_fail() {
        let mut c = Cursor::new(b"a\x04aa").chain(would_block());

        let mut buf = make_buffer();
        let res = buf.read_from(&mut c, |_| FrameUnexpectedSnafu.fail());
        match res.unwrap_err() {
            Error::FrameUnexpected => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut c = Cursor::new(b"a\x09aaaaaaa").chain(would_block());

        let mut buf = make_buffer();
        buf.max_frame_size = Some(8);
        let res = buf.read_from(&mut c, |_| panic!("should not be called"));
        match res.unwrap_err() {
            Error::FrameTooLarge {
                size: 9,
                frame_max: 8,
            } => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn frame_of_exactly_max_size_accepted() {
        let mut c = Cursor::new(b"a\x08aaaaaa").chain(would_block());

        let mut got = None;
        let mut buf = make_buffer();
        buf.max_frame_size = Some(8);
        buf.read_from(&mut c, |f| {
            got = Some(f);
            Ok(())
        })
        .unwrap();
        assert_eq!(got, Some(Vec::from(&b"a\x08aaaaaa"[..])));
    }

    #[test]
    fn eof_fail() {
        let mut c = Cursor::new(b"a\x04a");

        let mut buf = make_buffer();
        let res = buf.read_from(&mut c, |_| panic!("should not be called"));
        match res.unwrap_err() {
            Error::UnexpectedSocketClose => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn io_fail() {
        let mut c = Cursor::new(b"a\x04a").chain(FailingMockStream::new(
            io::ErrorKind::ConnectionReset,
            "",
            1,
        ));

        let mut buf = make_buffer();
        let res = buf.read_from(&mut c, |_| panic!("should not be called"));
        match res.unwrap_err() {
            Error::IoErrorReadingSocket { .. } => (),
            err => panic!("unexpected error {}", err),
        }
    }
}
