use mio::net::TcpStream;
use mio::Evented;
use std::io::{Read, Write};

/// The byte-stream transport seam. The core only needs a readable/writable,
/// poll-registerable stream; TCP is provided, TLS implementations plug in
/// from outside.
pub trait IoStream: Read + Write + Evented + Send + 'static {}

impl IoStream for TcpStream {}
