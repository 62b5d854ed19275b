use crate::parser::Parser;
use std::io::{self, Read};

/// Reads chunks from a connection and feeds them to a [`Parser`].
///
/// A read returning zero bytes means the peer closed the connection; the
/// receiver remembers that and reports it through [`Receiver::is_closed`].
pub struct Receiver<R: Read> {
    reader: R,
    chunk: Box<[u8]>,
    bytes_received: u64,
    closed: bool,
}

impl<R: Read> Receiver<R> {
    pub fn new(reader: R, chunk_size: usize) -> Receiver<R> {
        assert!(chunk_size > 0);
        Receiver {
            reader,
            chunk: vec![0; chunk_size].into_boxed_slice(),
            bytes_received: 0,
            closed: false,
        }
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Reads one chunk. An empty slice means end of stream.
    pub fn receive(&mut self) -> io::Result<&[u8]> {
        if self.closed {
            return Ok(&[]);
        }

        let n = loop {
            match self.reader.read(&mut self.chunk) {
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        if n == 0 {
            self.closed = true;
        }
        self.bytes_received += n as u64;
        Ok(&self.chunk[..n])
    }

    /// Reads one chunk into `parser`, returning the number of bytes read.
    /// Zero means end of stream.
    pub fn receive_into(&mut self, parser: &mut Parser) -> io::Result<usize> {
        let chunk = self.receive()?;
        parser.feed(chunk);
        Ok(chunk.len())
    }
}
