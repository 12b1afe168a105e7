// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Coordinator control channel.
//!
//! A nonblocking TCP stream with a buffered write queue. Reads feed the
//! stream parser; completed frames are handed to the shared message FIFO.
//! Stream failure is fatal for the worker.

use std::io::{self, Read, Write};
use std::net::SocketAddr;

use mio::net::TcpStream;

use crate::protocol::codec::{MessageParser, TcpMessageParser};

/// Buffered, nonblocking link to the coordinator.
#[derive(Debug)]
pub struct CoordinatorLink {
    stream: TcpStream,
    parser: TcpMessageParser,
    write_buffer: Vec<u8>,
}

impl CoordinatorLink {
    /// Begin a nonblocking connect; the stream becomes writable once the
    /// connection is established.
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        log::info!("[COORD] connecting to {}", addr);
        Ok(Self {
            stream,
            parser: TcpMessageParser::new(),
            write_buffer: Vec::new(),
        })
    }

    /// Mutable stream handle for reactor registration.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Queue one encoded frame for transmission.
    pub fn enqueue_write(&mut self, frame: Vec<u8>) {
        self.write_buffer.extend_from_slice(&frame);
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.write_buffer.is_empty()
    }

    /// Write as much of the buffer as the socket accepts.
    pub fn flush(&mut self) -> io::Result<()> {
        while !self.write_buffer.is_empty() {
            match self.stream.write(&self.write_buffer) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "coordinator stream closed",
                    ))
                }
                Ok(written) => {
                    self.write_buffer.drain(..written);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                // Connect still in progress.
                Err(err) if err.kind() == io::ErrorKind::NotConnected => break,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Drain readable bytes into the stream parser; completed frames move
    /// to `out`. Returns false when the coordinator closed the stream.
    pub fn read_into(&mut self, out: &mut MessageParser) -> io::Result<bool> {
        let mut buf = [0u8; 16 * 1024];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    log::info!("[COORD] stream closed by coordinator");
                    return Ok(false);
                }
                Ok(read) => self.parser.parse(&buf[..read]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            }
        }
        while let Some(message) = self.parser.pop() {
            out.push(message);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Message, OpCode};
    use std::net::TcpListener;

    #[test]
    fn test_link_round_trip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener");
        let addr = listener.local_addr().expect("addr");

        let mut link = CoordinatorLink::connect(addr).expect("connect");
        let (mut server, _) = listener.accept().expect("accept");

        // Worker -> coordinator.
        link.enqueue_write(Message::new(0, OpCode::Hey, b"stream".to_vec()).encode());
        assert!(link.has_pending_writes());
        for _ in 0..50 {
            link.flush().expect("flush");
            if !link.has_pending_writes() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert!(!link.has_pending_writes());

        let mut received = vec![0u8; 64];
        let n = server.read(&mut received).expect("server read");
        let (msg, _) = Message::decode(&received[..n]).expect("decode");
        assert_eq!(msg.opcode, OpCode::Hey);

        // Coordinator -> worker, split across two writes.
        let frame = Message::new(0, OpCode::Bye, Vec::new()).encode();
        server.write_all(&frame[..5]).expect("write head");
        server.write_all(&frame[5..]).expect("write tail");
        server.flush().expect("server flush");

        let mut parser = MessageParser::new();
        for _ in 0..100 {
            assert!(link.read_into(&mut parser).expect("read"));
            if !parser.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        let msg = parser.pop().expect("frame reassembled across reads");
        assert_eq!(msg.opcode, OpCode::Bye);
    }

    #[test]
    fn test_read_reports_closed_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener");
        let addr = listener.local_addr().expect("addr");

        let mut link = CoordinatorLink::connect(addr).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        drop(server);

        let mut parser = MessageParser::new();
        let mut saw_close = false;
        for _ in 0..100 {
            match link.read_into(&mut parser) {
                Ok(true) => std::thread::sleep(std::time::Duration::from_millis(1)),
                Ok(false) => {
                    saw_close = true;
                    break;
                }
                // Connection reset also counts as closed for this test.
                Err(_) => {
                    saw_close = true;
                    break;
                }
            }
        }
        assert!(saw_close, "EOF must be reported");
    }
}
