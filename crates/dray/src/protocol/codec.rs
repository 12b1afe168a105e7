// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Datagram and stream parsers.
//!
//! [`MessageParser`] turns whole UDP datagrams into messages; a datagram may
//! carry exactly one frame. [`TcpMessageParser`] reassembles frames from an
//! arbitrary byte stream, buffering partial frames across reads (the
//! coordinator channel delivers frames back to back).
//!
//! Both keep a FIFO of completed messages. The UDP receive path walks the
//! completed window newest-to-oldest to process reliability metadata in
//! place, so the window is exposed as a mutable deque.

use std::collections::VecDeque;

use super::Message;

/// Parser for whole-datagram messages, with a shared completed-message FIFO.
#[derive(Debug, Default)]
pub struct MessageParser {
    completed: VecDeque<Message>,
}

impl MessageParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one datagram. A malformed datagram is dropped and logged; the
    /// worker carries on.
    pub fn parse(&mut self, datagram: &[u8]) {
        match Message::decode(datagram) {
            Ok((message, used)) => {
                if used != datagram.len() {
                    log::debug!(
                        "[CODEC] datagram has {} trailing bytes, dropping them",
                        datagram.len() - used
                    );
                }
                self.completed.push_back(message);
            }
            Err(err) => {
                log::warn!("[CODEC] dropping malformed datagram: {}", err);
            }
        }
    }

    /// Queue an already-parsed message (used to re-queue deferred messages
    /// and to merge the TCP stream into the single message FIFO).
    pub fn push(&mut self, message: Message) {
        self.completed.push_back(message);
    }

    pub fn pop(&mut self) -> Option<Message> {
        self.completed.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.completed.len()
    }

    /// Mutable view of the completed-message window for the
    /// newest-to-oldest reliability walk.
    pub fn completed_messages(&mut self) -> &mut VecDeque<Message> {
        &mut self.completed
    }
}

/// Stream parser for the coordinator TCP channel.
#[derive(Debug, Default)]
pub struct TcpMessageParser {
    buffer: Vec<u8>,
    completed: VecDeque<Message>,
}

impl TcpMessageParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed freshly read bytes; complete frames move to the FIFO.
    pub fn parse(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);

        loop {
            let Some(frame_len) = Message::frame_len(&self.buffer) else {
                break;
            };
            if self.buffer.len() < frame_len {
                break;
            }

            match Message::decode(&self.buffer[..frame_len]) {
                Ok((message, used)) => {
                    self.buffer.drain(..used);
                    self.completed.push_back(message);
                }
                Err(err) => {
                    // The stream is length-delimited; a frame that fails to
                    // decode is skipped whole to stay in sync.
                    log::warn!("[CODEC] dropping malformed stream frame: {}", err);
                    self.buffer.drain(..frame_len);
                }
            }
        }
    }

    pub fn pop(&mut self) -> Option<Message> {
        self.completed.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OpCode;

    fn frame(op: OpCode, payload: &[u8]) -> Vec<u8> {
        Message::new(99, op, payload.to_vec()).encode()
    }

    #[test]
    fn test_udp_parser_whole_datagram() {
        let mut parser = MessageParser::new();
        parser.parse(&frame(OpCode::Ping, b"pong"));

        assert_eq!(parser.len(), 1);
        let msg = parser.pop().expect("one message");
        assert_eq!(msg.opcode, OpCode::Ping);
        assert_eq!(msg.payload, b"pong");
    }

    #[test]
    fn test_udp_parser_drops_garbage() {
        let mut parser = MessageParser::new();
        parser.parse(&[0xff; 7]);
        assert!(parser.is_empty());
    }

    #[test]
    fn test_tcp_parser_across_split_reads() {
        let mut parser = TcpMessageParser::new();
        let mut stream = frame(OpCode::Hey, b"hello");
        stream.extend(frame(OpCode::Bye, b""));

        // Feed one byte at a time; framing must survive arbitrary splits.
        for byte in &stream {
            parser.parse(std::slice::from_ref(byte));
        }

        let first = parser.pop().expect("first frame");
        assert_eq!(first.opcode, OpCode::Hey);
        assert_eq!(first.payload, b"hello");

        let second = parser.pop().expect("second frame");
        assert_eq!(second.opcode, OpCode::Bye);
        assert!(parser.pop().is_none());
    }

    #[test]
    fn test_tcp_parser_coalesced_frames() {
        let mut parser = TcpMessageParser::new();
        let mut stream = frame(OpCode::GenerateRays, &[1, 2, 3]);
        stream.extend(frame(OpCode::GenerateRays, &[4, 5]));
        parser.parse(&stream);

        assert_eq!(parser.pop().expect("first").payload, vec![1, 2, 3]);
        assert_eq!(parser.pop().expect("second").payload, vec![4, 5]);
    }

    #[test]
    fn test_tcp_parser_resyncs_after_bad_frame() {
        let mut parser = TcpMessageParser::new();
        let mut bad = frame(OpCode::Ping, b"xx");
        bad[10] = 0xEE; // corrupt the opcode; length prefix still valid
        parser.parse(&bad);
        parser.parse(&frame(OpCode::Bye, b""));

        let msg = parser.pop().expect("stream must stay in sync");
        assert_eq!(msg.opcode, OpCode::Bye);
    }
}
