// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message framing shared by the UDP and TCP transports.
//!
//! A message is a fixed header plus an opaque payload:
//!
//! ```text
//! 0        2                10   11               19   20      22
//! +--------+----------------+----+----------------+----+--------+---------+
//! | length | sender_worker  | op | sequence_number|flag| attempt| payload |
//! |  u16   |      u64       | u8 |      u64       | u8 |  u16   |  bytes  |
//! +--------+----------------+----+----------------+----+--------+---------+
//! ```
//!
//! All integers big-endian. `flags` bit 0 marks a reliable message (the
//! receiver acks it and suppresses duplicates), bit 1 marks a tracked
//! message (sampled into the packet trace log).

pub mod codec;
pub mod records;
pub mod wire;

use crate::error::{Error, Result};
use wire::{put_u16, put_u64, put_u8, Chunk};

/// Fixed frame header length on the wire.
pub const HEADER_LEN: usize = 22;

const FLAG_RELIABLE: u8 = 1 << 0;
const FLAG_TRACKED: u8 = 1 << 1;

/// Message opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Hey = 0x01,
    Ping = 0x02,
    GetObjects = 0x03,
    GenerateRays = 0x04,
    ConnectTo = 0x05,
    MultipleConnect = 0x06,
    ConnectionRequest = 0x07,
    ConnectionResponse = 0x08,
    SendRays = 0x09,
    Ack = 0x0A,
    FinishedPaths = 0x0B,
    FinishedRays = 0x0C,
    WorkerStats = 0x0D,
    GetWorker = 0x0E,
    StartBenchmark = 0x0F,
    Bye = 0x10,
}

impl OpCode {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(OpCode::Hey),
            0x02 => Ok(OpCode::Ping),
            0x03 => Ok(OpCode::GetObjects),
            0x04 => Ok(OpCode::GenerateRays),
            0x05 => Ok(OpCode::ConnectTo),
            0x06 => Ok(OpCode::MultipleConnect),
            0x07 => Ok(OpCode::ConnectionRequest),
            0x08 => Ok(OpCode::ConnectionResponse),
            0x09 => Ok(OpCode::SendRays),
            0x0A => Ok(OpCode::Ack),
            0x0B => Ok(OpCode::FinishedPaths),
            0x0C => Ok(OpCode::FinishedRays),
            0x0D => Ok(OpCode::WorkerStats),
            0x0E => Ok(OpCode::GetWorker),
            0x0F => Ok(OpCode::StartBenchmark),
            0x10 => Ok(OpCode::Bye),
            other => Err(Error::UnknownOpcode(other)),
        }
    }
}

/// A parsed or to-be-sent message.
#[derive(Debug, Clone)]
pub struct Message {
    pub sender_id: u64,
    pub opcode: OpCode,
    pub payload: Vec<u8>,
    pub reliable: bool,
    pub sequence_number: u64,
    pub tracked: bool,
    pub attempt: u16,
    /// Set once the UDP receive path has examined this message; the
    /// newest-to-oldest duplicate walk stops at the first read message.
    read: bool,
}

impl Message {
    /// An unreliable, untracked message (the common control-plane case).
    pub fn new(sender_id: u64, opcode: OpCode, payload: Vec<u8>) -> Self {
        Self::with_transport(sender_id, opcode, payload, false, 0, false)
    }

    /// A message with explicit transport metadata.
    pub fn with_transport(
        sender_id: u64,
        opcode: OpCode,
        payload: Vec<u8>,
        reliable: bool,
        sequence_number: u64,
        tracked: bool,
    ) -> Self {
        Self {
            sender_id,
            opcode,
            payload,
            reliable,
            sequence_number,
            tracked,
            attempt: 0,
            read: false,
        }
    }

    pub fn is_read(&self) -> bool {
        self.read
    }

    pub fn set_read(&mut self) {
        self.read = true;
    }

    /// Total encoded length (header + payload).
    pub fn total_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Encode the message to its wire frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.total_len());
        put_u16(&mut buf, self.payload.len() as u16);
        put_u64(&mut buf, self.sender_id);
        put_u8(&mut buf, self.opcode as u8);
        put_u64(&mut buf, self.sequence_number);

        let mut flags = 0u8;
        if self.reliable {
            flags |= FLAG_RELIABLE;
        }
        if self.tracked {
            flags |= FLAG_TRACKED;
        }
        put_u8(&mut buf, flags);
        put_u16(&mut buf, self.attempt);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode one message from the front of `data`, returning the message
    /// and the number of bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let mut chunk = Chunk::new(data);
        let payload_len = chunk.u16()? as usize;
        let sender_id = chunk.u64()?;
        let opcode = OpCode::from_u8(chunk.u8()?)?;
        let sequence_number = chunk.u64()?;
        let flags = chunk.u8()?;
        let attempt = chunk.u16()?;
        let payload = chunk.bytes(payload_len)?.to_vec();

        Ok((
            Self {
                sender_id,
                opcode,
                payload,
                reliable: flags & FLAG_RELIABLE != 0,
                sequence_number,
                tracked: flags & FLAG_TRACKED != 0,
                attempt,
                read: false,
            },
            HEADER_LEN + payload_len,
        ))
    }

    /// Length of the frame starting at `data`, if the header is complete.
    pub fn frame_len(data: &[u8]) -> Option<usize> {
        if data.len() < 2 {
            return None;
        }
        let payload_len = u16::from_be_bytes([data[0], data[1]]) as usize;
        Some(HEADER_LEN + payload_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_round_trip() {
        let mut msg = Message::with_transport(
            42,
            OpCode::SendRays,
            vec![1, 2, 3, 4, 5],
            true,
            9_000_000_001,
            true,
        );
        msg.attempt = 3;

        let frame = msg.encode();
        assert_eq!(frame.len(), HEADER_LEN + 5);

        let (decoded, used) = Message::decode(&frame).expect("decode");
        assert_eq!(used, frame.len());
        assert_eq!(decoded.sender_id, 42);
        assert_eq!(decoded.opcode, OpCode::SendRays);
        assert_eq!(decoded.payload, vec![1, 2, 3, 4, 5]);
        assert!(decoded.reliable);
        assert!(decoded.tracked);
        assert_eq!(decoded.sequence_number, 9_000_000_001);
        assert_eq!(decoded.attempt, 3);
        assert!(!decoded.is_read(), "read mark is local, never on the wire");
    }

    #[test]
    fn test_unreliable_flags_clear() {
        let msg = Message::new(7, OpCode::Ping, Vec::new());
        let (decoded, _) = Message::decode(&msg.encode()).expect("decode");
        assert!(!decoded.reliable);
        assert!(!decoded.tracked);
        assert_eq!(decoded.attempt, 0);
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let mut frame = Message::new(1, OpCode::Ping, Vec::new()).encode();
        frame[10] = 0xEE; // opcode byte
        assert!(matches!(
            Message::decode(&frame),
            Err(Error::UnknownOpcode(0xEE))
        ));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let msg = Message::new(1, OpCode::Hey, vec![0; 16]);
        let frame = msg.encode();
        assert!(Message::decode(&frame[..frame.len() - 1]).is_err());
    }

    #[test]
    fn test_frame_len_needs_two_bytes() {
        assert_eq!(Message::frame_len(&[0x00]), None);
        assert_eq!(Message::frame_len(&[0x00, 0x10]), Some(HEADER_LEN + 16));
    }
}
