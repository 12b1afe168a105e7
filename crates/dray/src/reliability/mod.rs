// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reliable ray transport: packet assembly, sequence numbers, ack
//! aggregation, retransmission state.

pub mod acks;
pub mod packet;

pub use acks::{parse_ack_payload, AckEntry, AckLedger, ACK_ENTRY_BYTES};
pub use packet::{RayPacket, SequenceSpace, ServicePacket};
