// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Worker error taxonomy.
//!
//! Transport errors are fatal and unwind the event loop; protocol errors are
//! contained at the call site (the offending message is dropped); invariant
//! violations indicate a broken internal contract and are fatal.

use std::io;

/// Errors surfaced by the worker runtime.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Transport (fatal)
    // ========================================================================
    /// Socket-level send/receive failure.
    Transport(io::Error),
    /// The coordinator control channel failed or was closed unexpectedly.
    CoordinatorLost(io::Error),

    // ========================================================================
    // Protocol (contained)
    // ========================================================================
    /// A frame or payload that cannot be decoded.
    Protocol(&'static str),
    /// An opcode outside the known set.
    UnknownOpcode(u8),

    // ========================================================================
    // Internal contracts (fatal)
    // ========================================================================
    /// A state reached that the engine's invariants rule out.
    InvariantViolation(&'static str),

    // ========================================================================
    // Configuration / environment
    // ========================================================================
    /// Invalid runtime configuration.
    Config(String),
    /// Storage backend failure (object fetch/upload).
    Storage(io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Transport(e) => write!(f, "transport failure: {}", e),
            Error::CoordinatorLost(e) => write!(f, "coordinator connection lost: {}", e),
            Error::Protocol(what) => write!(f, "malformed message: {}", what),
            Error::UnknownOpcode(op) => write!(f, "unknown opcode: 0x{:02x}", op),
            Error::InvariantViolation(what) => write!(f, "invariant violation: {}", what),
            Error::Config(msg) => write!(f, "configuration error: {}", msg),
            Error::Storage(e) => write!(f, "storage backend error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) | Error::CoordinatorLost(e) | Error::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl Error {
    /// Whether this error must terminate the event loop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::CoordinatorLost(_) | Error::InvariantViolation(_)
        )
    }
}

/// Convenient alias for runtime results.
pub type Result<T> = std::result::Result<T, Error>;
