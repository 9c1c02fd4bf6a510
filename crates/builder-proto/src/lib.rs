// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Wire schema for builder's distributed coordinator/worker protocol.
//!
//! Frames are length-prefixed and versioned ([`wire`]); payloads use a
//! deterministic varint codec ([`codec`]) so every message has exactly one
//! byte representation. Message kinds ([`Message`]) cover action dispatch,
//! peer work stealing, CAS blob transfer, heartbeats, and aborts.
//!
//! The round-trip law `decode(encode(m)) == m` holds for every message and
//! is enforced by property tests; breaking it is a major-version event.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::missing_const_for_fn,
    clippy::module_name_repetitions,
    clippy::use_self
)]

pub mod codec;
mod message;
pub mod wire;

pub use message::{Message, WireCommand, WireMetrics, WorkerId};
pub use wire::{
    decode_frame, decode_message, encode_message, Frame, HEADER_BYTES, MAX_BLOB_FRAME, MAX_FRAME,
    WIRE_VERSION,
};

/// Decode and validation failures for frames and payloads.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Frame version byte differs from [`WIRE_VERSION`]; no negotiation.
    #[error("unsupported protocol version {got} (expected {WIRE_VERSION})")]
    ProtocolVersion {
        /// The version the peer sent.
        got: u8,
    },

    /// Frame length exceeds the opcode's cap.
    #[error("frame of {len} bytes exceeds cap {cap}")]
    FrameTooLarge {
        /// Declared frame length.
        len: u32,
        /// Applicable cap.
        cap: u32,
    },

    /// Structurally impossible frame.
    #[error("malformed frame: {detail}")]
    Malformed {
        /// What was wrong.
        detail: String,
    },

    /// Opcode with no assigned message kind.
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    /// Payload ended before the schema was satisfied.
    #[error("truncated payload")]
    Truncated,

    /// Payload bytes left over after the schema was satisfied.
    #[error("{count} trailing bytes after payload")]
    TrailingBytes {
        /// How many bytes were left.
        count: usize,
    },

    /// A varint used a non-minimal encoding.
    #[error("non-canonical varint")]
    NonCanonicalVarint,

    /// A boolean byte was neither 0 nor 1.
    #[error("invalid boolean byte")]
    InvalidBool,

    /// A string field held invalid UTF-8.
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    /// An integer field exceeded its schema range.
    #[error("integer value out of range for field")]
    ValueOutOfRange,

    /// Network policy discriminant outside the schema.
    #[error("invalid network policy {0}")]
    InvalidNetworkPolicy(u64),

    /// A decoded sandbox spec failed revalidation.
    #[error("invalid sandbox spec on wire: {0}")]
    InvalidSpec(String),
}
