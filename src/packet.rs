//! 32-bit gauge command packet
//!
//! Wire layout, filled from the most significant bit down:
//!
//! ```text
//! ┌──────────┬──────────────┬────────────┬──────────────────────┐
//! │ command  │    value     │  address   │  !address (check)    │
//! │ (4 bits) │  (12 bits)   │  (8 bits)  │  (8 bits)            │
//! └──────────┴──────────────┴────────────┴──────────────────────┘
//! ```
//!
//! Each field is shifted in least-significant bit first, so within its slot
//! a field appears bit-reversed. Receivers expect exactly this order.
//!
//! A packet of `0` is the "no command" sentinel. No valid encoding produces
//! it because the address and its complement can never both be zero.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

pub const COMMAND_BITS: u32 = 4;
pub const VALUE_BITS: u32 = 12;
pub const ADDRESS_BITS: u32 = 8;

pub const MAX_COMMAND: i64 = (1 << COMMAND_BITS) - 1;
pub const MAX_VALUE: i64 = (1 << VALUE_BITS) - 1;
pub const MAX_ADDRESS: i64 = (1 << ADDRESS_BITS) - 1;

/// Address every receiver in range answers to
pub const BROADCAST_ADDRESS: u8 = 170;

/// An encoded gauge command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Packet(u32);

/// Fields recovered from a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedPacket {
    pub command: u8,
    pub value: u16,
    pub address: u8,
    pub address_complement: u8,
    /// `address_complement == !address`
    pub address_check_ok: bool,
}

/// Shift `width` bits of `field` into `word`, least significant first
fn push_lsb_first(mut word: u32, mut field: u32, width: u32) -> u32 {
    for _ in 0..width {
        word = (word << 1) | (field & 1);
        field >>= 1;
    }
    word
}

fn reverse_bits(field: u32, width: u32) -> u32 {
    push_lsb_first(0, field, width)
}

fn check_range(
    field: i64,
    max: i64,
    err: fn(i64) -> ValidationError,
) -> Result<u32, ValidationError> {
    if (0..=max).contains(&field) {
        Ok(field as u32)
    } else {
        Err(err(field))
    }
}

impl Packet {
    /// The "no command" packet
    pub const SENTINEL: Packet = Packet(0);

    /// Wrap a packet received over the control channel
    pub const fn from_raw(raw: u32) -> Self {
        Packet(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn is_sentinel(self) -> bool {
        self.0 == 0
    }

    /// Build a packet, validating every field
    pub fn encode(command: i64, value: i64, address: i64) -> Result<Self, ValidationError> {
        let value = check_range(value, MAX_VALUE, ValidationError::ValueOutOfRange)?;
        let command = check_range(command, MAX_COMMAND, ValidationError::CommandOutOfRange)?;
        let address = check_range(address, MAX_ADDRESS, ValidationError::AddressOutOfRange)?;

        let mut word = push_lsb_first(0, command, COMMAND_BITS);
        word = push_lsb_first(word, value, VALUE_BITS);
        word = push_lsb_first(word, address, ADDRESS_BITS);
        word = push_lsb_first(word, !address & 0xFF, ADDRESS_BITS);
        Ok(Packet(word))
    }

    /// Split the packet back into its fields
    pub fn decode(self) -> DecodedPacket {
        let word = self.0;
        let command = reverse_bits(word >> 28, COMMAND_BITS) as u8;
        let value = reverse_bits((word >> 16) & 0x0FFF, VALUE_BITS) as u16;
        let address = reverse_bits((word >> 8) & 0xFF, ADDRESS_BITS) as u8;
        let address_complement = reverse_bits(word & 0xFF, ADDRESS_BITS) as u8;

        DecodedPacket {
            command,
            value,
            address,
            address_complement,
            address_check_ok: address_complement == !address,
        }
    }
}

/// Encode, falling back to the sentinel `0` when a field is out of range
///
/// The rejected field is logged. Callers must check for the sentinel before
/// queueing.
pub fn encode_or_sentinel(command: i64, value: i64, address: i64) -> Packet {
    match Packet::encode(command, value, address) {
        Ok(packet) => packet,
        Err(e) => {
            warn!(field = e.field(), "packet encode rejected: {}", e);
            Packet::SENTINEL
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::LowerHex for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl From<Packet> for u32 {
    fn from(packet: Packet) -> Self {
        packet.0
    }
}

impl FromStr for Packet {
    type Err = std::num::ParseIntError;

    /// Accepts decimal or `0x`-prefixed hex
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let raw = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16)?,
            None => s.parse::<u32>()?,
        };
        Ok(Packet(raw))
    }
}
