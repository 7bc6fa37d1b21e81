// MIT License - Copyright (c) 2026 Peter Wright
// Frame synchronization and checksum codec

use std::fmt;

use crate::constants::{CHECKSUM_MASK, HEADER_0_STATE, HEADER_MARK};
use crate::error::Result;
use crate::transport::BusTransport;

/// The two leading bytes of a frame.
///
/// `h0` always has the top bit set, `h1` never does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Header {
    pub h0: u8,
    pub h1: u8,
}

impl Header {
    pub const fn new(h0: u8, h1: u8) -> Self {
        Self { h0, h1 }
    }

    pub const fn from_u16(value: u16) -> Self {
        Self {
            h0: (value >> 8) as u8,
            h1: (value & 0xFF) as u8,
        }
    }

    pub const fn as_u16(&self) -> u16 {
        ((self.h0 as u16) << 8) | self.h1 as u16
    }

    pub const fn bytes(&self) -> [u8; 2] {
        [self.h0, self.h1]
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}{:02x}", self.h0, self.h1)
    }
}

/// Three-byte key identifying the acknowledgement of a command frame.
pub type AckKey = [u8; 3];

/// Running XOR of `bytes` with the top bit cleared.
fn xor_masked(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b) & CHECKSUM_MASK
}

/// Check a complete frame, checksum byte included.
pub fn verify_checksum(frame: &[u8]) -> bool {
    !frame.is_empty() && xor_masked(frame) == 0
}

/// Checksum of a frame whose last position is reserved for it.
pub fn generate_checksum(frame: &[u8]) -> u8 {
    match frame.split_last() {
        Some((_, body)) => xor_masked(body),
        None => 0,
    }
}

/// Overwrite the last byte of `frame` with its checksum.
pub fn seal(frame: &mut [u8]) {
    if let Some(last) = frame.len().checked_sub(1) {
        frame[last] = generate_checksum(frame);
    }
}

/// Acknowledgement key of a command frame: its first three bytes with the
/// prefix replaced by the generic acknowledgement prefix.
pub fn ack_key(frame: &[u8]) -> Option<AckKey> {
    match frame {
        [_, b1, b2, ..] => Some([HEADER_0_STATE, *b1, *b2]),
        _ => None,
    }
}

/// Hex rendering used in logs.
pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Synchronize to the next frame header.
///
/// Skips bytes until one with the top bit set. A following byte that also has
/// the top bit set means the first was corrupted: it becomes the new header0
/// candidate and the search continues.
pub async fn read_header<T: BusTransport>(transport: &mut T) -> Result<Header> {
    let mut h0 = loop {
        let byte = transport.read(1).await?[0];
        if byte & HEADER_MARK != 0 {
            break byte;
        }
    };

    loop {
        let h1 = transport.read(1).await?[0];
        if h1 & HEADER_MARK == 0 {
            return Ok(Header::new(h0, h1));
        }
        h0 = h1;
    }
}
