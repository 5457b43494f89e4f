//! EFM8 bootloader wire format
//!
//! Frames are `['$', length, command, payload...]` where `length` counts the
//! command byte and the payload. Every frame is answered with a single status byte.

use core::fmt;

/// Start of frame marker
pub const FRAME_MARKER: u8 = b'$';

/// Autobaud training character
pub const UART_TRAINING: u8 = 0xFF;

/// Minimum frame payload accepted by the bootloader
pub const MIN_PAYLOAD: usize = 2;

/// Maximum frame payload, bounded by the device receive buffer
pub const MAX_PAYLOAD: usize = 130;

/// Maximum data bytes in a single write (payload minus the address)
pub const MAX_CHUNK: usize = 128;

/// Key unlocking flash erase / write for the current session
pub const SETUP_KEY: [u8; 3] = [0xA5, 0xF1, 0x00];

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Command {
    /// Checks a device / variant id pair against the target
    Identify = 0x30,

    /// Enables flash access, must be sent with the setup key before erase or write
    Setup = 0x31,

    /// Erases the flash page containing the given address
    Erase = 0x32,

    /// Writes up to 128 bytes to flash starting at the given address
    Write = 0x33,

    /// Compares the CRC16 of a flash range against the supplied value
    Verify = 0x34,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Command::Identify => "IDENTIFY",
            Command::Setup => "SETUP",
            Command::Erase => "ERASE",
            Command::Write => "WRITE",
            Command::Verify => "VERIFY",
        };
        f.write_str(s)
    }
}

/// Bootloader status response
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Response {
    Ack = 0x40,
    RangeError = 0x41,
    BadId = 0x42,
    CrcError = 0x43,
}

impl Response {
    /// Decode a status byte, returning the raw value if it is not a known status
    pub fn decode(v: u8) -> Result<Self, u8> {
        match v {
            0x40 => Ok(Response::Ack),
            0x41 => Ok(Response::RangeError),
            0x42 => Ok(Response::BadId),
            0x43 => Ok(Response::CrcError),
            _ => Err(v),
        }
    }

    pub fn is_ack(&self) -> bool {
        *self == Response::Ack
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Response::Ack => "ACK",
            Response::RangeError => "RANGE_ERROR",
            Response::BadId => "BAD_ID",
            Response::CrcError => "CRC_ERROR",
        };
        write!(f, "{} (0x{:02X})", s, *self as u8)
    }
}

/// Payload length outside of the bootloader limits
#[derive(Debug, PartialEq, Clone, Copy, thiserror::Error)]
#[error("invalid payload length {len}, allowed 2..=130")]
pub struct LengthError {
    pub len: usize,
}

/// A single command frame
#[derive(Debug, PartialEq, Clone)]
pub struct Frame {
    command: Command,
    payload: Vec<u8>,
}

impl Frame {
    /// Build a frame, checking the payload fits the device buffer
    pub fn new(command: Command, payload: &[u8]) -> Result<Self, LengthError> {
        let len = payload.len();
        if len < MIN_PAYLOAD || len > MAX_PAYLOAD {
            return Err(LengthError { len });
        }

        Ok(Self {
            command,
            payload: payload.to_vec(),
        })
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Length field, covering the command byte and payload
    pub fn length(&self) -> u8 {
        (self.payload.len() + 1) as u8
    }

    /// Encode the frame for transmission
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(self.payload.len() + 3);
        b.push(FRAME_MARKER);
        b.push(self.length());
        b.push(self.command as u8);
        b.extend_from_slice(&self.payload);
        b
    }
}

/// IDENTIFY payload
pub fn identify_payload(device_id: u8, variant_id: u8) -> [u8; 2] {
    [device_id, variant_id]
}

/// ERASE payload, the start address of the page to erase
pub fn erase_payload(page_start: u16) -> [u8; 2] {
    page_start.to_be_bytes()
}

/// WRITE payload, big endian address followed by data
pub fn write_payload(address: u16, data: &[u8]) -> Vec<u8> {
    let mut p = Vec::with_capacity(data.len() + 2);
    p.extend_from_slice(&address.to_be_bytes());
    p.extend_from_slice(data);
    p
}

/// VERIFY payload, `end` is exclusive and truncated to 16 bits
pub fn verify_payload(start: u16, end: u32, crc: u16) -> [u8; 6] {
    let s = start.to_be_bytes();
    let e = (end as u16).to_be_bytes();
    let c = crc.to_be_bytes();
    [s[0], s[1], e[0], e[1], c[0], c[1]]
}
