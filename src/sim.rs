//! Simulated EFM8 bootloader for exercising the programmer without hardware

use std::collections::VecDeque;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::crc::crc16;
use crate::image::FLASH_PAGE_SIZE;
use crate::protocol::{Command, Response, FRAME_MARKER, SETUP_KEY, UART_TRAINING};

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum SimError {
    Disconnected,
}

/// In-memory device implementing the serial traits
#[derive(Debug)]
pub struct SimDevice {
    /// Flash contents
    pub flash: Vec<u8>,
    /// Device / variant id the device answers IDENTIFY with ACK for
    pub id: (u8, u8),
    /// Drop all responses, forcing a timeout
    pub mute: bool,
    /// Reply with this byte instead of the computed status
    pub reply_override: Option<u8>,
    /// Silently ignore writes to this address
    pub stuck_address: Option<u32>,
    /// Fail the next serial write
    pub disconnected: bool,

    unlocked: bool,
    training: usize,
    rx: Vec<u8>,
    tx: VecDeque<u8>,
    log: Vec<(Command, Vec<u8>)>,
}

impl SimDevice {
    /// Create a device with `flash_size` bytes of erased flash
    pub fn new(flash_size: usize, id: (u8, u8)) -> Self {
        Self {
            flash: vec![0xFF; flash_size],
            id,
            mute: false,
            reply_override: None,
            stuck_address: None,
            disconnected: false,
            unlocked: false,
            training: 0,
            rx: Vec::new(),
            tx: VecDeque::new(),
            log: Vec::new(),
        }
    }

    /// Frames received so far
    pub fn log(&self) -> &[(Command, Vec<u8>)] {
        &self.log
    }

    /// Number of frames received carrying `command`
    pub fn count(&self, command: Command) -> usize {
        self.log.iter().filter(|(c, _)| *c == command).count()
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    /// Number of autobaud training characters received
    pub fn training(&self) -> usize {
        self.training
    }

    pub fn unlocked(&self) -> bool {
        self.unlocked
    }

    fn receive(&mut self, b: u8) {
        if self.rx.is_empty() && b != FRAME_MARKER {
            if b == UART_TRAINING {
                self.training += 1;
            }
            return;
        }

        self.rx.push(b);

        if self.rx.len() == 2 && self.rx[1] == 0 {
            self.rx.clear();
            return;
        }

        if self.rx.len() >= 3 && self.rx.len() == self.rx[1] as usize + 2 {
            let frame = std::mem::take(&mut self.rx);
            let status = self.handle(frame[2], &frame[3..]);

            if self.mute {
                return;
            }
            self.tx.push_back(self.reply_override.unwrap_or(status as u8));
        }
    }

    fn handle(&mut self, command: u8, payload: &[u8]) -> Response {
        let command = match command {
            0x30 => Command::Identify,
            0x31 => Command::Setup,
            0x32 => Command::Erase,
            0x33 => Command::Write,
            0x34 => Command::Verify,
            _ => return Response::BadId,
        };
        self.log.push((command, payload.to_vec()));

        match command {
            Command::Identify if payload.len() == 2 => {
                if (payload[0], payload[1]) == self.id {
                    Response::Ack
                } else {
                    Response::BadId
                }
            }
            Command::Setup if payload == &SETUP_KEY[..] => {
                self.unlocked = true;
                Response::Ack
            }
            Command::Erase if self.unlocked && payload.len() >= 2 => {
                let address = u16::from_be_bytes([payload[0], payload[1]]) as usize;
                if address >= self.flash.len() {
                    return Response::RangeError;
                }
                let start = address - address % FLASH_PAGE_SIZE as usize;
                let end = (start + FLASH_PAGE_SIZE as usize).min(self.flash.len());
                for b in &mut self.flash[start..end] {
                    *b = 0xFF;
                }
                self.program(address, &payload[2..])
            }
            Command::Write if self.unlocked && payload.len() >= 2 => {
                let address = u16::from_be_bytes([payload[0], payload[1]]) as usize;
                self.program(address, &payload[2..])
            }
            Command::Verify if self.unlocked && payload.len() == 6 => {
                let start = u16::from_be_bytes([payload[0], payload[1]]) as usize;
                let end = match u16::from_be_bytes([payload[2], payload[3]]) as usize {
                    0 => 0x1_0000,
                    e => e,
                };
                let crc = u16::from_be_bytes([payload[4], payload[5]]);
                if start >= end || end > self.flash.len() {
                    return Response::RangeError;
                }
                if crc16(&self.flash[start..end]) == crc {
                    Response::Ack
                } else {
                    Response::CrcError
                }
            }
            _ => Response::BadId,
        }
    }

    fn program(&mut self, address: usize, data: &[u8]) -> Response {
        if address + data.len() > self.flash.len() {
            return Response::RangeError;
        }
        for (i, v) in data.iter().enumerate() {
            let a = address + i;
            if self.stuck_address == Some(a as u32) {
                continue;
            }
            self.flash[a] = *v;
        }
        Response::Ack
    }
}

impl Write<u8> for SimDevice {
    type Error = SimError;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        if self.disconnected {
            return Err(nb::Error::Other(SimError::Disconnected));
        }
        self.receive(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        Ok(())
    }
}

impl Read<u8> for SimDevice {
    type Error = SimError;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        self.tx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

/// Delay provider that only tracks elapsed time
#[derive(Debug, Default)]
pub struct SimDelay {
    pub elapsed_ms: u64,
}

impl DelayMs<u32> for SimDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.elapsed_ms += ms as u64;
    }
}
