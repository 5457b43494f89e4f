//! EFM8 Serial Bootloader.
//!
//! Based on AN945 (EFM8 Factory Bootloader User's Guide)
//!
//! The bootloader has no command to read flash, so [`Programmer::download`]
//! recovers each byte by probing VERIFY with candidate values until the
//! device reports a checksum match.

use core::convert::TryFrom;
use core::marker::PhantomData;
use std::time::{Duration, Instant};

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

#[cfg(feature = "util")]
pub mod hexfile;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub mod crc;
pub mod device;
pub mod image;
pub mod protocol;

use crate::crc::crc16;
use crate::device::{scan_table, DeviceDescriptor, DeviceMatch, MAX_VARIANTS};
use crate::image::{FlashPage, MemoryImage, ERASED_BYTE};
use crate::protocol::*;

/// Size of the 16-bit bootloader address space
pub const ADDRESS_SPACE: u32 = 0x1_0000;

/// Flash size assumed when dumping, the bootloader cannot report it
pub const DEFAULT_FLASH_SIZE: u32 = 8 * 1024;

/// Serial transport, any port implementing the embedded-hal serial traits
pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {}

impl<T, E> SerialPort<E> for T where T: Write<u8, Error = E> + Read<u8, Error = E> {}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    /// Flash access not yet enabled
    Init,
    /// Training sent and flash access enabled
    Ready,
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError> {
    #[error("serial error: {0:?}")]
    Serial(SerialError),

    #[error("serial read timed out")]
    ResponseTimeout,

    #[error("unknown response 0x{0:02X}")]
    UnknownResponse(u8),

    #[error("enabling flash access failed, response {0}")]
    SetupFailed(Response),

    #[error("{command} rejected, response {response}")]
    Rejected { command: Command, response: Response },

    #[error("{0}")]
    Length(LengthError),

    #[error("invalid chunk size {0}, maximum allowed write is 128 bytes")]
    ChunkTooLong(usize),

    #[error("erase failed for page {page} (response = {response})")]
    EraseFailed { page: u32, response: Response },

    #[error("write failed at address 0x{address:04X} (response = {response})")]
    WriteFailed { address: u32, response: Response },

    #[error("verify mismatch in between 0x{start:04X}-0x{end:04X}")]
    VerifyMismatch { start: u32, end: u32 },

    #[error("could not find any device")]
    DeviceNotFound,

    #[error("no candidate value matched flash content at 0x{0:04X}")]
    UnresolvedByte(u32),

    #[error("address 0x{0:X} is outside of the bootloader address space")]
    AddressOutOfRange(u32),

    #[error("image contains no data")]
    EmptyImage,
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1000"))]
    pub response_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Period to wait after the autobaud training character
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "10"))]
    pub init_delay_ms: u32,

    /// Also probe device ids missing from the known device table
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub scan_unknown_ids: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            response_timeout_ms: 1000,
            poll_delay_ms: 1,
            init_delay_ms: 10,
            scan_unknown_ids: false,
        }
    }
}

/// Progress reporting for long running operations
pub trait Progress {
    /// Operation started, `total` bytes to process
    fn start(&mut self, total: usize);

    /// `done` bytes processed so far
    fn update(&mut self, done: usize);

    fn finish(&mut self);
}

/// Progress sink that discards updates
pub struct NoProgress;

impl Progress for NoProgress {
    fn start(&mut self, _total: usize) {}
    fn update(&mut self, _done: usize) {}
    fn finish(&mut self) {}
}

pub struct Programmer<P, D, E> {
    state: State,
    options: Options,
    port: P,
    delay: D,
    _err: PhantomData<E>,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self {
            state: State::Init,
            options,
            port,
            delay,
            _err: PhantomData,
        }
    }

    /// Fetch the programmer state
    pub fn state(&self) -> State {
        self.state
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Release the underlying port and delay
    pub fn into_inner(self) -> (P, D) {
        (self.port, self.delay)
    }

    /// Start a bootloader session, training the device baud rate and enabling flash access
    pub fn init(&mut self) -> Result<(), Error<E>> {
        self.state = State::Init;

        debug!("Sending training character");
        block!(self.port.write(UART_TRAINING))?;
        block!(self.port.flush())?;

        self.delay.delay_ms(self.options.init_delay_ms);

        debug!("Enabling flash access");
        self.enable_flash_access()?;

        self.state = State::Ready;

        Ok(())
    }

    /// Unlock flash erase / write with the setup key
    pub fn enable_flash_access(&mut self) -> Result<(), Error<E>> {
        match self.command(Command::Setup, &SETUP_KEY)? {
            Response::Ack => Ok(()),
            r => {
                error!("Error enabling flash access: {}", r);
                Err(Error::SetupFailed(r))
            }
        }
    }

    /// Send a command frame and await the status response
    pub fn command(&mut self, command: Command, payload: &[u8]) -> Result<Response, Error<E>> {
        let frame = Frame::new(command, payload).map_err(Error::<E>::Length)?;

        trace!(
            "Sending $ len={} cmd={} data={}",
            frame.length(),
            frame.command(),
            excerpt(frame.payload())
        );

        for b in frame.to_bytes() {
            block!(self.port.write(b))?;
        }
        block!(self.port.flush())?;

        let r = self.await_response()?;
        trace!("Reply {}", r);

        Ok(r)
    }

    fn await_response(&mut self) -> Result<Response, Error<E>> {
        let poll = self.options.poll_delay_ms.max(1);
        let mut t = 0;

        // Ports that block inside read() spend time the poll count does not see
        let timeout = Duration::from_millis(self.options.response_timeout_ms as u64);
        let deadline = Instant::now() + timeout;

        loop {
            // Attempt to read from serial port
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Ok(v) => {
                    return Response::decode(v).map_err(|v| {
                        debug!("Received unexpected value: 0x{:02x}", v);
                        Error::UnknownResponse(v)
                    })
                }
            };

            // Wait for delay period
            self.delay.delay_ms(poll);
            t += poll;

            if t > self.options.response_timeout_ms || Instant::now() > deadline {
                error!("Receive timeout");
                return Err(Error::ResponseTimeout);
            }
        }
    }

    /// Check whether a device / variant id pair matches the target
    pub fn check_id(&mut self, device_id: u8, variant_id: u8) -> Result<bool, Error<E>> {
        let r = self.command(Command::Identify, &identify_payload(device_id, variant_id))?;
        Ok(r.is_ack())
    }

    /// Connect and identify the attached device using the built-in device table
    pub fn identify(&mut self) -> Result<DeviceMatch, Error<E>> {
        self.init()?;

        let table = scan_table(self.options.scan_unknown_ids);
        self.scan(&table)
    }

    /// Probe every device / variant pair in `table`, returning the first match
    pub fn scan(&mut self, table: &[DeviceDescriptor]) -> Result<DeviceMatch, Error<E>> {
        for d in table {
            debug!("Checking for device {} (0x{:02X})", d.name, d.id);

            for variant_id in 0..MAX_VARIANTS {
                if !self.check_id(d.id, variant_id)? {
                    continue;
                }

                let m = DeviceMatch {
                    device_id: d.id,
                    variant_id,
                    device_name: d.name.to_string(),
                    variant_name: d.variant_name(variant_id).into_owned(),
                };
                info!("Detected {}", m);

                return Ok(m);
            }
        }

        Err(Error::DeviceNotFound)
    }

    /// Erase a single flash page
    pub fn erase_page(&mut self, page: &FlashPage) -> Result<(), Error<E>> {
        let start = address16::<E>(page.start)?;

        debug!(
            "Erasing page {} (0x{:04X}-0x{:04X})",
            page.index,
            page.start,
            page.end - 1
        );

        match self.command(Command::Erase, &erase_payload(start))? {
            Response::Ack => Ok(()),
            response => Err(Error::EraseFailed {
                page: page.index,
                response,
            }),
        }
    }

    /// Erase every page the image occupies, returning the number of pages erased
    pub fn erase_image(&mut self, image: &MemoryImage) -> Result<usize, Error<E>> {
        let pages = image.pages();

        for p in &pages {
            self.erase_page(p)?;
        }

        Ok(pages.len())
    }

    /// Write up to `MAX_CHUNK` bytes at `address`
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<(), Error<E>> {
        if data.len() > MAX_CHUNK {
            return Err(Error::ChunkTooLong(data.len()));
        }
        let a = address16::<E>(address)?;
        address16::<E>(address + data.len().max(1) as u32 - 1)?;

        debug!("Write at 0x{:04X} ({:3}): {}", address, data.len(), excerpt(data));

        match self.command(Command::Write, &write_payload(a, data))? {
            Response::Ack => Ok(()),
            response => {
                error!("Write failed at address 0x{:04X} ({})", address, response);
                Err(Error::WriteFailed { address, response })
            }
        }
    }

    /// Write every segment of the image in `MAX_CHUNK` byte blocks
    pub fn write_image(
        &mut self,
        image: &MemoryImage,
        progress: &mut dyn Progress,
    ) -> Result<(), Error<E>> {
        let chunks = image.chunks(MAX_CHUNK);
        let mut done = 0;

        progress.start(image.len());

        for c in &chunks {
            self.write(c.address, &c.data)?;

            done += c.data.len();
            progress.update(done);
        }

        progress.finish();

        Ok(())
    }

    /// Compare the CRC of `data` against flash content at `address`
    pub fn verify(&mut self, address: u32, data: &[u8]) -> Result<Response, Error<E>> {
        let start = address16::<E>(address)?;
        let end = address + data.len() as u32;
        if end > ADDRESS_SPACE {
            return Err(Error::AddressOutOfRange(end - 1));
        }

        let crc = crc16(data);
        trace!(
            "Verify address 0x{:04X} (len={}, crc16=0x{:04X})",
            address,
            data.len(),
            crc
        );

        self.command(Command::Verify, &verify_payload(start, end, crc))
    }

    /// Verify the image, checking the whole range first and falling back to
    /// per-chunk checks to locate a mismatch
    pub fn verify_image(&mut self, image: &MemoryImage) -> Result<(), Error<E>> {
        let (first, last) = match (image.first_address(), image.last_address()) {
            (Some(f), Some(l)) => (f, l),
            _ => return Err(Error::EmptyImage),
        };

        let data = image.bytes(first, last + 1, ERASED_BYTE);
        if self.verify(first, &data)?.is_ack() {
            info!("Verify successful");
            return Ok(());
        }

        debug!("Whole image verify failed, checking segments");

        for c in image.chunks(MAX_CHUNK) {
            let end = c.address + c.data.len() as u32;

            match self.verify(c.address, &c.data)? {
                Response::Ack => (),
                Response::CrcError => {
                    error!(
                        "Verify mismatch in between 0x{:04X}-0x{:04X}",
                        c.address, end
                    );
                    return Err(Error::VerifyMismatch {
                        start: c.address,
                        end,
                    });
                }
                response => {
                    return Err(Error::Rejected {
                        command: Command::Verify,
                        response,
                    })
                }
            }
        }

        info!("Verify successful (image gaps differ from erased flash)");

        Ok(())
    }

    /// Erase, write and verify an image
    pub fn upload(
        &mut self,
        image: &MemoryImage,
        progress: &mut dyn Progress,
    ) -> Result<(), Error<E>> {
        let last = match image.last_address() {
            Some(a) => a,
            None => return Err(Error::EmptyImage),
        };
        if last >= ADDRESS_SPACE {
            return Err(Error::AddressOutOfRange(last));
        }

        self.init()?;

        let pages = self.erase_image(image)?;
        debug!("Erased {} pages", pages);

        self.write_image(image, progress)?;

        self.verify_image(image)
    }

    fn probe(&mut self, address: u32, value: u8) -> Result<bool, Error<E>> {
        match self.verify(address, &[value])? {
            Response::Ack => Ok(true),
            Response::CrcError => Ok(false),
            response => Err(Error::Rejected {
                command: Command::Verify,
                response,
            }),
        }
    }

    /// Recover the flash byte at `address` by probing candidate values
    pub fn read_byte(&mut self, address: u32) -> Result<u8, Error<E>> {
        // Zero first, then from erased (0xFF) down
        if self.probe(address, 0x00)? {
            return Ok(0x00);
        }

        for v in (0x00..=0xFFu8).rev() {
            if self.probe(address, v)? {
                return Ok(v);
            }
        }

        error!("No value matched flash content at 0x{:04X}", address);
        Err(Error::UnresolvedByte(address))
    }

    /// Dump `flash_size` bytes of flash starting from address 0
    pub fn download(
        &mut self,
        flash_size: u32,
        progress: &mut dyn Progress,
    ) -> Result<MemoryImage, Error<E>> {
        if flash_size > ADDRESS_SPACE {
            return Err(Error::AddressOutOfRange(flash_size - 1));
        }

        self.init()?;

        let mut image = MemoryImage::new();
        progress.start(flash_size as usize);

        for address in 0..flash_size {
            let v = self.read_byte(address)?;
            debug!("flash[0x{:04X}] = 0x{:02X}", address, v);

            image.set(address, v);
            progress.update(address as usize + 1);
        }

        progress.finish();

        Ok(image)
    }
}

fn address16<E>(address: u32) -> Result<u16, Error<E>> {
    u16::try_from(address).map_err(|_| Error::AddressOutOfRange(address))
}

/// Short hex rendering of a payload for logging
fn excerpt(data: &[u8]) -> String {
    if data.len() > 8 {
        format!(
            "{}..{}",
            hex::encode(&data[..4]),
            hex::encode(&data[data.len() - 4..])
        )
    } else {
        hex::encode(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDelay, SimDevice, SimError};
    use std::borrow::Cow;

    type SimProgrammer = Programmer<SimDevice, SimDelay, SimError>;

    fn programmer(dev: SimDevice) -> SimProgrammer {
        Programmer::new(dev, SimDelay::default(), Options::default())
    }

    fn ready(dev: SimDevice) -> SimProgrammer {
        let mut p = programmer(dev);
        p.init().unwrap();
        p.port_mut().clear_log();
        p
    }

    fn image_from(ranges: &[(u32, u32)]) -> MemoryImage {
        ranges
            .iter()
            .flat_map(|&(s, e)| (s..e).map(|a| (a, (a as u8) ^ 0x5A)))
            .collect()
    }

    #[derive(Default)]
    struct Recorder {
        total: usize,
        updates: Vec<usize>,
        finished: bool,
    }

    impl Progress for Recorder {
        fn start(&mut self, total: usize) {
            self.total = total;
        }
        fn update(&mut self, done: usize) {
            self.updates.push(done);
        }
        fn finish(&mut self) {
            self.finished = true;
        }
    }

    #[test]
    fn init_trains_and_unlocks() {
        let mut p = programmer(SimDevice::new(1024, (0x30, 0x02)));
        assert_eq!(p.state(), State::Init);

        p.init().unwrap();

        assert_eq!(p.state(), State::Ready);
        assert_eq!(p.port().training(), 1);
        assert!(p.port().unlocked());
        assert_eq!(p.port().log(), &[(Command::Setup, SETUP_KEY.to_vec())][..]);
    }

    #[test]
    fn setup_rejected() {
        let mut dev = SimDevice::new(1024, (0x30, 0x02));
        dev.reply_override = Some(Response::BadId as u8);

        let mut p = programmer(dev);
        assert_eq!(p.init(), Err(Error::SetupFailed(Response::BadId)));
        assert_eq!(p.state(), State::Init);
    }

    #[test]
    fn response_timeout() {
        let mut dev = SimDevice::new(1024, (0x30, 0x02));
        dev.mute = true;

        let mut p = programmer(dev);
        assert_eq!(p.check_id(0x30, 0x02), Err(Error::ResponseTimeout));

        let (_, delay) = p.into_inner();
        assert!(delay.elapsed_ms > 1000);
    }

    /// Port whose reads block like a tty with a read timeout set
    struct BlockingPort {
        inner: SimDevice,
        block_ms: u64,
    }

    impl Write<u8> for BlockingPort {
        type Error = SimError;

        fn write(&mut self, word: u8) -> nb::Result<(), SimError> {
            self.inner.write(word)
        }

        fn flush(&mut self) -> nb::Result<(), SimError> {
            self.inner.flush()
        }
    }

    impl Read<u8> for BlockingPort {
        type Error = SimError;

        fn read(&mut self) -> nb::Result<u8, SimError> {
            std::thread::sleep(Duration::from_millis(self.block_ms));
            self.inner.read()
        }
    }

    struct SleepDelay;

    impl DelayMs<u32> for SleepDelay {
        fn delay_ms(&mut self, ms: u32) {
            std::thread::sleep(Duration::from_millis(ms as u64));
        }
    }

    #[test]
    fn timeout_includes_time_blocked_in_read() {
        let mut dev = SimDevice::new(1024, (0x30, 0x02));
        dev.mute = true;

        let options = Options {
            response_timeout_ms: 200,
            poll_delay_ms: 10,
            ..Options::default()
        };
        let port = BlockingPort {
            inner: dev,
            block_ms: 10,
        };
        let mut p: Programmer<BlockingPort, SleepDelay, SimError> =
            Programmer::new(port, SleepDelay, options);

        let start = Instant::now();
        assert_eq!(p.check_id(0x30, 0x02), Err(Error::ResponseTimeout));
        let elapsed = start.elapsed();

        // Counting only the poll delays would take twice the timeout
        assert!(elapsed >= Duration::from_millis(200), "took {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(350), "took {:?}", elapsed);
    }

    #[test]
    fn unknown_response_is_not_ack() {
        let mut dev = SimDevice::new(1024, (0x30, 0x02));
        dev.reply_override = Some(0x99);

        let mut p = programmer(dev);
        assert_eq!(p.check_id(0x30, 0x02), Err(Error::UnknownResponse(0x99)));
    }

    #[test]
    fn serial_errors_propagate() {
        let mut dev = SimDevice::new(1024, (0x30, 0x02));
        dev.disconnected = true;

        let mut p = programmer(dev);
        assert_eq!(p.init(), Err(Error::Serial(SimError::Disconnected)));
    }

    #[test]
    fn invalid_payload_length() {
        let mut p = programmer(SimDevice::new(1024, (0x30, 0x02)));
        assert_eq!(
            p.command(Command::Identify, &[0x30]),
            Err(Error::Length(LengthError { len: 1 }))
        );
        assert!(p.port().log().is_empty());
    }

    #[test]
    fn scan_stops_at_first_match() {
        let table = [DeviceDescriptor {
            id: 0x30,
            name: Cow::Borrowed("EFM8BB1"),
            variants: &[(0x02, "EFM8BB10F8G_QFN20")],
        }];

        let mut p = programmer(SimDevice::new(1024, (0x30, 0x02)));
        let m = p.scan(&table).unwrap();

        assert_eq!(m.name(), "EFM8BB10F8G_QFN20");
        assert_eq!(m.device_name, "EFM8BB1");
        assert_eq!((m.device_id, m.variant_id), (0x30, 0x02));

        // Variants 0, 1 and 2 only
        let dev = p.port();
        assert_eq!(dev.count(Command::Identify), 3);
        assert_eq!(dev.log().last().unwrap().1, vec![0x30, 0x02]);
    }

    #[test]
    fn identify_known_device() {
        let mut p = programmer(SimDevice::new(1024, (0x32, 0x03)));
        let m = p.identify().unwrap();

        assert_eq!(m.device_name, "EFM8BB2");
        assert_eq!(m.name(), "EFM8BB21F16G_QFN20");

        // All of EFM8BB1 then variants 0..=3 of EFM8BB2
        assert_eq!(p.port().count(Command::Identify), 25 + 4);
    }

    #[test]
    fn identify_unknown_variant() {
        let mut p = programmer(SimDevice::new(1024, (0x16, 0x07)));
        let m = p.identify().unwrap();

        assert_eq!(m.device_name, "EFM8SB2");
        assert_eq!(m.name(), "UNKNOWN_VARIANT_ID_0x07");
    }

    #[test]
    fn identify_not_found() {
        let mut p = programmer(SimDevice::new(1024, (0x20, 0x01)));
        assert_eq!(p.identify(), Err(Error::DeviceNotFound));
        assert_eq!(p.port().count(Command::Identify), 3 * 25);
    }

    #[test]
    fn identify_unknown_ids() {
        let options = Options {
            scan_unknown_ids: true,
            ..Options::default()
        };
        let mut p: SimProgrammer = Programmer::new(
            SimDevice::new(1024, (0x20, 0x01)),
            SimDelay::default(),
            options,
        );

        let m = p.identify().unwrap();
        assert_eq!(m.device_name, "UNKNOWN_ID_0x20");
        assert_eq!(m.name(), "UNKNOWN_VARIANT_ID_0x01");
    }

    #[test]
    fn write_limits() {
        let mut p = ready(SimDevice::new(1024, (0x30, 0x02)));

        assert_eq!(p.write(0, &[0u8; 129]), Err(Error::ChunkTooLong(129)));
        assert_eq!(
            p.write(0xFFF0, &[0u8; 32]),
            Err(Error::AddressOutOfRange(0x1000F))
        );
        assert!(p.port().log().is_empty());

        p.write(0x10, &[0xAB; 128]).unwrap();
        let (cmd, payload) = &p.port().log()[0];
        assert_eq!(*cmd, Command::Write);
        assert_eq!(payload.len(), 130);
        assert_eq!(&payload[..2], &[0x00, 0x10]);
        assert_eq!(&p.port().flash[0x10..0x90], &[0xAB; 128][..]);
    }

    #[test]
    fn write_rejected() {
        // Flash access not enabled
        let mut p = programmer(SimDevice::new(1024, (0x30, 0x02)));
        assert_eq!(
            p.write(0x10, &[1, 2, 3]),
            Err(Error::WriteFailed {
                address: 0x10,
                response: Response::BadId
            })
        );
    }

    #[test]
    fn erase_rejected() {
        let mut p = ready(SimDevice::new(1024, (0x30, 0x02)));
        assert_eq!(
            p.erase_page(&FlashPage::new(4)),
            Err(Error::EraseFailed {
                page: 4,
                response: Response::RangeError
            })
        );
    }

    #[test]
    fn upload_end_to_end() {
        let image = image_from(&[(0, 4), (1000, 1003)]);
        let mut progress = Recorder::default();

        let mut p = programmer(SimDevice::new(8192, (0x30, 0x02)));
        p.upload(&image, &mut progress).unwrap();

        let dev = p.port();
        let erases: Vec<_> = dev
            .log()
            .iter()
            .filter(|(c, _)| *c == Command::Erase)
            .map(|(_, p)| p.clone())
            .collect();
        assert_eq!(erases, vec![vec![0x00, 0x00], vec![0x02, 0x00]]);

        assert_eq!(dev.count(Command::Write), 2);
        assert!(dev
            .log()
            .iter()
            .filter(|(c, _)| *c == Command::Write)
            .all(|(_, p)| p.len() <= 130));

        // Whole image verify passes, no chunked fallback
        assert_eq!(dev.count(Command::Verify), 1);

        for a in image.addresses() {
            assert_eq!(Some(dev.flash[a as usize]), image.get(a));
        }

        assert_eq!(progress.total, 7);
        assert_eq!(progress.updates, vec![4, 7]);
        assert!(progress.finished);
    }

    #[test]
    fn upload_long_segment() {
        let image = image_from(&[(0x100, 0x100 + 300)]);

        let mut p = programmer(SimDevice::new(8192, (0x30, 0x02)));
        p.upload(&image, &mut NoProgress).unwrap();

        // ceil(300 / 128)
        assert_eq!(p.port().count(Command::Write), 3);
        assert_eq!(p.port().count(Command::Erase), 1);
    }

    #[test]
    fn verify_locates_mismatch() {
        let image = image_from(&[(0, 4), (1000, 1003)]);

        let mut dev = SimDevice::new(8192, (0x30, 0x02));
        dev.stuck_address = Some(1001);

        let mut p = programmer(dev);
        assert_eq!(
            p.upload(&image, &mut NoProgress),
            Err(Error::VerifyMismatch {
                start: 1000,
                end: 1003
            })
        );

        // Whole range, then both chunks
        assert_eq!(p.port().count(Command::Verify), 3);
    }

    #[test]
    fn verify_tolerates_untouched_gaps() {
        // Page 1 is not part of the image and holds other data
        let image = image_from(&[(0, 4), (1100, 1104)]);

        let mut dev = SimDevice::new(8192, (0x30, 0x02));
        for b in &mut dev.flash[512..1024] {
            *b = 0x00;
        }

        let mut p = programmer(dev);
        p.upload(&image, &mut NoProgress).unwrap();

        assert_eq!(p.port().count(Command::Erase), 2);
        assert_eq!(p.port().count(Command::Verify), 3);
        assert_eq!(p.port().flash[600], 0x00);
    }

    #[test]
    fn upload_rejects_bad_images() {
        let mut p = programmer(SimDevice::new(1024, (0x30, 0x02)));
        assert_eq!(
            p.upload(&MemoryImage::new(), &mut NoProgress),
            Err(Error::EmptyImage)
        );

        let image: MemoryImage = vec![(0x1_0000, 0u8)].into_iter().collect();
        assert_eq!(
            p.upload(&image, &mut NoProgress),
            Err(Error::AddressOutOfRange(0x1_0000))
        );
        assert!(p.port().log().is_empty());
    }

    #[test]
    fn read_zero_byte() {
        let mut dev = SimDevice::new(1024, (0x30, 0x02));
        dev.flash[10] = 0x00;

        let mut p = ready(dev);
        assert_eq!(p.read_byte(10), Ok(0x00));
        assert_eq!(p.port().count(Command::Verify), 1);
    }

    #[test]
    fn read_erased_byte() {
        let mut dev = SimDevice::new(1024, (0x30, 0x02));
        dev.flash[11] = 0xFF;

        let mut p = ready(dev);
        assert_eq!(p.read_byte(11), Ok(0xFF));
        assert_eq!(p.port().count(Command::Verify), 2);

        let (_, payload) = &p.port().log()[1];
        assert_eq!(payload, &verify_payload(11, 12, crc16(&[0xFF])).to_vec());
    }

    #[test]
    fn read_arbitrary_byte() {
        let mut dev = SimDevice::new(1024, (0x30, 0x02));
        dev.flash[12] = 0x80;

        let mut p = ready(dev);
        assert_eq!(p.read_byte(12), Ok(0x80));
        // Zero, then 0xFF down to 0x80
        assert_eq!(p.port().count(Command::Verify), 1 + 128);
    }

    #[test]
    fn read_unresolved() {
        let mut p = ready(SimDevice::new(1024, (0x30, 0x02)));
        p.port_mut().reply_override = Some(Response::CrcError as u8);

        assert_eq!(p.read_byte(12), Err(Error::UnresolvedByte(12)));
        assert_eq!(p.port().count(Command::Verify), 257);
    }

    #[test]
    fn read_out_of_range() {
        let mut p = ready(SimDevice::new(1024, (0x30, 0x02)));
        assert_eq!(
            p.read_byte(2000),
            Err(Error::Rejected {
                command: Command::Verify,
                response: Response::RangeError
            })
        );
        assert_eq!(p.port().count(Command::Verify), 1);
    }

    #[test]
    fn download_recovers_flash() {
        let mut dev = SimDevice::new(1024, (0x30, 0x02));
        for (i, b) in dev.flash.iter_mut().take(48).enumerate() {
            *b = (i as u8).wrapping_mul(37);
        }
        let expected: Vec<u8> = dev.flash[..48].to_vec();

        let mut progress = Recorder::default();
        let mut p = programmer(dev);
        let image = p.download(48, &mut progress).unwrap();

        assert_eq!(image.len(), 48);
        assert_eq!(image.bytes(0, 48, 0xAA), expected);
        assert_eq!(progress.total, 48);
        assert_eq!(progress.updates.last(), Some(&48));
        assert!(progress.finished);
    }

    #[test]
    fn download_size_limit() {
        let mut p = programmer(SimDevice::new(1024, (0x30, 0x02)));
        assert_eq!(
            p.download(0x1_0001, &mut NoProgress),
            Err(Error::AddressOutOfRange(0x1_0000))
        );
    }

    #[test]
    fn excerpt_format() {
        assert_eq!(excerpt(&[1, 2, 3]), "010203");
        assert_eq!(excerpt(&[0u8; 10]), "00000000..00000000");
    }
}
