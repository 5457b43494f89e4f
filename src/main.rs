#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::path::PathBuf;

use anyhow::{anyhow, Context};
use indicatif::{ProgressBar, ProgressStyle};

use efm8_uart_loader::{hexfile, Options, Programmer, Progress, DEFAULT_FLASH_SIZE};

#[derive(Clone, Debug, StructOpt)]
#[structopt(about = "Utility for the EFM8 factory UART bootloader")]
pub struct Args {
    /// Upload the given hex file to the flash memory
    #[structopt(short = "w", long = "write", parse(from_os_str), conflicts_with_all = &["read", "identify"])]
    write: Option<PathBuf>,

    /// Download the flash memory contents to the given hex file
    #[structopt(short = "r", long = "read", parse(from_os_str), conflicts_with = "identify")]
    read: Option<PathBuf>,

    /// Identify the chip
    #[structopt(short = "i", long = "identify")]
    identify: bool,

    /// Serial port to connect to
    #[structopt(short = "p", long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(short = "b", long, default_value = "115200")]
    baud: usize,

    /// Flash size to dump when reading, in bytes or with a unit (eg. 8KiB)
    #[structopt(long, default_value = "8192", parse(try_from_str = parse_size))]
    flash_size: u32,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

fn parse_size(s: &str) -> anyhow::Result<u32> {
    let n = match s.parse::<u64>() {
        Ok(n) => n,
        Err(_) => bytefmt::parse(s).map_err(|e| anyhow!("invalid size '{}': {}", s, e))?,
    };
    if n == 0 || n > 0x1_0000 {
        return Err(anyhow!("size {} outside of 1B..=64KiB", s));
    }
    Ok(n as u32)
}

/// Progress bar adaptor for the programmer
struct Bar(ProgressBar);

impl Bar {
    fn new() -> Self {
        let pb = ProgressBar::hidden();
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
                .progress_chars("#>-"),
        );
        Self(pb)
    }
}

impl Progress for Bar {
    fn start(&mut self, total: usize) {
        self.0.set_length(total as u64);
        self.0.set_position(0);
        self.0.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    }

    fn update(&mut self, done: usize) {
        self.0.set_position(done as u64);
    }

    fn finish(&mut self) {
        self.0.finish();
    }
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if o.write.is_none() && o.read.is_none() && !o.identify {
        let _ = Args::clap().print_help();
        println!();
        std::process::exit(1);
    }

    if let Err(e) = run(&o) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(o: &Args) -> anyhow::Result<()> {
    info!("Opening port '{}' ({} baud)", o.port, o.baud);

    let mut p = Programmer::linux(&o.port, o.baud, o.options.clone())?;

    if o.identify {
        let m = p.identify().context("identification failed")?;
        info!("Detected an {} cpu ({})", m.device_name, m.name());
    } else if let Some(path) = &o.write {
        info!("Uploading file '{}'", path.display());

        let image = hexfile::load(path)?;
        info!(
            "Loaded {} in {} segments",
            bytefmt::format(image.len() as u64),
            image.segments().len()
        );

        p.upload(&image, &mut Bar::new()).context("upload failed")?;
        info!("Upload complete");
    } else if let Some(path) = &o.read {
        if o.flash_size != DEFAULT_FLASH_SIZE {
            warn!("Dumping a non-default flash size, the bootloader cannot confirm it");
        }
        info!(
            "Dumping {} of flash to '{}', this will take a while",
            bytefmt::format(o.flash_size as u64),
            path.display()
        );

        let image = p.download(o.flash_size, &mut Bar::new()).context("download failed")?;
        hexfile::save(path, &image)?;
        info!("Wrote '{}'", path.display());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flash_sizes() {
        assert_eq!(parse_size("8192").unwrap(), 8192);
        assert_eq!(parse_size("8KiB").unwrap(), 8192);
        assert_eq!(parse_size("65536").unwrap(), 0x1_0000);
        assert_eq!(parse_size("1").unwrap(), 1);

        assert!(parse_size("0").is_err());
        assert!(parse_size("65537").is_err());
        assert!(parse_size("1MiB").is_err());
        assert!(parse_size("lots").is_err());
    }
}
