//! xflash - flash XMEGA devices over the USB bulk bootloader
//!
//! Finds the target (resetting it out of its application if necessary), writes an Intel-HEX image
//! and compares the CRC the bootloader reports against the one computed from the image.

use std::path::PathBuf;
use std::process;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::LevelFilter;
use xflash::{
    Bootloader, Context, Discovery, DiscoveryConfig, Error, Filter, HexImage, Operation,
    SessionConfig, PACKET_SIZE,
};

/// Parse a hex value with or without `0x` prefix
fn parse_hex<T>(
    s: &str,
    from: fn(&str, u32) -> Result<T, std::num::ParseIntError>,
) -> Result<T, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    from(digits, 16).map_err(|e| format!("Invalid hex value: {}", e))
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    parse_hex(s, u16::from_str_radix)
}

fn parse_hex_u8(s: &str) -> Result<u8, String> {
    parse_hex(s, u8::from_str_radix)
}

#[derive(Parser)]
#[command(name = "xflash")]
#[command(author, about = "Flash XMEGA devices over the USB bootloader", long_about = None)]
struct Cli {
    /// Firmware image (Intel-HEX)
    #[arg(required_unless_present = "info")]
    image: Option<PathBuf>,

    /// Verbosity level (0 = warnings, 1 = info, 2 = debug, 3 = trace)
    #[arg(short = 'V', long, default_value_t = 1)]
    verbosity: u8,

    /// Only match devices with this vendor ID (hex)
    #[arg(short = 'v', long = "vendor", value_parser = parse_hex_u16)]
    vendor_id: Option<u16>,

    /// Only match devices with this product ID (hex)
    #[arg(short = 'p', long = "product", value_parser = parse_hex_u16)]
    product_id: Option<u16>,

    /// Bulk packet size expected by the bootloader firmware
    #[arg(long, default_value_t = PACKET_SIZE)]
    packet_size: usize,

    /// Value of erased flash, used to pad the CRC (hex)
    #[arg(long, default_value = "ff", value_parser = parse_hex_u8)]
    pad: u8,

    /// Accept records with a wrong checksum
    #[arg(long)]
    no_checksum: bool,

    /// Print device information and exit
    #[arg(long)]
    info: bool,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.as_str()))
        .init();

    if let Err(e) = run(&cli) {
        log::error!("{:?} error: {}", e.kind(), e);
        process::exit(e.exit_code());
    }
}

fn run(cli: &Cli) -> Result<(), Error> {
    // Open the image before touching the device
    let image = match &cli.image {
        Some(path) if !cli.info => Some(
            HexImage::open(path)?.with_checksum_validation(!cli.no_checksum),
        ),
        _ => None,
    };

    let context = Context::new()?;
    let discovery = Discovery::new(&context, DiscoveryConfig::default());
    let filter = Filter::new(cli.vendor_id, cli.product_id);
    let handle = discovery.open_bootloader(&filter)?;

    let config = SessionConfig {
        packet_size: cli.packet_size,
        ..SessionConfig::default()
    };
    let mut bootloader = Bootloader::open(handle, config)?;
    println!("{}", bootloader.info()?);

    let mut image = match image {
        Some(image) => image,
        None => {
            println!("Boot CRC: 0x{:06x}", bootloader.read_boot_crc()?);
            println!("App CRC: 0x{:06x}", bootloader.read_app_crc()?);
            bootloader.close();
            return Ok(());
        }
    };

    let mem_size = bootloader.info()?.mem_size;
    image.compute_crc(mem_size, cli.pad)?;
    println!("File CRC: 0x{:06x}", image.crc().unwrap_or_default());

    {
        let mut program = bootloader.write_image(&mut image)?;
        let pb = ProgressBar::new(program.total() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );

        for progress in &mut program {
            match progress {
                Ok(written) => pb.set_position(written as u64),
                Err(e) => {
                    pb.abandon_with_message("Write failed");
                    return Err(e);
                }
            }
        }
        pb.finish_with_message("Write complete");
    }

    match bootloader.verify(&image) {
        Ok(()) => {
            println!("CRC matches, device reset");
            bootloader.close();
            Ok(())
        }
        Err(e) => {
            // The device stays in the bootloader for inspection
            bootloader.close();
            Err(e)
        }
    }
}
