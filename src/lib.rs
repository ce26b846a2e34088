//! This crate flashes Intel-HEX firmware images onto XMEGA devices running the USB bulk
//! bootloader and verifies the result against the CRC the bootloader computes.
//!
//! # Example: Basic flashing
//! ```rust, no_run
//! use xflash::{
//!     Bootloader, Context, Discovery, DiscoveryConfig, Filter, HexImage, Operation,
//!     SessionConfig,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Find the target, resetting it into the bootloader if it runs its application
//! let context = Context::new()?;
//! let discovery = Discovery::new(&context, DiscoveryConfig::default());
//! let handle = discovery.open_bootloader(&Filter::default())?;
//!
//! // Claim the device and fetch information about it
//! let mut bootloader = Bootloader::open(handle, SessionConfig::default())?;
//! let mem_size = bootloader.info()?.mem_size;
//!
//! // First pass over the image: extent and the CRC the device should report
//! let mut image = HexImage::open("firmware.hex")?;
//! image.compute_crc(mem_size, 0xff)?;
//!
//! // Second pass: erase and program
//! bootloader.write_image(&mut image)?.execute()?;
//!
//! // Compare CRCs and start the new firmware
//! bootloader.verify(&image)?;
//! bootloader.close();
//!
//! println!("Done!");
//! # Ok(())
//! # }
//! ```
//!
//! Writing reports its progress while executing. See the [`Operation`] trait for details.
//!
//! [`Operation`]: trait.Operation.html

mod bootloader;
mod context;
mod crc;
mod device_info;
mod discovery;
mod error;
mod flash;
mod ihex;
mod operation;
mod transport;

pub use bootloader::{Bootloader, Request, SessionConfig, SessionState};
pub use context::{Context, Handle};
pub use crc::{device_words, Crc24, CRC_MASK, CRC_POLY};
pub use device_info::{part_name, DeviceInfo, DEVICE_INFO_LEN};
pub use discovery::{
    DeviceIdentity, Discovery, DiscoveryConfig, Filter, Mode, APPLICATION_ID, BOOTLOADER_ID,
    REQ_APP_RESET,
};
pub use error::{Error, ErrorKind, Result};
pub use flash::{PacketBuffer, FILL_BYTE, PACKET_SIZE};
pub use ihex::{Extent, HexDecoder, HexImage, HexRecord, RecordType, Records, MAX_RECORD_LEN};
pub use operation::{Operation, Program};
pub use transport::{DeviceDescriptor, Transport, UsbHandle, UsbId, DIRECTION_IN};

/// Timeout for all usb transactions.
const TIMEOUT: std::time::Duration = std::time::Duration::from_millis(1000);
