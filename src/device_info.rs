//! Contains data structures for information the bootloader reports back to the connecting PC.

use std::convert::TryInto;
use std::fmt;

use crate::error::{Error, Result};

/// Size of the info block returned by the `INFO` request.
pub const DEVICE_INFO_LEN: usize = 64;

/// Known parts, keyed by the signature bytes following the Atmel manufacturer code.
const PARTS: [([u8; 2], &str); 4] = [
    ([0x94, 0x41], "ATxmega16A4U"),
    ([0x95, 0x41], "ATxmega32A4U"),
    ([0x96, 0x46], "ATxmega64A4U"),
    ([0x97, 0x46], "ATxmega128A4U"),
];

const ATMEL_MANUFACTURER: u8 = 0x1e;

/// Splits the first `N` bytes off a slice.
fn read_array<const N: usize>(input: &mut &[u8]) -> Result<[u8; N]> {
    if input.len() < N {
        return Err(Error::MalformedResponse);
    }
    let (bytes, rest) = input.split_at(N);
    *input = rest;
    bytes.try_into().map_err(|_| Error::MalformedResponse)
}

/// Converts a NUL-padded string field into a `String`.
fn read_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Resolves a part ID to the device name, for display only.
pub fn part_name(part_id: &[u8]) -> &'static str {
    match part_id {
        [ATMEL_MANUFACTURER, signature @ ..] if signature.len() >= 2 => PARTS
            .iter()
            .find(|(id, _)| id[..] == signature[..2])
            .map(|(_, name)| *name)
            .unwrap_or("Unknown Device"),
        _ => "Unknown Device",
    }
}

/// Information read back from the bootloader once per session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceInfo {
    pub magic: [u8; 4],

    /// Bootloader protocol version.
    pub version: u8,

    /// Device signature bytes.
    pub part_id: [u8; 4],

    /// Flash page size in bytes.
    pub page_size: u16,

    /// Last valid application flash address, i.e. memory size - 1.
    pub mem_size: u32,

    /// Address the bootloader jumps to when starting the application.
    pub jump_address: u32,

    pub product: String,
    pub hw_version: String,
}

impl DeviceInfo {
    /// Decodes the packed little-endian info block.
    pub fn parse(packet: &[u8]) -> Result<Self> {
        if packet.len() < DEVICE_INFO_LEN {
            return Err(Error::MalformedResponse);
        }

        let mut input = packet;
        let magic = read_array::<4>(&mut input)?;
        let [version] = read_array::<1>(&mut input)?;
        let part_id = read_array::<4>(&mut input)?;
        let page_size = u16::from_le_bytes(read_array(&mut input)?);
        let mem_size = u32::from_le_bytes(read_array(&mut input)?);
        let jump_address = u32::from_le_bytes(read_array(&mut input)?);
        let product = read_string(&read_array::<16>(&mut input)?);
        let hw_version = read_string(&read_array::<16>(&mut input)?);

        Ok(DeviceInfo {
            magic,
            version,
            part_id,
            page_size,
            mem_size,
            jump_address,
            product,
            hw_version,
        })
    }

    /// Size of the application flash in bytes.
    pub fn memory_size(&self) -> u64 {
        u64::from(self.mem_size) + 1
    }

    pub fn part_name(&self) -> &'static str {
        part_name(&self.part_id)
    }
}

struct Hex<'a>(&'a [u8]);

impl fmt::Display for Hex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Magic: {}", Hex(&self.magic))?;
        writeln!(f, "Version: {}", self.version)?;
        writeln!(f, "Part: {} ({})", Hex(&self.part_id), self.part_name())?;
        writeln!(f, "Page size: {} bytes", self.page_size)?;
        writeln!(f, "Memory size: {} bytes", self.memory_size())?;
        writeln!(f, "Jump address: 0x{:x}", self.jump_address)?;
        writeln!(f, "Product: {}", self.product)?;
        write!(f, "Hardware version: {}", self.hw_version)
    }
}
