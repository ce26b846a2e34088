//! Streaming decoder for Intel-HEX firmware images.
//!
//! The decoder is fed arbitrary chunks of the image text. A chunk may end anywhere, including
//! between the two characters of a hex byte, so the decoder keeps its position within the current
//! record across calls. Records are handed out one at a time and borrow the decoder's record
//! buffer, so memory use does not depend on the size of the image.

use std::convert::TryFrom;
use std::fs::File;
use std::io::{ErrorKind as IoErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

use crate::crc::{device_words, Crc24};
use crate::error::{Error, Result};

/// Marks the beginning of every record.
pub const START_CODE: u8 = b':';

/// Length, two address bytes and the record type.
pub const HEADER_LEN: usize = 4;

/// Largest possible binary record: header, 255 data bytes and the checksum.
pub const MAX_RECORD_LEN: usize = HEADER_LEN + 255 + 1;

/// Default number of bytes read from the image per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 128;

/// Record types defined by the hex format.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecordType {
    Data = 0x00,
    EndOfFile = 0x01,
    ExtendedSegmentAddress = 0x02,
    StartSegmentAddress = 0x03,
    ExtendedLinearAddress = 0x04,
    StartLinearAddress = 0x05,
}

impl TryFrom<u8> for RecordType {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self> {
        Ok(match code {
            0x00 => RecordType::Data,
            0x01 => RecordType::EndOfFile,
            0x02 => RecordType::ExtendedSegmentAddress,
            0x03 => RecordType::StartSegmentAddress,
            0x04 => RecordType::ExtendedLinearAddress,
            0x05 => RecordType::StartLinearAddress,
            other => return Err(Error::UnknownRecordType(other)),
        })
    }
}

/// A single decoded record. The payload borrows from the decoder that produced it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HexRecord<'a> {
    /// Declared number of payload bytes.
    pub length: u8,

    /// Load offset of the first payload byte.
    pub address: u16,

    pub record_type: RecordType,

    /// Exactly `length` bytes.
    pub data: &'a [u8],

    /// Trailing checksum byte as stored in the image.
    pub checksum: u8,
}

impl HexRecord<'_> {
    /// The checksum this record should carry: the two's complement of the sum of all other bytes.
    pub fn expected_checksum(&self) -> u8 {
        let [address_high, address_low] = self.address.to_be_bytes();
        let sum = [self.length, address_high, address_low, self.record_type as u8]
            .iter()
            .chain(self.data)
            .fold(0u8, |sum, byte| sum.wrapping_add(*byte));
        sum.wrapping_neg()
    }

    /// Interprets the payload of an address record as a big-endian 16-bit value.
    fn address_payload(&self) -> Result<u16> {
        match self.data {
            [high, low] => Ok(u16::from_be_bytes([*high, *low])),
            _ => Err(Error::MalformedRecord("address record must carry two bytes")),
        }
    }
}

fn nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'A'..=b'F' => Some(c - b'A' + 0xa),
        _ => None,
    }
}

/// Chunk-fed hex record decoder.
#[derive(Clone, Debug)]
pub struct HexDecoder {
    buffer: [u8; MAX_RECORD_LEN],

    /// Number of bytes of the current record decoded so far, `None` while looking for the next
    /// start code.
    bin_count: Option<usize>,

    /// Declared payload length of the current record, known once its first byte is decoded.
    record_len: usize,

    /// First character of a byte whose second character is still outstanding.
    high_nibble: Option<u8>,

    /// The buffer holds a complete record.
    complete: bool,

    /// An end-of-file record has been decoded.
    finished: bool,

    validate_checksums: bool,

    /// Input bytes consumed so far, for error reporting.
    offset: u64,
}

impl Default for HexDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HexDecoder {
    pub fn new() -> Self {
        Self {
            buffer: [0; MAX_RECORD_LEN],
            bin_count: None,
            record_len: 0,
            high_nibble: None,
            complete: false,
            finished: false,
            validate_checksums: true,
            offset: 0,
        }
    }

    /// Enables or disables rejecting records with a wrong checksum. Enabled by default.
    pub fn with_checksum_validation(mut self, validate: bool) -> Self {
        self.validate_checksums = validate;
        self
    }

    /// Returns true once the end-of-file record has been decoded.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Total binary size of the current record.
    fn expected_len(&self) -> usize {
        HEADER_LEN + self.record_len + 1
    }

    /// Consumes input until a record is complete or the input is exhausted. Returns the number of
    /// bytes consumed and whether a complete record is now available via [`record`].
    ///
    /// Bytes outside of records, line endings included, are skipped. Once the end-of-file record
    /// has been decoded, no further input is consumed.
    ///
    /// [`record`]: #method.record
    pub fn push(&mut self, input: &[u8]) -> Result<(usize, bool)> {
        if self.finished {
            return Ok((0, false));
        }
        if self.complete {
            self.complete = false;
            self.bin_count = None;
            self.record_len = 0;
        }

        for (i, &c) in input.iter().enumerate() {
            let count = match self.bin_count {
                None => {
                    if c == START_CODE {
                        self.bin_count = Some(0);
                    } else if !c.is_ascii_whitespace() {
                        log::trace!("Skipping 0x{:02x} outside of record", c);
                    }
                    continue;
                }
                Some(count) => count,
            };

            let low = nibble(c).ok_or(Error::InvalidCharacter {
                byte: c,
                offset: self.offset + i as u64,
            })?;
            let high = match self.high_nibble.take() {
                Some(high) => high,
                None => {
                    self.high_nibble = Some(low);
                    continue;
                }
            };

            let byte = (high << 4) | low;
            if count == 0 {
                self.record_len = byte as usize;
            }
            self.buffer[count] = byte;
            self.bin_count = Some(count + 1);

            if count + 1 == self.expected_len() {
                self.offset += i as u64 + 1;
                self.finish_record()?;
                return Ok((i + 1, true));
            }
        }

        self.offset += input.len() as u64;
        Ok((input.len(), false))
    }

    /// Checks the record just completed in the buffer.
    fn finish_record(&mut self) -> Result<()> {
        self.complete = true;
        let record = self.current()?;

        if self.validate_checksums {
            let computed = record.expected_checksum();
            if computed != record.checksum {
                return Err(Error::ChecksumMismatch {
                    stored: record.checksum,
                    computed,
                });
            }
        }

        if record.record_type == RecordType::EndOfFile {
            self.finished = true;
        }
        Ok(())
    }

    fn current(&self) -> Result<HexRecord<'_>> {
        let len = self.record_len;
        Ok(HexRecord {
            length: self.buffer[0],
            address: u16::from_be_bytes([self.buffer[1], self.buffer[2]]),
            record_type: RecordType::try_from(self.buffer[3])?,
            data: &self.buffer[HEADER_LEN..HEADER_LEN + len],
            checksum: self.buffer[HEADER_LEN + len],
        })
    }

    /// Returns the record completed by the last call to [`push`], if any.
    ///
    /// [`push`]: #method.push
    pub fn record(&self) -> Option<HexRecord<'_>> {
        if self.complete {
            self.current().ok()
        } else {
            None
        }
    }
}

/// Address bookkeeping collected during the first full pass over an image.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Extent {
    /// Highest address holding image data.
    pub max_address: u32,

    /// Number of data bytes in the image.
    pub total_size: usize,

    /// Set once a pass has reached the end-of-file record; no further accounting happens then.
    pub scanned: bool,
}

impl Extent {
    fn track(&mut self, base_address: &mut u32, record: &HexRecord<'_>) -> Result<()> {
        match record.record_type {
            RecordType::Data if !record.data.is_empty() => {
                let last = base_address
                    .checked_add(u32::from(record.address) + record.data.len() as u32 - 1)
                    .ok_or(Error::MalformedRecord("data beyond 32-bit address space"))?;
                self.max_address = self.max_address.max(last);
                self.total_size += record.data.len();
            }
            RecordType::ExtendedSegmentAddress => {
                *base_address = u32::from(record.address_payload()?) << 4;
            }
            RecordType::ExtendedLinearAddress => {
                *base_address = u32::from(record.address_payload()?) << 16;
            }
            RecordType::EndOfFile => self.scanned = true,
            _ => {}
        }
        Ok(())
    }
}

/// A single pass over the records of a [`HexImage`].
///
/// [`HexImage`]: struct.HexImage.html
pub struct Records<'a, R> {
    reader: &'a mut R,
    extent: &'a mut Extent,

    /// Extent of this pass, handed over to `extent` once the pass reaches the end-of-file record.
    staged: Extent,
    decoder: HexDecoder,
    chunk: Vec<u8>,
    pos: usize,
    filled: usize,
    base_address: u32,
}

impl<R: Read> Records<'_, R> {
    /// Decodes the next record. Returns `None` after the end-of-file record has been returned.
    pub fn next_record(&mut self) -> Result<Option<HexRecord<'_>>> {
        if self.decoder.is_finished() {
            return Ok(None);
        }

        loop {
            if self.pos == self.filled {
                self.filled = match self.reader.read(&mut self.chunk) {
                    Ok(n) => n,
                    Err(e) if e.kind() == IoErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                };
                self.pos = 0;
                if self.filled == 0 {
                    return Err(Error::UnexpectedEnd);
                }
                log::trace!("Read {} bytes of image", self.filled);
            }

            let (used, complete) = self.decoder.push(&self.chunk[self.pos..self.filled])?;
            self.pos += used;
            if complete {
                break;
            }
        }

        let record = self
            .decoder
            .record()
            .ok_or(Error::MalformedRecord("record incomplete"))?;
        log::trace!(
            "Record {:?} at 0x{:04x}, {} bytes",
            record.record_type,
            record.address,
            record.length
        );
        if !self.extent.scanned {
            self.staged.track(&mut self.base_address, &record)?;
            if self.staged.scanned {
                *self.extent = self.staged;
            }
        }
        Ok(Some(record))
    }
}

/// A hex image backed by a seekable byte source, decoded in one or more passes.
pub struct HexImage<R = File> {
    reader: R,
    extent: Extent,
    crc: Option<u32>,
    chunk_size: usize,
    validate_checksums: bool,
}

impl HexImage<File> {
    /// Opens a hex file from disk.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        log::info!("Loading {}", path.as_ref().display());
        Ok(Self::from_reader(File::open(path)?))
    }
}

impl<R: Read + Seek> HexImage<R> {
    pub fn from_reader(reader: R) -> Self {
        Self {
            reader,
            extent: Extent::default(),
            crc: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            validate_checksums: true,
        }
    }

    /// Sets how many bytes are read from the source at a time.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Enables or disables rejecting records with a wrong checksum. Enabled by default.
    pub fn with_checksum_validation(mut self, validate: bool) -> Self {
        self.validate_checksums = validate;
        self
    }

    /// Moves back to the start of the image. Required before every pass but the first.
    pub fn rewind(&mut self) -> Result<()> {
        self.reader.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// Starts a pass over the records from the current position of the source.
    pub fn records(&mut self) -> Records<'_, R> {
        Records {
            reader: &mut self.reader,
            extent: &mut self.extent,
            staged: Extent::default(),
            decoder: HexDecoder::new().with_checksum_validation(self.validate_checksums),
            chunk: vec![0; self.chunk_size],
            pos: 0,
            filled: 0,
            base_address: 0,
        }
    }

    /// Makes a complete pass over the image to collect its extent, unless that already happened.
    pub fn scan(&mut self) -> Result<()> {
        if self.extent.scanned {
            return Ok(());
        }
        self.rewind()?;
        let mut records = self.records();
        while records.next_record()?.is_some() {}
        Ok(())
    }

    /// Computes the CRC the bootloader will report after flashing this image, for a device whose
    /// memory ends at `mem_size` and whose erased flash reads as `pad`. Stores and returns it.
    pub fn compute_crc(&mut self, mem_size: u32, pad: u8) -> Result<u32> {
        self.rewind()?;
        let mut crc = Crc24::new();
        let mut records = self.records();
        while let Some(record) = records.next_record()? {
            if record.record_type == RecordType::EndOfFile {
                log::debug!("Skipping EOF record for CRC");
                continue;
            }
            crc.update_record(record.data);
        }
        crc.pad_to(device_words(mem_size), pad);

        let value = crc.value();
        log::info!("Image CRC: 0x{:06x}", value);
        self.crc = Some(value);
        Ok(value)
    }

    /// CRC from the last call to [`compute_crc`].
    ///
    /// [`compute_crc`]: #method.compute_crc
    pub fn crc(&self) -> Option<u32> {
        self.crc
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    pub fn max_address(&self) -> u32 {
        self.extent.max_address
    }

    pub fn total_size(&self) -> usize {
        self.extent.total_size
    }

    pub fn is_scanned(&self) -> bool {
        self.extent.scanned
    }
}
