use std::io::Read;

use crate::bootloader::Bootloader;
use crate::error::{Error, Result};
use crate::flash::{PacketBuffer, FILL_BYTE};
use crate::ihex::{Records, RecordType};
use crate::transport::UsbHandle;

/// A long-running device operation which reports its progress while executing.
///
/// Each item is the amount of work done so far, in the same unit as [`total`]. After the first
/// error the iterator is fused.
///
/// [`total`]: #tymethod.total
pub trait Operation: Iterator<Item = Result<usize>> {
    fn total(&self) -> usize;

    fn execute(&mut self) -> Result<()> {
        if let Some(Err(error)) = self.last() {
            Err(error)
        } else {
            Ok(())
        }
    }
}

/// The bulk phase of a flashing session: packs image records into fixed-size packets and sends
/// them in record order.
///
/// Record payloads are concatenated regardless of their addresses; the firmware writes packets to
/// consecutive flash locations. After the end-of-file record the last packet is padded with
/// [`FILL_BYTE`] and always sent, even if it holds no data.
///
/// [`FILL_BYTE`]: constant.FILL_BYTE.html
pub struct Program<'s, 'i, H: UsbHandle, R> {
    session: &'s mut Bootloader<H>,
    records: Records<'i, R>,
    buffer: PacketBuffer,
    total: usize,
    done: bool,
}

impl<'s, 'i, H: UsbHandle, R: Read> Program<'s, 'i, H, R> {
    pub(crate) fn new(
        session: &'s mut Bootloader<H>,
        records: Records<'i, R>,
        packet_size: usize,
        total: usize,
    ) -> Self {
        Self {
            session,
            records,
            buffer: PacketBuffer::new(packet_size),
            total,
            done: false,
        }
    }

    /// Bytes sent so far, fill bytes included.
    pub fn flushed(&self) -> usize {
        self.buffer.flushed()
    }

    /// Processes records until at least one packet has been sent. Returns the number of bytes
    /// sent so far.
    fn step(&mut self) -> Result<usize> {
        loop {
            let record = self.records.next_record()?.ok_or(Error::UnexpectedEnd)?;

            match record.record_type {
                RecordType::Data => {
                    let mut rest = record.data;
                    let mut sent = false;
                    loop {
                        rest = self.buffer.fill(rest);
                        if let Some(packet) = self.buffer.take() {
                            self.session.write_packet(packet)?;
                            sent = true;
                        }
                        if rest.is_empty() {
                            break;
                        }
                    }
                    if sent {
                        return Ok(self.buffer.flushed());
                    }
                }
                RecordType::EndOfFile => {
                    if self.buffer.is_empty() {
                        log::debug!("Image ends on a packet boundary, last packet is all fill");
                    } else {
                        log::debug!(
                            "Last packet holds {} of {} bytes",
                            self.buffer.len(),
                            self.buffer.capacity()
                        );
                    }
                    self.buffer.pad(FILL_BYTE);
                    if let Some(packet) = self.buffer.take() {
                        self.session.write_packet(packet)?;
                    }
                    self.done = true;
                    self.session.finish_write();
                    return Ok(self.buffer.flushed());
                }
                other => log::debug!("Ignoring {:?} record", other),
            }
        }
    }
}

impl<H: UsbHandle, R: Read> Operation for Program<'_, '_, H, R> {
    fn total(&self) -> usize {
        self.total
    }
}

impl<H: UsbHandle, R: Read> Iterator for Program<'_, '_, H, R> {
    type Item = Result<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        Some(match self.step() {
            // The last packet carries fill bytes, so only the data share counts as progress
            Ok(flushed) => Ok(flushed.min(self.total)),
            Err(error) => {
                // Ensure that the iterator is fused after an error occurs
                self.done = true;
                Err(error)
            }
        })
    }
}
