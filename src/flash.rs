/// Size of a single bulk write the bootloader firmware expects. Bootloader versions with a
/// different packet size are not wire-compatible, see [`SessionConfig::packet_size`].
///
/// [`SessionConfig::packet_size`]: struct.SessionConfig.html#structfield.packet_size
pub const PACKET_SIZE: usize = 64;

/// Value written into the unused tail of the last packet. Matches erased flash.
pub const FILL_BYTE: u8 = 0xff;

/// Fixed-size staging buffer for bulk write packets.
///
/// Record payloads are appended with [`fill`]; whatever does not fit is handed back to the caller
/// and becomes the start of the next packet once the full one has been taken with [`take`]. Between
/// calls the fill level is always below the packet size.
///
/// [`fill`]: #method.fill
/// [`take`]: #method.take
#[derive(Clone, Debug)]
pub struct PacketBuffer {
    buffer: Vec<u8>,
    count: usize,
    flushed: usize,
}

impl PacketBuffer {
    /// Creates an empty buffer for packets of `size` bytes. A size of zero is raised to one.
    pub fn new(size: usize) -> Self {
        Self {
            buffer: vec![FILL_BYTE; size.max(1)],
            count: 0,
            flushed: 0,
        }
    }

    /// Packet size in bytes.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes currently staged.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.buffer.len()
    }

    /// Total bytes handed out by [`take`] so far.
    ///
    /// [`take`]: #method.take
    pub fn flushed(&self) -> usize {
        self.flushed
    }

    /// Copies as much of `data` as fits behind the staged bytes and returns the part that did not
    /// fit. Once the buffer is full, everything is returned.
    pub fn fill<'d>(&mut self, data: &'d [u8]) -> &'d [u8] {
        let space = self.buffer.len() - self.count;
        let (head, rest) = data.split_at(space.min(data.len()));
        self.buffer[self.count..self.count + head.len()].copy_from_slice(head);
        self.count += head.len();
        rest
    }

    /// Fills the unused tail with `fill`, so the buffer is full.
    pub fn pad(&mut self, fill: u8) {
        for byte in &mut self.buffer[self.count..] {
            *byte = fill;
        }
        self.count = self.buffer.len();
    }

    /// Hands out the staged packet and empties the buffer. Returns `None` unless the buffer is full.
    pub fn take(&mut self) -> Option<&[u8]> {
        if !self.is_full() {
            return None;
        }
        self.count = 0;
        self.flushed += self.buffer.len();
        Some(&self.buffer[..])
    }
}
