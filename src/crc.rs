//! The 24-bit checksum the bootloader computes over its application flash.
//!
//! The device feeds 16-bit flash words into a shift register and reports the result when asked for
//! the application CRC. This is not a standard CRC (the data word is XORed into the low end of the
//! register), so none of the generic CRC engines can reproduce it.

/// Feedback polynomial applied when bit 23 shifts out.
pub const CRC_POLY: u32 = 0x0080_001B;

/// The register only ever holds 24 significant bits.
pub const CRC_MASK: u32 = 0x00FF_FFFF;

const TOP_BIT: u32 = 1 << 23;

/// Accumulator replicating the bootloader's flash CRC word by word.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Crc24 {
    register: u32,
    words: u64,

    /// Low byte of a word whose high byte has not been fed yet.
    pending: Option<u8>,
}

impl Crc24 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one 16-bit word into the register.
    pub fn update_word(&mut self, word: u16) {
        let feedback = if self.register & TOP_BIT != 0 {
            CRC_MASK
        } else {
            0
        };
        let shifted = (self.register << 1) & 0x00FF_FFFE;
        self.register = ((shifted ^ u32::from(word)) ^ (feedback & CRC_POLY)) & CRC_MASK;
        self.words += 1;
    }

    /// Feeds a byte stream, low byte of each word first. A trailing odd byte is held back and
    /// paired with the first byte of the next call, so splitting a stream across several calls
    /// gives the same register as feeding it at once.
    pub fn update(&mut self, data: &[u8]) {
        let mut data = data;
        if let Some(low) = self.pending.take() {
            match data.split_first() {
                Some((&high, rest)) => {
                    self.update_word(u16::from_le_bytes([low, high]));
                    data = rest;
                }
                None => {
                    self.pending = Some(low);
                    return;
                }
            }
        }

        let mut words = data.chunks_exact(2);
        for word in &mut words {
            self.update_word(u16::from_le_bytes([word[0], word[1]]));
        }
        if let [low] = words.remainder() {
            self.pending = Some(*low);
        }
    }

    /// Feeds the payload of one hex record. Every record contributes whole words; a record with
    /// an odd number of bytes has its last word completed with `0xFF`.
    pub fn update_record(&mut self, data: &[u8]) {
        self.update(data);
        self.complete_word(0xff);
    }

    /// Completes a held-back odd byte with the given high byte.
    fn complete_word(&mut self, high: u8) {
        if let Some(low) = self.pending.take() {
            self.update_word(u16::from_le_bytes([low, high]));
        }
    }

    /// Keeps feeding `(pad, pad)` words until `total_words` words have been consumed, the way the
    /// bootloader walks over erased flash past the end of the image.
    pub fn pad_to(&mut self, total_words: u64, pad: u8) {
        self.complete_word(pad);
        let word = u16::from_le_bytes([pad, pad]);
        while self.words < total_words {
            self.update_word(word);
        }
    }

    /// Current register value. A held-back odd byte is not included.
    pub fn value(&self) -> u32 {
        self.register
    }

    /// Number of words consumed so far.
    pub fn words(&self) -> u64 {
        self.words
    }
}

/// Number of flash words the bootloader covers, given the memory size as reported in
/// `DeviceInfo` (the last valid address, i.e. size - 1).
pub fn device_words(mem_size: u32) -> u64 {
    (u64::from(mem_size) + 2) / 2
}
