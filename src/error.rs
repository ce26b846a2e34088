use std::result::Result as StdResult;

use thiserror::Error as ThisError;

/// Errors which can occur while decoding an image or talking to a target.
#[derive(Debug, ThisError)]
pub enum Error {
    /// A request was rejected by the session before reaching the device, e.g. because it was
    /// issued out of order.
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),

    /// No attached device matched the requested identity.
    #[error("no matching device found")]
    DeviceNotFound,

    /// The device was reset out of application mode but never reappeared as a bootloader.
    #[error("device did not reappear in bootloader mode after {attempts} attempts")]
    DeviceNotFoundAfterReset { attempts: usize },

    /// The device was found but could not be opened or configured.
    #[error("failed to open device: {0}")]
    OpenFailed(#[source] rusb::Error),

    /// The application firmware did not accept the reset-to-bootloader request.
    #[error("failed to reset application into bootloader: {0}")]
    ResetFailed(#[source] Box<Error>),

    /// A bulk or control transfer moved fewer bytes than requested.
    #[error("incomplete transfer: expected {expected} bytes, got {actual}")]
    IncompleteTransfer { expected: usize, actual: usize },

    /// An error occurred during the raw USB communication.
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// The device answered with something that cannot be interpreted.
    #[error("malformed response from device")]
    MalformedResponse,

    /// The image reaches beyond the last address of the device's memory.
    #[error("image extends to 0x{max_address:x}, but device memory ends at 0x{mem_size:x}")]
    CapacityExceeded { max_address: u32, mem_size: u32 },

    /// A character outside `0-9A-F` appeared inside a record.
    #[error("invalid character 0x{byte:02x} at offset {offset} of the image")]
    InvalidCharacter { byte: u8, offset: u64 },

    /// A record type not defined by the hex format.
    #[error("unrecognized record type 0x{0:02x}")]
    UnknownRecordType(u8),

    /// The record's contents are inconsistent with its type.
    #[error("malformed record: {0}")]
    MalformedRecord(&'static str),

    /// The record checksum does not make the record's byte sum zero.
    #[error("record checksum mismatch: stored 0x{stored:02x}, computed 0x{computed:02x}")]
    ChecksumMismatch { stored: u8, computed: u8 },

    /// The input ended before an end-of-file record was seen.
    #[error("image ended without an end-of-file record")]
    UnexpectedEnd,

    /// Reading the image failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Verifying memory contents via CRC failed.
    #[error("CRC mismatch: image 0x{expected:06x}, device 0x{actual:06x}")]
    CrcMismatch { expected: u32, actual: u32 },
}

/// Coarse classification of [`Error`] values.
///
/// [`Error`]: enum.Error.html
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    /// Device lookup, opening and raw transfers.
    Transport,

    /// Unexpected device behaviour or a request the device cannot satisfy.
    Protocol,

    /// Problems with the hex image itself.
    Format,

    /// The flashed contents do not match the image.
    Verification,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DeviceNotFound
            | Error::DeviceNotFoundAfterReset { .. }
            | Error::OpenFailed(_)
            | Error::ResetFailed(_)
            | Error::IncompleteTransfer { .. }
            | Error::Usb(_) => ErrorKind::Transport,
            Error::InvalidRequest(_) | Error::MalformedResponse | Error::CapacityExceeded { .. } => {
                ErrorKind::Protocol
            }
            Error::InvalidCharacter { .. }
            | Error::UnknownRecordType(_)
            | Error::MalformedRecord(_)
            | Error::ChecksumMismatch { .. }
            | Error::UnexpectedEnd
            | Error::Io(_) => ErrorKind::Format,
            Error::CrcMismatch { .. } => ErrorKind::Verification,
        }
    }

    /// Process exit code used by the command line tool for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::DeviceNotFound | Error::DeviceNotFoundAfterReset { .. } => 1,
            Error::OpenFailed(_) | Error::ResetFailed(_) => 2,
            Error::CapacityExceeded { .. } => 4,
            Error::CrcMismatch { .. } => 5,
            _ => 3,
        }
    }
}

/// Shorthand for a Result with the crate's own Error type.
pub type Result<T> = StdResult<T, Error>;
