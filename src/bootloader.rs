use std::io::{Read, Seek};
use std::thread;
use std::time::Duration;

use crate::device_info::{DeviceInfo, DEVICE_INFO_LEN};
use crate::error::{Error, Result};
use crate::flash::PACKET_SIZE;
use crate::ihex::HexImage;
use crate::operation::Program;
use crate::transport::{UsbHandle, DIRECTION_IN};
use crate::TIMEOUT;

/// Vendor request, device to host. The firmware expects this for every request, including the
/// ones without payload.
const REQUEST_TYPE: u8 = DIRECTION_IN | 0x40;

/// Vendor requests understood by the bootloader.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Request {
    /// Returns the 64-byte [`DeviceInfo`] block.
    ///
    /// [`DeviceInfo`]: struct.DeviceInfo.html
    Info = 0xb0,
    Erase = 0xb1,
    StartWrite = 0xb2,

    /// Returns the 4-byte little-endian CRC of the application flash.
    AppCrc = 0xb3,

    /// Returns the 4-byte little-endian CRC of the bootloader itself.
    BootCrc = 0xb4,
    Reset = 0xbf,
}

/// Stages of a flashing session. Sessions only ever move forward through these.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum SessionState {
    Uninitialized,
    Configured,
    InfoRead,
    Erased,
    Writing,
    Written,
    Verified,
    Mismatched,
    Reset,
    Closed,
}

/// Session parameters. The defaults match the released bootloader firmware.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// USB configuration to activate.
    pub configuration: u8,

    /// Interface to claim.
    pub interface: u8,

    /// Bulk OUT endpoint receiving flash packets.
    pub endpoint: u8,

    /// Size of each bulk packet. Must match what the firmware expects.
    pub packet_size: usize,

    /// Timeout for every control and bulk transfer.
    pub timeout: Duration,

    /// How often the info request is tried before giving up.
    pub info_attempts: usize,

    /// Delay between info request attempts.
    pub info_retry_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            configuration: 1,
            interface: 0,
            endpoint: 0x01,
            packet_size: PACKET_SIZE,
            timeout: TIMEOUT,
            info_attempts: 5,
            info_retry_delay: Duration::from_millis(100),
        }
    }
}

/// A flashing session with a device in bootloader mode.
///
/// The session owns the device handle until it is closed. Operations must be issued in the order
/// the firmware processes them: [`configure`], [`read_info`], [`write_image`] (which erases and
/// starts the write), [`verify`]. Calls out of order fail with [`Error::InvalidRequest`] without
/// touching the device.
///
/// [`configure`]: #method.configure
/// [`read_info`]: #method.read_info
/// [`write_image`]: #method.write_image
/// [`verify`]: #method.verify
/// [`Error::InvalidRequest`]: enum.Error.html#variant.InvalidRequest
pub struct Bootloader<H: UsbHandle> {
    handle: H,
    config: SessionConfig,
    state: SessionState,
    info: Option<DeviceInfo>,
}

impl<H: UsbHandle> Bootloader<H> {
    pub fn new(handle: H, config: SessionConfig) -> Self {
        Self {
            handle,
            config,
            state: SessionState::Uninitialized,
            info: None,
        }
    }

    /// Creates a session, claims the interface and reads the device information.
    pub fn open(handle: H, config: SessionConfig) -> Result<Self> {
        let mut bootloader = Self::new(handle, config);
        bootloader.configure()?;
        bootloader.read_info()?;
        Ok(bootloader)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Device information, available once [`read_info`] succeeded.
    ///
    /// [`read_info`]: #method.read_info
    pub fn info(&self) -> Result<&DeviceInfo> {
        self.info
            .as_ref()
            .ok_or(Error::InvalidRequest("device info has not been read"))
    }

    fn expect_state(&self, expected: SessionState, operation: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            log::debug!(
                "Rejecting {} in state {:?}, expected {:?}",
                operation,
                self.state,
                expected
            );
            Err(Error::InvalidRequest(operation))
        }
    }

    /// Activates the configuration and claims the interface.
    pub fn configure(&mut self) -> Result<()> {
        self.expect_state(SessionState::Uninitialized, "configure")?;
        self.handle
            .configure(self.config.configuration, self.config.interface)?;
        self.state = SessionState::Configured;
        Ok(())
    }

    /// Queries the device information. This is the only request that is retried.
    pub fn read_info(&mut self) -> Result<&DeviceInfo> {
        self.expect_state(SessionState::Configured, "read info")?;

        let attempts = self.config.info_attempts.max(1);
        let mut attempt = 1;
        let info = loop {
            match self.try_read_info() {
                Ok(info) => break info,
                Err(e) if attempt < attempts => {
                    log::warn!("Reading device info failed ({}), retrying", e);
                    attempt += 1;
                    thread::sleep(self.config.info_retry_delay);
                }
                Err(e) => return Err(e),
            }
        };

        log::info!("Part: {}", info.part_name());
        log::debug!("Device info:\n{}", info);
        self.state = SessionState::InfoRead;
        Ok(&*self.info.insert(info))
    }

    fn try_read_info(&mut self) -> Result<DeviceInfo> {
        let mut info_packet = [0u8; DEVICE_INFO_LEN];
        let length = self.send_command(Request::Info, &mut info_packet)?;
        if length < DEVICE_INFO_LEN {
            return Err(Error::IncompleteTransfer {
                expected: DEVICE_INFO_LEN,
                actual: length,
            });
        }
        DeviceInfo::parse(&info_packet)
    }

    /// Fails if the image reaches beyond the device's memory.
    pub fn check_capacity<R: Read + Seek>(&self, image: &HexImage<R>) -> Result<()> {
        let mem_size = self.info()?.mem_size;
        if !image.is_scanned() {
            return Err(Error::InvalidRequest("image has not been scanned"));
        }
        if image.max_address() > mem_size {
            return Err(Error::CapacityExceeded {
                max_address: image.max_address(),
                mem_size,
            });
        }
        Ok(())
    }

    /// Erases the application flash.
    pub fn erase(&mut self) -> Result<()> {
        self.expect_state(SessionState::InfoRead, "erase")?;
        log::info!("Erasing");
        self.send_command(Request::Erase, &mut [])?;
        self.state = SessionState::Erased;
        Ok(())
    }

    /// Tells the device that flash packets follow.
    pub fn start_write(&mut self) -> Result<()> {
        self.expect_state(SessionState::Erased, "start write")?;
        self.send_command(Request::StartWrite, &mut [])?;
        self.state = SessionState::Writing;
        Ok(())
    }

    /// Checks that the image fits, erases the device and starts writing. The returned operation
    /// sends the image packet by packet; see [`Operation`].
    ///
    /// [`Operation`]: trait.Operation.html
    pub fn write_image<'i, R: Read + Seek>(
        &mut self,
        image: &'i mut HexImage<R>,
    ) -> Result<Program<'_, 'i, H, R>> {
        self.expect_state(SessionState::InfoRead, "write image")?;
        image.scan()?;
        self.check_capacity(image)?;

        self.erase()?;
        self.start_write()?;

        let total = image.total_size();
        let packet_size = self.config.packet_size;
        log::info!("Writing {} bytes in {} byte packets", total, packet_size);
        image.rewind()?;
        Ok(Program::new(self, image.records(), packet_size, total))
    }

    /// Sends one bulk packet.
    pub(crate) fn write_packet(&mut self, packet: &[u8]) -> Result<()> {
        let written = self
            .handle
            .bulk_transfer(self.config.endpoint, packet, self.config.timeout)?;
        log::trace!("Wrote packet of {} bytes", written);
        if written != packet.len() {
            return Err(Error::IncompleteTransfer {
                expected: packet.len(),
                actual: written,
            });
        }
        Ok(())
    }

    /// Marks the bulk phase as complete. Called once the last packet went out.
    pub(crate) fn finish_write(&mut self) {
        self.state = SessionState::Written;
    }

    fn read_crc(&mut self, request: Request) -> Result<u32> {
        let mut crc_packet = [0u8; 4];
        let length = self.send_command(request, &mut crc_packet)?;
        if length != crc_packet.len() {
            return Err(Error::IncompleteTransfer {
                expected: crc_packet.len(),
                actual: length,
            });
        }
        Ok(u32::from_le_bytes(crc_packet))
    }

    /// Queries the CRC the device computes over its application flash.
    pub fn read_app_crc(&mut self) -> Result<u32> {
        self.read_crc(Request::AppCrc)
    }

    /// Queries the CRC of the bootloader firmware itself. Diagnostic only.
    pub fn read_boot_crc(&mut self) -> Result<u32> {
        self.read_crc(Request::BootCrc)
    }

    /// Compares the device's application CRC against the image's. On a match the device is reset
    /// into the new application. On a mismatch the device is left in the bootloader so it can be
    /// inspected.
    pub fn verify<R: Read + Seek>(&mut self, image: &HexImage<R>) -> Result<()> {
        self.expect_state(SessionState::Written, "verify")?;
        let expected = image
            .crc()
            .ok_or(Error::InvalidRequest("image CRC has not been computed"))?;

        let actual = self.read_app_crc()?;
        log::info!("Image CRC: 0x{:06x}, device CRC: 0x{:06x}", expected, actual);
        if actual != expected {
            self.state = SessionState::Mismatched;
            return Err(Error::CrcMismatch { expected, actual });
        }

        self.state = SessionState::Verified;
        if let Err(e) = self.reset() {
            log::warn!("Could not reset target: {}", e);
        }
        Ok(())
    }

    /// Signals the device to leave the bootloader and start the application.
    pub fn reset(&mut self) -> Result<()> {
        self.expect_state(SessionState::Verified, "reset")?;
        self.state = SessionState::Reset;
        self.send_command(Request::Reset, &mut []).map(|_| ())
    }

    /// Releases the interface and the device handle.
    pub fn close(mut self) {
        log::debug!("Closing session in state {:?}", self.state);
        self.state = SessionState::Closed;
        self.handle.close();
    }

    /// Sends a control request, reading the response into `buffer`. Returns the response length.
    fn send_command(&mut self, request: Request, buffer: &mut [u8]) -> Result<usize> {
        log::trace!("Request {:?}", request);
        self.handle.control_transfer(
            REQUEST_TYPE,
            request as u8,
            0,
            0,
            buffer,
            self.config.timeout,
        )
    }
}
