//! Locating the target and moving it from application into bootloader mode.
//!
//! The application firmware and the bootloader enumerate with different product IDs, so a device
//! running its application has to be told to reset, disappears from the bus and comes back as a
//! different device. The handle used to send the reset request is closed at that point and a new
//! one is opened for the bootloader.

use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::transport::{DeviceDescriptor, Transport, UsbHandle, UsbId};
use crate::TIMEOUT;

/// Identity of a device running the bootloader.
pub const BOOTLOADER_ID: UsbId = UsbId::new(0x59e3, 0xbbbb);

/// Identity of a device running the application firmware.
pub const APPLICATION_ID: UsbId = UsbId::new(0x59e3, 0xcee1);

/// Vendor request making the application firmware jump into the bootloader.
pub const REQ_APP_RESET: u8 = 0xbb;

/// Vendor request, host to device, no data stage.
const APP_RESET_REQUEST_TYPE: u8 = 0x40;

/// Firmware a device is currently running.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    Bootloader,
    Application,
}

/// A device found during discovery together with the mode it was classified as.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DeviceIdentity {
    pub device: DeviceDescriptor,
    pub mode: Mode,
}

/// Restricts discovery to devices with the given vendor and/or product ID. An empty filter
/// accepts the known bootloader and application identities.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Filter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl Filter {
    pub fn new(vendor_id: Option<u16>, product_id: Option<u16>) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }

    /// Returns true if either ID is forced.
    pub fn is_override(&self) -> bool {
        self.vendor_id.is_some() || self.product_id.is_some()
    }

    pub fn matches(&self, id: UsbId) -> bool {
        self.vendor_id.map_or(true, |vid| vid == id.vendor_id)
            && self.product_id.map_or(true, |pid| pid == id.product_id)
    }
}

/// Discovery parameters.
#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    pub bootloader: UsbId,
    pub application: UsbId,

    /// Request code sent to the application to enter the bootloader.
    pub app_reset_request: u8,

    /// Delay before each look for the re-enumerated bootloader.
    pub poll_interval: Duration,

    /// How often to look for the bootloader after a reset before giving up.
    pub poll_attempts: usize,

    pub timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bootloader: BOOTLOADER_ID,
            application: APPLICATION_ID,
            app_reset_request: REQ_APP_RESET,
            poll_interval: Duration::from_millis(500),
            poll_attempts: 20,
            timeout: TIMEOUT,
        }
    }
}

/// Finds targets through a [`Transport`] and hands out handles to devices in bootloader mode.
///
/// [`Transport`]: trait.Transport.html
pub struct Discovery<'t, T: Transport> {
    transport: &'t T,
    config: DiscoveryConfig,
}

impl<'t, T: Transport> Discovery<'t, T> {
    pub fn new(transport: &'t T, config: DiscoveryConfig) -> Self {
        Self { transport, config }
    }

    /// Classifies a device by its identity.
    pub fn classify(&self, id: UsbId) -> Option<Mode> {
        if id == self.config.bootloader {
            Some(Mode::Bootloader)
        } else if id == self.config.application {
            Some(Mode::Application)
        } else {
            None
        }
    }

    /// Returns the first attached device accepted by `filter`. A device picked only because of a
    /// forced ID is assumed to run the bootloader.
    pub fn find(&self, filter: &Filter) -> Result<Option<DeviceIdentity>> {
        for device in self.transport.enumerate()? {
            let mode = if filter.is_override() {
                if !filter.matches(device.id) {
                    continue;
                }
                self.classify(device.id).unwrap_or(Mode::Bootloader)
            } else {
                match self.classify(device.id) {
                    Some(mode) => mode,
                    None => continue,
                }
            };
            log::debug!(
                "Found {} at {:03}/{:03} in {:?} mode",
                device.id,
                device.bus_number,
                device.address,
                mode
            );
            return Ok(Some(DeviceIdentity { device, mode }));
        }
        Ok(None)
    }

    /// Returns the first attached device with exactly the identity of `mode`.
    pub fn find_in_mode(&self, mode: Mode) -> Result<Option<DeviceDescriptor>> {
        let id = match mode {
            Mode::Bootloader => self.config.bootloader,
            Mode::Application => self.config.application,
        };
        Ok(self
            .transport
            .enumerate()?
            .into_iter()
            .find(|device| device.id == id))
    }

    /// Opens the device selected by `filter` in bootloader mode. A device running its application
    /// is reset first and reopened once it has re-enumerated as a bootloader.
    pub fn open_bootloader(&self, filter: &Filter) -> Result<T::Handle> {
        let found = self.find(filter)?.ok_or(Error::DeviceNotFound)?;
        log::info!("Using device {} ({:?} mode)", found.device.id, found.mode);
        let handle = self.transport.open(&found.device)?;

        match found.mode {
            Mode::Bootloader => Ok(handle),
            Mode::Application => {
                self.reset_application(handle)?;
                let device = self.wait_for_bootloader()?;
                log::info!("Bootloader appeared as {}", device.id);
                self.transport.open(&device)
            }
        }
    }

    /// Asks the application to enter the bootloader. The handle is closed either way.
    fn reset_application(&self, mut handle: T::Handle) -> Result<()> {
        log::info!("Resetting application into bootloader");
        let result = handle.control_transfer(
            APP_RESET_REQUEST_TYPE,
            self.config.app_reset_request,
            0,
            0,
            &mut [],
            self.config.timeout,
        );
        handle.close();
        result
            .map(|_| ())
            .map_err(|e| Error::ResetFailed(Box::new(e)))
    }

    fn wait_for_bootloader(&self) -> Result<DeviceDescriptor> {
        let attempts = self.config.poll_attempts;
        for attempt in 1..=attempts {
            thread::sleep(self.config.poll_interval);
            if let Some(device) = self.find_in_mode(Mode::Bootloader)? {
                return Ok(device);
            }
            log::debug!("Bootloader not present yet ({}/{})", attempt, attempts);
        }
        Err(Error::DeviceNotFoundAfterReset { attempts })
    }
}
