//! Interfaces to the raw USB layer.
//!
//! Sessions and discovery only ever talk to the device through these traits. [`Context`] provides
//! the implementation on top of libusb; tests substitute a scripted one.
//!
//! [`Context`]: ../struct.Context.html

use std::fmt;
use std::time::Duration;

use crate::error::Result;

/// Direction bit of `bmRequestType`, set for device-to-host requests.
pub const DIRECTION_IN: u8 = 0x80;

/// Vendor/product ID pair a device enumerates with.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct UsbId {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl UsbId {
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// An attached device as seen during enumeration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DeviceDescriptor {
    pub id: UsbId,

    /// USB bus ID the device is connected to.
    pub bus_number: u8,

    /// USB device address of the device.
    pub address: u8,
}

/// Enumerates devices and opens them.
pub trait Transport {
    type Handle: UsbHandle;

    /// Lists all currently attached devices.
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>>;

    /// Opens a device found by [`enumerate`].
    ///
    /// [`enumerate`]: #tymethod.enumerate
    fn open(&self, device: &DeviceDescriptor) -> Result<Self::Handle>;
}

/// An open device. Closing consumes the handle, so it cannot be used afterwards.
pub trait UsbHandle {
    /// Selects the configuration and claims the interface used for all further transfers.
    fn configure(&mut self, configuration: u8, interface: u8) -> Result<()>;

    /// Issues a control transfer. The direction bit of `request_type` decides whether `buffer` is
    /// read into or sent. Returns the number of bytes transferred.
    #[allow(clippy::too_many_arguments)]
    fn control_transfer(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize>;

    /// Writes `buffer` to a bulk OUT endpoint. Returns the number of bytes written.
    fn bulk_transfer(&mut self, endpoint: u8, buffer: &[u8], timeout: Duration) -> Result<usize>;

    /// Releases the device.
    fn close(self);
}
