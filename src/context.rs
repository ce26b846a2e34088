use std::time::Duration;

use rusb::{Device, DeviceHandle, UsbContext};

use crate::error::{Error, Result};
use crate::transport::{DeviceDescriptor, Transport, UsbHandle, UsbId, DIRECTION_IN};

/// libusb-backed [`Transport`].
///
/// [`Transport`]: trait.Transport.html
pub struct Context<T: UsbContext = rusb::Context> {
    pub usb_context: T,
}

impl Context {
    pub fn new() -> Result<Self> {
        let usb_context = rusb::Context::new()?;
        Ok(Context { usb_context })
    }
}

impl<T: UsbContext> Context<T> {
    pub fn with_usb_context(usb_context: T) -> Self {
        Context { usb_context }
    }

    fn find_device(&self, target: &DeviceDescriptor) -> Result<Device<T>> {
        for device in self.usb_context.devices()?.iter() {
            if device.bus_number() != target.bus_number || device.address() != target.address {
                continue;
            }
            // Bus number and address may have been reused by a different device since
            // enumeration, so the identity is checked again before opening.
            let descriptor = device.device_descriptor()?;
            if UsbId::new(descriptor.vendor_id(), descriptor.product_id()) == target.id {
                return Ok(device);
            }
            return Err(Error::DeviceNotFound);
        }
        Err(Error::DeviceNotFound)
    }
}

impl<T: UsbContext> Transport for Context<T> {
    type Handle = Handle<T>;

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        let mut devices = Vec::new();

        for device in self.usb_context.devices()?.iter() {
            match device.device_descriptor() {
                Ok(descriptor) => devices.push(DeviceDescriptor {
                    id: UsbId::new(descriptor.vendor_id(), descriptor.product_id()),
                    bus_number: device.bus_number(),
                    address: device.address(),
                }),
                Err(e) => log::debug!(
                    "Failed to get device descriptor for {:03}/{:03}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                ),
            }
        }

        Ok(devices)
    }

    fn open(&self, device: &DeviceDescriptor) -> Result<Handle<T>> {
        let usb_device_handle = self
            .find_device(device)?
            .open()
            .map_err(Error::OpenFailed)?;
        Ok(Handle {
            usb_device_handle,
            interface: None,
        })
    }
}

/// An open libusb device.
pub struct Handle<T: UsbContext> {
    usb_device_handle: DeviceHandle<T>,

    /// Interface claimed by `configure`.
    interface: Option<u8>,
}

impl<T: UsbContext> UsbHandle for Handle<T> {
    fn configure(&mut self, configuration: u8, interface: u8) -> Result<()> {
        self.usb_device_handle
            .set_active_configuration(configuration)
            .map_err(Error::OpenFailed)?;
        self.usb_device_handle
            .claim_interface(interface)
            .map_err(Error::OpenFailed)?;
        self.interface = Some(interface);
        Ok(())
    }

    fn control_transfer(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let transferred = if request_type & DIRECTION_IN != 0 {
            self.usb_device_handle
                .read_control(request_type, request, value, index, buffer, timeout)?
        } else {
            self.usb_device_handle
                .write_control(request_type, request, value, index, buffer, timeout)?
        };
        Ok(transferred)
    }

    fn bulk_transfer(&mut self, endpoint: u8, buffer: &[u8], timeout: Duration) -> Result<usize> {
        Ok(self.usb_device_handle.write_bulk(endpoint, buffer, timeout)?)
    }

    fn close(mut self) {
        if let Some(interface) = self.interface.take() {
            if let Err(e) = self.usb_device_handle.release_interface(interface) {
                log::debug!("Failed to release interface {}: {}", interface, e);
            }
        }
    }
}
