#![allow(dead_code)]

use std::cell::RefCell;
use std::io::Cursor;
use std::rc::Rc;
use std::time::Duration;

use xflash::{
    Bootloader, DeviceDescriptor, Error, HexImage, Request, Result, SessionConfig, Transport,
    UsbHandle, UsbId, APPLICATION_ID, DEVICE_INFO_LEN, REQ_APP_RESET,
};

/// Everything the mock saw, in order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    Open(UsbId),
    Configure { configuration: u8, interface: u8 },
    Control { request_type: u8, request: u8 },
    Bulk { endpoint: u8, data: Vec<u8> },
    Close(UsbId),
}

#[derive(Default)]
pub struct MockState {
    pub attached: Vec<DeviceDescriptor>,
    pub events: Vec<Event>,
    pub info: Vec<u8>,
    pub app_crc: u32,
    pub boot_crc: u32,

    /// Number of info requests that time out before one succeeds.
    pub info_failures: usize,

    /// Zero-based index of a bulk transfer that fails.
    pub bulk_failure_at: Option<usize>,

    /// Enumerations after an application reset until the bootloader shows up. `None` means never.
    pub reappear_after: Option<usize>,

    /// Device that shows up after an application reset.
    pub reappear_as: Option<DeviceDescriptor>,

    /// The application rejects the reset request.
    pub app_reset_failure: bool,

    pending: Option<usize>,
    bulk_count: usize,
}

impl MockState {
    pub fn requests(&self) -> Vec<u8> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::Control { request, .. } => Some(*request),
                _ => None,
            })
            .collect()
    }

    pub fn packets(&self) -> Vec<Vec<u8>> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::Bulk { data, .. } => Some(data.clone()),
                _ => None,
            })
            .collect()
    }
}

pub struct MockTransport {
    pub state: Rc<RefCell<MockState>>,
}

impl MockTransport {
    pub fn new(attached: Vec<DeviceDescriptor>) -> Self {
        let state = MockState {
            attached,
            info: info_packet(0x3fff),
            ..MockState::default()
        };
        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }
}

impl Transport for MockTransport {
    type Handle = MockHandle;

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        let mut state = self.state.borrow_mut();
        if let Some(remaining) = state.pending {
            if remaining <= 1 {
                state.pending = None;
                let reappear = state.reappear_as;
                if let Some(device) = reappear {
                    state.attached.push(device);
                }
            } else {
                state.pending = Some(remaining - 1);
            }
        }
        Ok(state.attached.clone())
    }

    fn open(&self, device: &DeviceDescriptor) -> Result<MockHandle> {
        let mut state = self.state.borrow_mut();
        if !state.attached.contains(device) {
            return Err(Error::DeviceNotFound);
        }
        state.events.push(Event::Open(device.id));
        Ok(MockHandle {
            id: device.id,
            state: Rc::clone(&self.state),
        })
    }
}

pub struct MockHandle {
    id: UsbId,
    state: Rc<RefCell<MockState>>,
}

impl UsbHandle for MockHandle {
    fn configure(&mut self, configuration: u8, interface: u8) -> Result<()> {
        self.state.borrow_mut().events.push(Event::Configure {
            configuration,
            interface,
        });
        Ok(())
    }

    fn control_transfer(
        &mut self,
        request_type: u8,
        request: u8,
        _value: u16,
        _index: u16,
        buffer: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize> {
        let mut state = self.state.borrow_mut();
        state.events.push(Event::Control {
            request_type,
            request,
        });

        let response = match request {
            r if r == Request::Info as u8 => {
                if state.info_failures > 0 {
                    state.info_failures -= 1;
                    return Err(Error::Usb(rusb::Error::Timeout));
                }
                state.info.clone()
            }
            r if r == Request::AppCrc as u8 => state.app_crc.to_le_bytes().to_vec(),
            r if r == Request::BootCrc as u8 => state.boot_crc.to_le_bytes().to_vec(),
            r if r == REQ_APP_RESET && self.id == APPLICATION_ID => {
                if state.app_reset_failure {
                    return Err(Error::Usb(rusb::Error::Pipe));
                }
                let id = self.id;
                state.attached.retain(|device| device.id != id);
                state.pending = state.reappear_after;
                Vec::new()
            }
            _ => Vec::new(),
        };

        let length = response.len().min(buffer.len());
        buffer[..length].copy_from_slice(&response[..length]);
        Ok(length)
    }

    fn bulk_transfer(&mut self, endpoint: u8, buffer: &[u8], _timeout: Duration) -> Result<usize> {
        let mut state = self.state.borrow_mut();
        let index = state.bulk_count;
        state.bulk_count += 1;
        if state.bulk_failure_at == Some(index) {
            return Err(Error::Usb(rusb::Error::Pipe));
        }
        state.events.push(Event::Bulk {
            endpoint,
            data: buffer.to_vec(),
        });
        Ok(buffer.len())
    }

    fn close(self) {
        self.state.borrow_mut().events.push(Event::Close(self.id));
    }
}

pub fn descriptor(id: UsbId, address: u8) -> DeviceDescriptor {
    DeviceDescriptor {
        id,
        bus_number: 1,
        address,
    }
}

/// Info block of an ATxmega128A4U-like device whose memory ends at `mem_size`.
pub fn info_packet(mem_size: u32) -> Vec<u8> {
    let mut packet = vec![0u8; DEVICE_INFO_LEN];
    packet[0..4].copy_from_slice(&[0x80, 0x37, 0x00, 0x01]);
    packet[4] = 1;
    packet[5..9].copy_from_slice(&[0x1e, 0x97, 0x46, 0x00]);
    packet[9..11].copy_from_slice(&256u16.to_le_bytes());
    packet[11..15].copy_from_slice(&mem_size.to_le_bytes());
    packet[19..22].copy_from_slice(b"CEE");
    packet
}

/// A data record with a correct checksum.
pub fn data_record(address: u16, data: &[u8]) -> String {
    let mut bytes = vec![data.len() as u8];
    bytes.extend_from_slice(&address.to_be_bytes());
    bytes.push(0x00);
    bytes.extend_from_slice(data);
    let sum = bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b));
    bytes.push(sum.wrapping_neg());

    let mut line = String::from(":");
    for byte in bytes {
        line.push_str(&format!("{:02X}", byte));
    }
    line.push_str("\r\n");
    line
}

/// Image text holding the given payloads as consecutive data records.
pub fn hex_text(records: &[&[u8]]) -> String {
    let mut text = String::new();
    let mut address = 0u16;
    for data in records {
        text.push_str(&data_record(address, data));
        address += data.len() as u16;
    }
    text.push_str(":00000001FF\r\n");
    text
}

pub fn image(text: &str) -> HexImage<Cursor<Vec<u8>>> {
    HexImage::from_reader(Cursor::new(text.as_bytes().to_vec()))
}

pub fn session_config(packet_size: usize) -> SessionConfig {
    SessionConfig {
        packet_size,
        info_retry_delay: Duration::ZERO,
        ..SessionConfig::default()
    }
}

/// A configured session with device info read, over a transport exposing one bootloader.
pub fn open_session(transport: &MockTransport, packet_size: usize) -> Bootloader<MockHandle> {
    let device = transport.state.borrow().attached[0];
    let handle = transport.open(&device).unwrap();
    Bootloader::open(handle, session_config(packet_size)).unwrap()
}
