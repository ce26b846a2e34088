mod common;

use common::{descriptor, hex_text, image, info_packet, open_session, Event, MockTransport};
use xflash::{
    Bootloader, Error, Operation, Request, SessionState, UsbHandle, BOOTLOADER_ID, FILL_BYTE,
};

fn transport() -> MockTransport {
    MockTransport::new(vec![descriptor(BOOTLOADER_ID, 4)])
}

fn request_codes(requests: &[Request]) -> Vec<u8> {
    requests.iter().map(|r| *r as u8).collect()
}

/// Payload of `len` bytes counting up from `start`.
fn payload(start: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| start.wrapping_add(i as u8)).collect()
}

#[test]
fn test_single_short_record() {
    let transport = transport();
    let mut bootloader = open_session(&transport, 256);
    let mut image = image(&hex_text(&[&[1, 2, 3, 4, 5, 6, 7, 8]]));

    assert_eq!(image.compute_crc(0x3fff, 0xff).unwrap(), 0x41_1a0a);
    transport.state.borrow_mut().app_crc = 0x41_1a0a;

    bootloader.write_image(&mut image).unwrap().execute().unwrap();
    assert_eq!(bootloader.state(), SessionState::Written);

    let packets = transport.state.borrow().packets();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].len(), 256);
    assert_eq!(packets[0][..8], [1, 2, 3, 4, 5, 6, 7, 8]);
    assert!(packets[0][8..].iter().all(|&b| b == FILL_BYTE));

    bootloader.verify(&image).unwrap();
    assert_eq!(bootloader.state(), SessionState::Reset);
    assert_eq!(
        transport.state.borrow().requests(),
        request_codes(&[
            Request::Info,
            Request::Erase,
            Request::StartWrite,
            Request::AppCrc,
            Request::Reset
        ])
    );
}

#[test]
fn test_session_setup() {
    let transport = transport();
    let bootloader = open_session(&transport, 64);

    assert_eq!(bootloader.state(), SessionState::InfoRead);
    let info = bootloader.info().unwrap();
    assert_eq!(info.mem_size, 0x3fff);
    assert_eq!(info.part_name(), "ATxmega128A4U");
    assert_eq!(info.product, "CEE");

    let events = transport.state.borrow().events.clone();
    assert_eq!(events[0], Event::Open(BOOTLOADER_ID));
    assert_eq!(
        events[1],
        Event::Configure {
            configuration: 1,
            interface: 0
        }
    );
    assert_eq!(
        events[2],
        Event::Control {
            request_type: 0xc0,
            request: 0xb0
        }
    );

    bootloader.close();
    assert_eq!(
        transport.state.borrow().events.last(),
        Some(&Event::Close(BOOTLOADER_ID))
    );
}

#[test]
fn test_packets_carry_over_between_records() {
    let records: Vec<Vec<u8>> = vec![
        payload(0x00, 16),
        payload(0x10, 16),
        payload(0x20, 16),
        payload(0x30, 10),
        payload(0x40, 16),
        payload(0x50, 16),
        payload(0x60, 16),
        payload(0x70, 16),
        payload(0x80, 16),
        payload(0x90, 12),
    ];
    let slices: Vec<&[u8]> = records.iter().map(|r| r.as_slice()).collect();
    let data: Vec<u8> = records.concat();
    assert_eq!(data.len(), 150);

    let transport = transport();
    let mut bootloader = open_session(&transport, 64);
    let mut image = image(&hex_text(&slices));
    image.compute_crc(0x3fff, 0xff).unwrap();
    bootloader.write_image(&mut image).unwrap().execute().unwrap();

    let packets = transport.state.borrow().packets();
    // Two full packets, then the padded remainder
    assert_eq!(packets.len(), 150 / 64 + 1);
    assert!(packets.iter().all(|p| p.len() == 64));

    let sent: Vec<u8> = packets.concat();
    assert_eq!(sent[..150], data[..]);
    assert!(sent[150..].iter().all(|&b| b == FILL_BYTE));
}

#[test]
fn test_aligned_image_sends_fill_packet() {
    let records: Vec<Vec<u8>> = (0..8).map(|i| payload(i * 16, 16)).collect();
    let slices: Vec<&[u8]> = records.iter().map(|r| r.as_slice()).collect();

    let transport = transport();
    let mut bootloader = open_session(&transport, 64);
    let mut image = image(&hex_text(&slices));
    image.compute_crc(0x3fff, 0xff).unwrap();
    bootloader.write_image(&mut image).unwrap().execute().unwrap();

    let packets = transport.state.borrow().packets();
    assert_eq!(packets.len(), 3);
    assert_eq!(packets[0], payload(0, 64));
    assert_eq!(packets[1], payload(64, 64));
    assert_eq!(packets[2], vec![FILL_BYTE; 64]);
}

#[test]
fn test_record_spanning_several_packets() {
    let records = vec![payload(0, 40), payload(40, 40)];
    let slices: Vec<&[u8]> = records.iter().map(|r| r.as_slice()).collect();

    let transport = transport();
    let mut bootloader = open_session(&transport, 16);
    let mut image = image(&hex_text(&slices));
    image.compute_crc(0x3fff, 0xff).unwrap();
    bootloader.write_image(&mut image).unwrap().execute().unwrap();

    let packets = transport.state.borrow().packets();
    assert_eq!(packets.len(), 80 / 16 + 1);
    assert_eq!(packets.concat()[..80], payload(0, 80)[..]);
}

#[test]
fn test_progress() {
    let records: Vec<Vec<u8>> = (0..10).map(|i| payload(i * 16, 16)).collect();
    let slices: Vec<&[u8]> = records.iter().map(|r| r.as_slice()).collect();

    let transport = transport();
    let mut bootloader = open_session(&transport, 64);
    let mut image = image(&hex_text(&slices));
    image.compute_crc(0x3fff, 0xff).unwrap();

    let mut program = bootloader.write_image(&mut image).unwrap();
    assert_eq!(program.total(), 160);
    let progress: Vec<usize> = (&mut program).map(|p| p.unwrap()).collect();
    assert_eq!(progress, vec![64, 128, 160]);
    assert_eq!(program.flushed(), 192);
    assert!(program.next().is_none());
}

#[test]
fn test_capacity_exceeded_before_erase() {
    let transport = transport();
    transport.state.borrow_mut().info = info_packet(0x0f);
    let mut bootloader = open_session(&transport, 64);

    let data = payload(0, 32);
    let mut image = image(&hex_text(&[&data]));
    image.compute_crc(0x0f, 0xff).unwrap();

    match bootloader.write_image(&mut image) {
        Err(Error::CapacityExceeded {
            max_address,
            mem_size,
        }) => {
            assert_eq!(max_address, 31);
            assert_eq!(mem_size, 0x0f);
        }
        Err(e) => panic!("unexpected error {:?}", e),
        Ok(_) => panic!("image should not fit"),
    }

    assert_eq!(bootloader.state(), SessionState::InfoRead);
    let state = transport.state.borrow();
    assert_eq!(state.requests(), request_codes(&[Request::Info]));
    assert!(state.packets().is_empty());
}

#[test]
fn test_image_filling_memory_exactly_fits() {
    let transport = transport();
    transport.state.borrow_mut().info = info_packet(0x1f);
    let mut bootloader = open_session(&transport, 64);

    let data = payload(0, 32);
    let mut image = image(&hex_text(&[&data]));
    image.compute_crc(0x1f, 0xff).unwrap();
    assert!(bootloader.write_image(&mut image).is_ok());
}

#[test]
fn test_crc_mismatch_skips_reset() {
    let transport = transport();
    let mut bootloader = open_session(&transport, 64);
    let mut image = image(&hex_text(&[&payload(0, 16)]));
    let crc = image.compute_crc(0x3fff, 0xff).unwrap();
    transport.state.borrow_mut().app_crc = crc ^ 1;

    bootloader.write_image(&mut image).unwrap().execute().unwrap();
    match bootloader.verify(&image) {
        Err(Error::CrcMismatch { expected, actual }) => {
            assert_eq!(expected, crc);
            assert_eq!(actual, crc ^ 1);
        }
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(bootloader.state(), SessionState::Mismatched);

    let requests = transport.state.borrow().requests();
    assert_eq!(requests.last(), Some(&(Request::AppCrc as u8)));
    assert!(!requests.contains(&(Request::Reset as u8)));

    // The session cannot be pushed on to a reset anymore
    assert!(matches!(bootloader.reset(), Err(Error::InvalidRequest(_))));
}

#[test]
fn test_info_is_retried() {
    let transport = transport();
    transport.state.borrow_mut().info_failures = 2;
    let bootloader = open_session(&transport, 64);
    assert_eq!(bootloader.state(), SessionState::InfoRead);
    assert_eq!(
        transport.state.borrow().requests(),
        request_codes(&[Request::Info, Request::Info, Request::Info])
    );
}

#[test]
fn test_info_retries_are_bounded() {
    let transport = transport();
    transport.state.borrow_mut().info_failures = 10;
    let device = transport.state.borrow().attached[0];
    let handle = xflash::Transport::open(&transport, &device).unwrap();

    let result = Bootloader::open(handle, common::session_config(64));
    assert!(matches!(result, Err(Error::Usb(rusb::Error::Timeout))));
    assert_eq!(transport.state.borrow().requests().len(), 5);
}

#[test]
fn test_requests_out_of_order_are_rejected() {
    let transport = transport();
    let device = transport.state.borrow().attached[0];
    let handle = xflash::Transport::open(&transport, &device).unwrap();
    let mut bootloader = Bootloader::new(handle, common::session_config(64));

    assert!(matches!(bootloader.erase(), Err(Error::InvalidRequest(_))));
    assert!(matches!(bootloader.read_info(), Err(Error::InvalidRequest(_))));
    assert!(matches!(bootloader.info(), Err(Error::InvalidRequest(_))));
    assert!(transport.state.borrow().requests().is_empty());

    bootloader.configure().unwrap();
    bootloader.read_info().unwrap();
    assert!(matches!(
        bootloader.start_write(),
        Err(Error::InvalidRequest(_))
    ));
    assert_eq!(
        transport.state.borrow().requests(),
        request_codes(&[Request::Info])
    );
}

#[test]
fn test_failed_packet_aborts_write() {
    let records: Vec<Vec<u8>> = (0..8).map(|i| payload(i * 16, 16)).collect();
    let slices: Vec<&[u8]> = records.iter().map(|r| r.as_slice()).collect();

    let transport = transport();
    transport.state.borrow_mut().bulk_failure_at = Some(1);
    let mut bootloader = open_session(&transport, 32);
    let mut image = image(&hex_text(&slices));
    image.compute_crc(0x3fff, 0xff).unwrap();

    {
        let mut program = bootloader.write_image(&mut image).unwrap();
        assert_eq!(program.next().map(|r| r.is_ok()), Some(true));
        assert!(matches!(
            program.next(),
            Some(Err(Error::Usb(rusb::Error::Pipe)))
        ));
        // Fused after the error
        assert!(program.next().is_none());
    }

    assert_eq!(bootloader.state(), SessionState::Writing);
    assert_eq!(transport.state.borrow().packets().len(), 1);
    assert!(matches!(
        bootloader.verify(&image),
        Err(Error::InvalidRequest(_))
    ));
}

#[test]
fn test_boot_crc() {
    let transport = transport();
    transport.state.borrow_mut().boot_crc = 0x12_3456;
    let mut bootloader = open_session(&transport, 64);
    assert_eq!(bootloader.read_boot_crc().unwrap(), 0x12_3456);
}

#[test]
fn test_mock_handle_close_is_recorded() {
    let transport = transport();
    let device = transport.state.borrow().attached[0];
    let handle = xflash::Transport::open(&transport, &device).unwrap();
    handle.close();
    assert_eq!(
        transport.state.borrow().events,
        vec![Event::Open(BOOTLOADER_ID), Event::Close(BOOTLOADER_ID)]
    );
}
