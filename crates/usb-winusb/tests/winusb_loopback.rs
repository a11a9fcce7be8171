use proptest::prelude::*;

use usb_winusb::winusb::DEFAULT_LOOPBACK_LEN;
use usb_winusb::{
    AttachedUsbDevice, SetupPacket, UsbInResult, UsbOutResult, WinUsbConfig, WinUsbDevice,
};

const USB_REQUEST_CLEAR_FEATURE: u8 = 0x01;
const USB_REQUEST_SET_CONFIGURATION: u8 = 0x09;

const BULK_IN_EP: u8 = 1;
const BULK_OUT_EP: u8 = 2;

fn set_configuration() -> SetupPacket {
    SetupPacket {
        bm_request_type: 0x00,
        b_request: USB_REQUEST_SET_CONFIGURATION,
        w_value: 1,
        w_index: 0,
        w_length: 0,
    }
}

fn configured(config: &WinUsbConfig) -> AttachedUsbDevice {
    let mut dev = AttachedUsbDevice::new(Box::new(WinUsbDevice::new(config).unwrap()));
    dev.realize().unwrap();
    assert_eq!(dev.control_out(set_configuration(), &[]), UsbOutResult::Ack);
    dev
}

fn read(dev: &mut AttachedUsbDevice, len: usize) -> Vec<u8> {
    match dev.handle_in(BULK_IN_EP, len) {
        UsbInResult::Data(data) => data,
        other => panic!("expected bulk IN data, got {other:?}"),
    }
}

#[test]
fn bulk_endpoints_stall_until_configured() {
    let mut dev = AttachedUsbDevice::new(Box::new(WinUsbDevice::default()));
    dev.realize().unwrap();
    assert_eq!(dev.handle_out(BULK_OUT_EP, &[1, 2, 3]), UsbOutResult::Stall);
    assert_eq!(dev.handle_in(BULK_IN_EP, 3), UsbInResult::Stall);
}

#[test]
fn wrong_direction_endpoints_stall() {
    let mut dev = configured(&WinUsbConfig::default());
    // Endpoint 1 is IN only, endpoint 2 is OUT only.
    assert_eq!(dev.handle_out(BULK_IN_EP, &[1]), UsbOutResult::Stall);
    assert_eq!(dev.handle_in(BULK_OUT_EP, 1), UsbInResult::Stall);
    assert_eq!(dev.handle_in(3, 1), UsbInResult::Stall);
}

#[test]
fn out_then_in_returns_written_bytes() {
    let mut dev = configured(&WinUsbConfig::default());
    assert_eq!(dev.handle_out(BULK_OUT_EP, b"hello winusb"), UsbOutResult::Ack);

    let data = read(&mut dev, DEFAULT_LOOPBACK_LEN);
    assert_eq!(data.len(), DEFAULT_LOOPBACK_LEN);
    assert_eq!(&data[..12], b"hello winusb");
    assert!(data[12..].iter().all(|&b| b == 0));
}

#[test]
fn transfers_are_capped_at_loopback_length() {
    let config = WinUsbConfig {
        loopback_len: 16,
        ..WinUsbConfig::default()
    };
    let mut dev = configured(&config);
    let payload: Vec<u8> = (0..64).collect();
    assert_eq!(dev.handle_out(BULK_OUT_EP, &payload), UsbOutResult::Ack);
    assert_eq!(read(&mut dev, 64), payload[..16].to_vec());
}

#[test]
fn shorter_write_keeps_tail_of_previous_write() {
    let mut dev = configured(&WinUsbConfig::default());
    dev.handle_out(BULK_OUT_EP, &[0xaa; 8]);
    dev.handle_out(BULK_OUT_EP, &[0x11; 4]);
    assert_eq!(
        read(&mut dev, 8),
        vec![0x11, 0x11, 0x11, 0x11, 0xaa, 0xaa, 0xaa, 0xaa]
    );
}

#[test]
fn reset_zeroes_loopback_buffer() {
    let mut dev = configured(&WinUsbConfig::default());
    dev.handle_out(BULK_OUT_EP, &[0xff; DEFAULT_LOOPBACK_LEN]);

    dev.reset();
    assert_eq!(dev.address(), 0);
    // Reset also drops the configuration.
    assert_eq!(dev.handle_in(BULK_IN_EP, 1), UsbInResult::Stall);

    assert_eq!(dev.control_out(set_configuration(), &[]), UsbOutResult::Ack);
    assert_eq!(
        read(&mut dev, DEFAULT_LOOPBACK_LEN),
        vec![0; DEFAULT_LOOPBACK_LEN]
    );
}

#[test]
fn clear_halt_drops_buffered_data() {
    let mut dev = configured(&WinUsbConfig::default());
    dev.handle_out(BULK_OUT_EP, b"stale");

    let clear_halt = SetupPacket {
        bm_request_type: 0x02,
        b_request: USB_REQUEST_CLEAR_FEATURE,
        w_value: 0,
        w_index: 0x81,
        w_length: 0,
    };
    assert_eq!(dev.control_out(clear_halt, &[]), UsbOutResult::Ack);
    assert_eq!(read(&mut dev, 5), vec![0; 5]);
}

#[test]
fn unrealize_then_realize_starts_from_zeroes() {
    let mut dev = configured(&WinUsbConfig::default());
    dev.handle_out(BULK_OUT_EP, &[0x42; 32]);

    dev.unrealize();
    assert!(!dev.is_realized());
    dev.realize().unwrap();

    assert_eq!(dev.control_out(set_configuration(), &[]), UsbOutResult::Ack);
    assert_eq!(read(&mut dev, 32), vec![0; 32]);
}

proptest! {
    #[test]
    fn loopback_round_trip(
        payload in proptest::collection::vec(any::<u8>(), 0..=DEFAULT_LOOPBACK_LEN),
        extra in 0usize..64,
    ) {
        let mut dev = configured(&WinUsbConfig::default());
        prop_assert_eq!(dev.handle_out(BULK_OUT_EP, &payload), UsbOutResult::Ack);

        let want = (payload.len() + extra).min(DEFAULT_LOOPBACK_LEN);
        let data = read(&mut dev, payload.len() + extra);
        prop_assert_eq!(data.len(), want);
        prop_assert_eq!(&data[..payload.len()], payload.as_slice());
        prop_assert!(data[payload.len()..].iter().all(|&b| b == 0));
    }
}
