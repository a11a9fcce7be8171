//! Transaction-level USB primitives shared by the device model and the host-side adapter.

use serde::{Deserialize, Serialize};

use crate::Result;

pub const USB_DESCRIPTOR_TYPE_DEVICE: u8 = 0x01;
pub const USB_DESCRIPTOR_TYPE_CONFIGURATION: u8 = 0x02;
pub const USB_DESCRIPTOR_TYPE_STRING: u8 = 0x03;
pub const USB_DESCRIPTOR_TYPE_INTERFACE: u8 = 0x04;
pub const USB_DESCRIPTOR_TYPE_ENDPOINT: u8 = 0x05;
pub const USB_DESCRIPTOR_TYPE_DEVICE_QUALIFIER: u8 = 0x06;
pub const USB_DESCRIPTOR_TYPE_OTHER_SPEED_CONFIGURATION: u8 = 0x07;

pub const USB_REQUEST_GET_STATUS: u8 = 0x00;
pub const USB_REQUEST_CLEAR_FEATURE: u8 = 0x01;
pub const USB_REQUEST_SET_FEATURE: u8 = 0x03;
pub const USB_REQUEST_SET_ADDRESS: u8 = 0x05;
pub const USB_REQUEST_GET_DESCRIPTOR: u8 = 0x06;
pub const USB_REQUEST_GET_CONFIGURATION: u8 = 0x08;
pub const USB_REQUEST_SET_CONFIGURATION: u8 = 0x09;
pub const USB_REQUEST_GET_INTERFACE: u8 = 0x0a;
pub const USB_REQUEST_SET_INTERFACE: u8 = 0x0b;

pub const USB_FEATURE_DEVICE_REMOTE_WAKEUP: u16 = 1;

/// `bmRequestType` for a standard, host-to-device request addressed to an endpoint.
pub const USB_REQUEST_TYPE_ENDPOINT_OUT: u8 = 0x02;

pub const USB_DIR_IN: u8 = 0x80;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestDirection {
    HostToDevice,
    DeviceToHost,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestType {
    Standard,
    Class,
    Vendor,
    Reserved,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestRecipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetupPacket {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

impl SetupPacket {
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self {
            bm_request_type: bytes[0],
            b_request: bytes[1],
            w_value: u16::from_le_bytes([bytes[2], bytes[3]]),
            w_index: u16::from_le_bytes([bytes[4], bytes[5]]),
            w_length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    pub fn request_direction(&self) -> RequestDirection {
        if self.bm_request_type & USB_DIR_IN != 0 {
            RequestDirection::DeviceToHost
        } else {
            RequestDirection::HostToDevice
        }
    }

    pub fn request_type(&self) -> RequestType {
        match (self.bm_request_type >> 5) & 0x03 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }

    pub fn recipient(&self) -> RequestRecipient {
        match self.bm_request_type & 0x1f {
            0 => RequestRecipient::Device,
            1 => RequestRecipient::Interface,
            2 => RequestRecipient::Endpoint,
            _ => RequestRecipient::Other,
        }
    }

    /// Combined `(bmRequestType << 8) | bRequest` selector.
    pub fn request(&self) -> u16 {
        (u16::from(self.bm_request_type) << 8) | u16::from(self.b_request)
    }

    pub fn descriptor_type(&self) -> u8 {
        (self.w_value >> 8) as u8
    }

    pub fn descriptor_index(&self) -> u8 {
        (self.w_value & 0x00ff) as u8
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsbSpeed {
    #[default]
    Full,
    High,
}

/// Transaction token (PID) of a packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsbToken {
    Setup,
    In,
    Out,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsbPacketStatus {
    Success,
    Stall,
    Nak,
    /// The device kept the packet and will complete (or cancel) it later.
    Async,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketId(pub u64);

/// A single transfer handed to a device.
///
/// `buffer` holds the host data for OUT packets and the (zero-filled) receive area for IN packets.
/// `actual_length` counts the bytes moved so far in either direction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsbPacket {
    pub id: PacketId,
    pub token: UsbToken,
    pub endpoint: u8,
    pub status: UsbPacketStatus,
    pub actual_length: usize,
    buffer: Vec<u8>,
}

impl UsbPacket {
    pub fn setup(id: PacketId) -> Self {
        Self::new(id, UsbToken::Setup, 0, Vec::new())
    }

    pub fn input(id: PacketId, endpoint: u8, len: usize) -> Self {
        Self::new(id, UsbToken::In, endpoint, vec![0; len])
    }

    pub fn output(id: PacketId, endpoint: u8, data: &[u8]) -> Self {
        Self::new(id, UsbToken::Out, endpoint, data.to_vec())
    }

    fn new(id: PacketId, token: UsbToken, endpoint: u8, buffer: Vec<u8>) -> Self {
        Self {
            id,
            token,
            endpoint: endpoint & 0x0f,
            status: UsbPacketStatus::Success,
            actual_length: 0,
            buffer,
        }
    }

    /// Total transfer size requested by the host.
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    /// Endpoint address including the direction bit.
    pub fn endpoint_address(&self) -> u8 {
        match self.token {
            UsbToken::In => USB_DIR_IN | self.endpoint,
            _ => self.endpoint,
        }
    }

    /// Bytes transferred so far through the packet buffer.
    ///
    /// Control packets carry no buffer: their `actual_length` counts the DATA stage written to the
    /// separate control buffer, so this is always empty for them.
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.actual_length.min(self.buffer.len())]
    }

    /// Moves `ptr.len()` bytes between the packet and device memory.
    ///
    /// IN packets receive a copy of `ptr`; OUT packets fill `ptr` from the host data. Either way
    /// `actual_length` advances. Copying past the end of the transfer is a caller bug.
    pub fn copy(&mut self, ptr: &mut [u8]) {
        let start = self.actual_length;
        let end = start + ptr.len();
        assert!(
            end <= self.buffer.len(),
            "packet copy of {} bytes at offset {start} overruns {}-byte transfer",
            ptr.len(),
            self.buffer.len()
        );
        match self.token {
            UsbToken::In => self.buffer[start..end].copy_from_slice(ptr),
            UsbToken::Out | UsbToken::Setup => ptr.copy_from_slice(&self.buffer[start..end]),
        }
        self.actual_length = end;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbInResult {
    Data(Vec<u8>),
    Nak,
    Stall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbOutResult {
    Ack,
    Nak,
    Stall,
}

/// Device-side callbacks invoked by the host USB core.
///
/// Every callback runs to completion on the caller's thread. Control and data handlers report
/// their outcome through `p.status` / `p.actual_length` rather than a return value.
pub trait UsbDevice {
    fn speed(&self) -> UsbSpeed;

    /// Acquires device resources before the device becomes visible on the bus.
    fn realize(&mut self) -> Result<()>;

    /// Releases everything acquired by [`UsbDevice::realize`].
    fn unrealize(&mut self);

    fn handle_reset(&mut self);

    /// Services a control transfer on endpoint 0.
    ///
    /// `data` is the control buffer: it holds the DATA stage for host-to-device requests and
    /// receives the response for device-to-host requests, in which case the device sets
    /// `p.actual_length` to the response length.
    fn handle_control(&mut self, p: &mut UsbPacket, setup: SetupPacket, data: &mut [u8]);

    fn handle_data(&mut self, p: &mut UsbPacket);

    fn cancel_packet(&mut self, p: &UsbPacket);

    /// Whether the active configuration exposes `ep_addr` (direction bit included).
    fn has_endpoint(&self, _ep_addr: u8) -> bool {
        true
    }
}

pub(crate) fn clamp_response(mut data: Vec<u8>, setup_w_length: u16) -> Vec<u8> {
    let requested = setup_w_length as usize;
    if data.len() > requested {
        data.truncate(requested);
    }
    data
}
