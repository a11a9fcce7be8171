//! Static descriptor tables and the standard request handler built on top of them.
//!
//! A [`UsbDesc`] is immutable once built and shared between device instances through an `Arc`.
//! The mutable, per-device part of chapter 9 state (speed, selected configuration, remote wakeup)
//! lives in [`UsbDescState`].

use std::sync::Arc;

use bitflags::bitflags;

use crate::msos::{msos_str_desc, MsosDesc, MSOS_DESC_INDEX, MSOS_SIGNATURE};
use crate::usb::{
    clamp_response, RequestDirection, RequestRecipient, RequestType, SetupPacket, UsbPacket,
    UsbSpeed, USB_DESCRIPTOR_TYPE_CONFIGURATION, USB_DESCRIPTOR_TYPE_DEVICE,
    USB_DESCRIPTOR_TYPE_DEVICE_QUALIFIER, USB_DESCRIPTOR_TYPE_ENDPOINT,
    USB_DESCRIPTOR_TYPE_INTERFACE, USB_DESCRIPTOR_TYPE_OTHER_SPEED_CONFIGURATION,
    USB_DESCRIPTOR_TYPE_STRING, USB_FEATURE_DEVICE_REMOTE_WAKEUP, USB_REQUEST_CLEAR_FEATURE,
    USB_REQUEST_GET_CONFIGURATION, USB_REQUEST_GET_DESCRIPTOR, USB_REQUEST_GET_INTERFACE,
    USB_REQUEST_GET_STATUS, USB_REQUEST_SET_CONFIGURATION, USB_REQUEST_SET_FEATURE,
    USB_REQUEST_SET_INTERFACE,
};
use crate::{Result, WinUsbError};

pub const USB_LANGID_EN_US: u16 = 0x0409;

pub const USB_CLASS_VENDOR_SPEC: u8 = 0xff;

pub const USB_ENDPOINT_XFER_BULK: u8 = 0x02;

/// Longest string that still fits a one-byte `bLength`.
pub const USB_STRING_MAX_UNITS: usize = 126;

const DEVICE_DESC_LEN: u8 = 18;
const CONFIG_DESC_LEN: u8 = 9;
const INTERFACE_DESC_LEN: u8 = 9;
const ENDPOINT_DESC_LEN: u8 = 7;
const QUALIFIER_DESC_LEN: u8 = 10;

bitflags! {
    /// Configuration descriptor `bmAttributes`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ConfigAttributes: u8 {
        /// Reserved bit 7, must be set.
        const ONE = 0x80;
        const SELF_POWERED = 0x40;
        const REMOTE_WAKEUP = 0x20;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsbDescId {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub i_manufacturer: u8,
    pub i_product: u8,
    pub i_serial_number: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsbDescEndpoint {
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsbDescIface {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub i_interface: u8,
    pub endpoints: Vec<UsbDescEndpoint>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsbDescConfig {
    pub configuration_value: u8,
    pub i_configuration: u8,
    pub attributes: ConfigAttributes,
    /// In 2mA units.
    pub max_power: u8,
    pub interfaces: Vec<UsbDescIface>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsbDescDevice {
    pub bcd_usb: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub max_packet_size0: u8,
    pub configs: Vec<UsbDescConfig>,
}

/// Complete descriptor set of a device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsbDesc {
    pub id: UsbDescId,
    pub full: UsbDescDevice,
    pub high: Option<UsbDescDevice>,
    /// String table; `strings[0]` is string index 1.
    pub strings: Vec<String>,
    pub msos: Option<MsosDesc>,
}

impl UsbDescEndpoint {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(ENDPOINT_DESC_LEN);
        out.push(USB_DESCRIPTOR_TYPE_ENDPOINT);
        out.push(self.address);
        out.push(self.attributes);
        out.extend_from_slice(&self.max_packet_size.to_le_bytes());
        out.push(self.interval);
    }
}

impl UsbDescIface {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(INTERFACE_DESC_LEN);
        out.push(USB_DESCRIPTOR_TYPE_INTERFACE);
        out.push(self.interface_number);
        out.push(self.alternate_setting);
        out.push(self.endpoints.len() as u8);
        out.push(self.class);
        out.push(self.subclass);
        out.push(self.protocol);
        out.push(self.i_interface);
        for ep in &self.endpoints {
            ep.encode(out);
        }
    }
}

impl UsbDescConfig {
    /// Configuration descriptor followed by all interface and endpoint descriptors.
    ///
    /// `desc_type` is either CONFIGURATION or OTHER_SPEED_CONFIGURATION.
    pub fn encode(&self, desc_type: u8) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.push(CONFIG_DESC_LEN);
        out.push(desc_type);
        out.extend_from_slice(&[0, 0]); // wTotalLength, patched below
        out.push(self.num_interfaces());
        out.push(self.configuration_value);
        out.push(self.i_configuration);
        out.push(self.attributes.bits());
        out.push(self.max_power);
        for iface in &self.interfaces {
            iface.encode(&mut out);
        }
        let total = out.len() as u16;
        out[2..4].copy_from_slice(&total.to_le_bytes());
        out
    }

    /// Number of distinct interface numbers (alternate settings share a number).
    pub fn num_interfaces(&self) -> u8 {
        let mut numbers: Vec<u8> = self.interfaces.iter().map(|i| i.interface_number).collect();
        numbers.sort_unstable();
        numbers.dedup();
        numbers.len() as u8
    }

    fn interface(&self, number: u8, alternate: u8) -> Option<&UsbDescIface> {
        self.interfaces
            .iter()
            .find(|i| i.interface_number == number && i.alternate_setting == alternate)
    }
}

impl UsbDescDevice {
    pub fn device_descriptor(&self, id: &UsbDescId) -> Vec<u8> {
        let mut out = Vec::with_capacity(DEVICE_DESC_LEN as usize);
        out.push(DEVICE_DESC_LEN);
        out.push(USB_DESCRIPTOR_TYPE_DEVICE);
        out.extend_from_slice(&self.bcd_usb.to_le_bytes());
        out.push(self.class);
        out.push(self.subclass);
        out.push(self.protocol);
        out.push(self.max_packet_size0);
        out.extend_from_slice(&id.vendor_id.to_le_bytes());
        out.extend_from_slice(&id.product_id.to_le_bytes());
        out.extend_from_slice(&id.bcd_device.to_le_bytes());
        out.push(id.i_manufacturer);
        out.push(id.i_product);
        out.push(id.i_serial_number);
        out.push(self.configs.len() as u8);
        out
    }

    /// Device qualifier describing this table, as reported while running at the other speed.
    pub fn qualifier_descriptor(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(QUALIFIER_DESC_LEN as usize);
        out.push(QUALIFIER_DESC_LEN);
        out.push(USB_DESCRIPTOR_TYPE_DEVICE_QUALIFIER);
        out.extend_from_slice(&self.bcd_usb.to_le_bytes());
        out.push(self.class);
        out.push(self.subclass);
        out.push(self.protocol);
        out.push(self.max_packet_size0);
        out.push(self.configs.len() as u8);
        out.push(0); // bReserved
        out
    }

    fn config(&self, value: u8) -> Option<&UsbDescConfig> {
        self.configs.iter().find(|c| c.configuration_value == value)
    }
}

impl UsbDesc {
    pub fn string(&self, index: u8) -> Option<&str> {
        let slot = usize::from(index).checked_sub(1)?;
        self.strings.get(slot).map(String::as_str)
    }

    pub fn validate(&self) -> Result<()> {
        for (slot, s) in self.strings.iter().enumerate() {
            let units = s.encode_utf16().count();
            if units > USB_STRING_MAX_UNITS {
                return Err(WinUsbError::StringTooLong {
                    index: slot + 1,
                    units,
                    max: USB_STRING_MAX_UNITS,
                });
            }
        }
        if let Some(msos) = &self.msos {
            msos.validate()?;
        }
        Ok(())
    }
}

fn string_descriptor_utf16le(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + s.len() * 2);
    out.push(0); // bLength placeholder
    out.push(USB_DESCRIPTOR_TYPE_STRING);
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out[0] = out.len() as u8;
    out
}

fn string_descriptor_langid(langid: u16) -> [u8; 4] {
    let [l0, l1] = langid.to_le_bytes();
    [4, USB_DESCRIPTOR_TYPE_STRING, l0, l1]
}

/// Per-device chapter 9 state driven by the standard request handler.
#[derive(Debug)]
pub struct UsbDescState {
    desc: Arc<UsbDesc>,
    speed: UsbSpeed,
    configuration: u8,
    alternate_setting: u8,
    remote_wakeup: bool,
}

impl UsbDescState {
    pub fn new(desc: Arc<UsbDesc>, speed: UsbSpeed) -> Self {
        // Fall back to the full-speed table when no high-speed one exists.
        let speed = match speed {
            UsbSpeed::High if desc.high.is_none() => UsbSpeed::Full,
            other => other,
        };
        Self {
            desc,
            speed,
            configuration: 0,
            alternate_setting: 0,
            remote_wakeup: false,
        }
    }

    pub fn desc(&self) -> &UsbDesc {
        &self.desc
    }

    pub fn speed(&self) -> UsbSpeed {
        self.speed
    }

    /// Current `bConfigurationValue`, 0 when unconfigured.
    pub fn configuration(&self) -> u8 {
        self.configuration
    }

    pub fn remote_wakeup(&self) -> bool {
        self.remote_wakeup
    }

    pub fn reset(&mut self) {
        self.configuration = 0;
        self.alternate_setting = 0;
        self.remote_wakeup = false;
    }

    /// Descriptor table for the current speed.
    pub fn device(&self) -> &UsbDescDevice {
        match (self.speed, self.desc.high.as_ref()) {
            (UsbSpeed::High, Some(high)) => high,
            _ => &self.desc.full,
        }
    }

    fn other_speed_device(&self) -> Option<&UsbDescDevice> {
        let high = self.desc.high.as_ref()?;
        Some(match self.speed {
            UsbSpeed::High => &self.desc.full,
            UsbSpeed::Full => high,
        })
    }

    pub fn active_config(&self) -> Option<&UsbDescConfig> {
        if self.configuration == 0 {
            return None;
        }
        self.device().config(self.configuration)
    }

    /// Whether the active configuration exposes `ep_addr` (direction bit included).
    pub fn has_endpoint(&self, ep_addr: u8) -> bool {
        self.active_config().is_some_and(|config| {
            config
                .interfaces
                .iter()
                .filter(|i| i.alternate_setting == self.alternate_setting)
                .flat_map(|i| i.endpoints.iter())
                .any(|ep| ep.address == ep_addr)
        })
    }

    fn get_descriptor(&self, setup: SetupPacket) -> Option<Vec<u8>> {
        let index = setup.descriptor_index();
        match setup.descriptor_type() {
            USB_DESCRIPTOR_TYPE_DEVICE => Some(self.device().device_descriptor(&self.desc.id)),
            USB_DESCRIPTOR_TYPE_CONFIGURATION => self
                .device()
                .configs
                .get(usize::from(index))
                .map(|c| c.encode(USB_DESCRIPTOR_TYPE_CONFIGURATION)),
            USB_DESCRIPTOR_TYPE_STRING => self.string_descriptor(index),
            USB_DESCRIPTOR_TYPE_DEVICE_QUALIFIER => {
                self.other_speed_device().map(UsbDescDevice::qualifier_descriptor)
            }
            USB_DESCRIPTOR_TYPE_OTHER_SPEED_CONFIGURATION => self
                .other_speed_device()?
                .configs
                .get(usize::from(index))
                .map(|c| c.encode(USB_DESCRIPTOR_TYPE_OTHER_SPEED_CONFIGURATION)),
            _ => None,
        }
    }

    fn string_descriptor(&self, index: u8) -> Option<Vec<u8>> {
        match index {
            0 => Some(string_descriptor_langid(USB_LANGID_EN_US).to_vec()),
            MSOS_DESC_INDEX => self
                .desc
                .msos
                .as_ref()
                .map(|msos| msos_str_desc(Some(msos), MSOS_SIGNATURE).to_vec()),
            _ => self.desc.string(index).map(string_descriptor_utf16le),
        }
    }

    /// Standard chapter 9 requests.
    ///
    /// Returns `false` for anything it does not handle (including malformed standard requests),
    /// leaving the decision to the caller. On success `p.actual_length` holds the number of
    /// response bytes written to `data`.
    pub fn handle_control(
        &mut self,
        p: &mut UsbPacket,
        setup: SetupPacket,
        data: &mut [u8],
    ) -> bool {
        let response = match (setup.request_type(), setup.recipient()) {
            (RequestType::Standard, RequestRecipient::Device) => self.handle_device_request(setup),
            (RequestType::Standard, RequestRecipient::Interface) => {
                self.handle_interface_request(setup)
            }
            _ => None,
        };
        let Some(response) = response else {
            return false;
        };

        let response = clamp_response(response, setup.w_length);
        let len = response.len().min(data.len());
        data[..len].copy_from_slice(&response[..len]);
        p.actual_length = len;
        true
    }

    fn handle_device_request(&mut self, setup: SetupPacket) -> Option<Vec<u8>> {
        let dir = setup.request_direction();
        match (dir, setup.b_request) {
            (RequestDirection::DeviceToHost, USB_REQUEST_GET_DESCRIPTOR) => {
                self.get_descriptor(setup)
            }
            (RequestDirection::DeviceToHost, USB_REQUEST_GET_CONFIGURATION) => {
                Some(vec![self.configuration])
            }
            (RequestDirection::HostToDevice, USB_REQUEST_SET_CONFIGURATION) => {
                let value = (setup.w_value & 0x00ff) as u8;
                if value != 0 && self.device().config(value).is_none() {
                    return None;
                }
                self.configuration = value;
                self.alternate_setting = 0;
                Some(Vec::new())
            }
            (RequestDirection::DeviceToHost, USB_REQUEST_GET_STATUS) => {
                let self_powered = self
                    .active_config()
                    .or_else(|| self.device().configs.first())
                    .is_some_and(|c| c.attributes.contains(ConfigAttributes::SELF_POWERED));
                // USB 2.0 spec 9.4.5: bit0 is Self Powered, bit1 is Remote Wakeup.
                let status = u16::from(self_powered) | (u16::from(self.remote_wakeup) << 1);
                Some(status.to_le_bytes().to_vec())
            }
            (RequestDirection::HostToDevice, USB_REQUEST_SET_FEATURE)
            | (RequestDirection::HostToDevice, USB_REQUEST_CLEAR_FEATURE) => {
                if setup.w_value != USB_FEATURE_DEVICE_REMOTE_WAKEUP {
                    return None;
                }
                self.remote_wakeup = setup.b_request == USB_REQUEST_SET_FEATURE;
                Some(Vec::new())
            }
            _ => None,
        }
    }

    fn handle_interface_request(&mut self, setup: SetupPacket) -> Option<Vec<u8>> {
        let number = (setup.w_index & 0x00ff) as u8;
        let config = self.active_config()?;
        config.interface(number, 0)?;

        match (setup.request_direction(), setup.b_request) {
            (RequestDirection::DeviceToHost, USB_REQUEST_GET_INTERFACE) => {
                Some(vec![self.alternate_setting])
            }
            (RequestDirection::HostToDevice, USB_REQUEST_SET_INTERFACE) => {
                let alternate = (setup.w_value & 0x00ff) as u8;
                config.interface(number, alternate)?;
                self.alternate_setting = alternate;
                Some(Vec::new())
            }
            (RequestDirection::DeviceToHost, USB_REQUEST_GET_STATUS) => Some(vec![0, 0]),
            _ => None,
        }
    }
}
