//! Emulated WinUSB loopback device with Microsoft OS 1.0 descriptors.
//!
//! - [`msos`]: byte-exact Extended Compat ID / Extended Properties records and the `0xEE` OS
//!   string descriptor
//! - [`desc`]: descriptor tables and the standard (chapter 9) request handler
//! - [`winusb`]: the device model itself, a bulk IN/OUT pair backed by one loopback buffer
//! - [`device`]: host-side adapter that drives a [`UsbDevice`] with whole transfers
//!
//! Every callback is synchronous and runs to completion on the caller's thread.

pub mod desc;
pub mod device;
pub mod msos;
pub mod usb;
pub mod winusb;

mod config;
mod error;

pub use config::{DeviceIdentity, WinUsbConfig};
pub use device::AttachedUsbDevice;
pub use error::{Result, WinUsbError};
pub use msos::MsosDesc;
pub use usb::{
    PacketId, SetupPacket, UsbDevice, UsbInResult, UsbOutResult, UsbPacket, UsbPacketStatus,
    UsbSpeed, UsbToken,
};
pub use winusb::WinUsbDevice;
