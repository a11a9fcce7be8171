use serde::{Deserialize, Serialize};

use crate::msos::MsosDesc;
use crate::usb::UsbSpeed;
use crate::winusb;
use crate::Result;

/// Identity fields exposed through the device and string descriptors.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub manufacturer: String,
    pub product: String,
    pub serial_number: String,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self {
            vendor_id: winusb::WINUSB_VENDOR_ID,
            product_id: winusb::WINUSB_PRODUCT_ID,
            bcd_device: 0x0000,
            manufacturer: "GenesysLogic".to_string(),
            product: "QEMU WinUsb Device".to_string(),
            serial_number: "000000000012".to_string(),
        }
    }
}

/// Construction-time settings of a [`WinUsbDevice`](crate::WinUsbDevice).
///
/// Every field is optional when deserializing; missing fields keep the defaults of the stock
/// device (full speed, 200-byte loopback, `WINUSB` compatible ID with a `DeviceInterfaceGUID`
/// registry property). Set `msos` to `null` to build a device without OS descriptors.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WinUsbConfig {
    pub speed: UsbSpeed,
    pub loopback_len: usize,
    pub identity: DeviceIdentity,
    pub msos: Option<MsosDesc>,
}

impl Default for WinUsbConfig {
    fn default() -> Self {
        Self {
            speed: UsbSpeed::Full,
            loopback_len: winusb::DEFAULT_LOOPBACK_LEN,
            identity: DeviceIdentity::default(),
            msos: Some(winusb::default_msos()),
        }
    }
}

impl WinUsbConfig {
    /// Parses and validates a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        winusb::check_loopback_len(self.loopback_len)?;
        winusb::build_desc(self).validate()
    }
}
