//! WinUSB loopback device.
//!
//! A vendor-class device with one bulk IN (`0x81`) and one bulk OUT (`0x02`) endpoint sharing a
//! single fixed-size buffer: whatever the host last wrote is what it reads back. The device also
//! answers the Microsoft OS descriptor requests so Windows binds the in-box WinUSB driver without
//! an INF file.

use std::sync::{Arc, OnceLock};

use tracing::{debug, trace};

use crate::config::WinUsbConfig;
use crate::desc::{
    ConfigAttributes, UsbDesc, UsbDescConfig, UsbDescDevice, UsbDescEndpoint, UsbDescId,
    UsbDescIface, UsbDescState, USB_CLASS_VENDOR_SPEC, USB_ENDPOINT_XFER_BULK,
};
use crate::msos::{self, MsosDesc, MSOS_VENDOR_CODE_QEMU};
use crate::usb::{
    PacketId, RequestDirection, RequestRecipient, RequestType, SetupPacket, UsbDevice, UsbPacket,
    UsbPacketStatus, UsbSpeed, UsbToken, USB_DIR_IN, USB_REQUEST_CLEAR_FEATURE,
    USB_REQUEST_TYPE_ENDPOINT_OUT,
};
use crate::{Result, WinUsbError};

pub const WINUSB_VENDOR_ID: u16 = 0x05e3;
pub const WINUSB_PRODUCT_ID: u16 = 0x3e50;

pub const WINUSB_BULK_IN_EP: u8 = USB_DIR_IN | 0x01;
pub const WINUSB_BULK_OUT_EP: u8 = 0x02;

pub const WINUSB_COMPATIBLE_ID: &str = "WINUSB";
pub const WINUSB_INTERFACE_GUID_PROPERTY: &str = "DeviceInterfaceGUID";
pub const WINUSB_INTERFACE_GUID: &str = "{85239cd7-da0f-44ea-a9c8-da8cc28f8564}";

pub const DEFAULT_LOOPBACK_LEN: usize = 200;
pub const MAX_LOOPBACK_LEN: usize = 64 * 1024;

const STR_MANUFACTURER: u8 = 1;
const STR_PRODUCT: u8 = 2;
const STR_SERIALNUMBER: u8 = 3;
const STR_CONFIG_FULL: u8 = 4;
const STR_CONFIG_HIGH: u8 = 5;

const FULL_SPEED_MAX_PACKET: u16 = 64;
const HIGH_SPEED_MAX_PACKET: u16 = 512;

pub fn default_msos() -> MsosDesc {
    MsosDesc {
        vendor_code: MSOS_VENDOR_CODE_QEMU,
        compatible_id: Some(WINUSB_COMPATIBLE_ID.to_string()),
        registry_property_name: Some(WINUSB_INTERFACE_GUID_PROPERTY.to_string()),
        registry_property_data: Some(WINUSB_INTERFACE_GUID.to_string()),
        selective_suspend_enabled: false,
    }
}

fn winusb_iface(max_packet_size: u16) -> UsbDescIface {
    let bulk = |address| UsbDescEndpoint {
        address,
        attributes: USB_ENDPOINT_XFER_BULK,
        max_packet_size,
        interval: 0,
    };
    UsbDescIface {
        interface_number: 0,
        alternate_setting: 0,
        class: USB_CLASS_VENDOR_SPEC,
        subclass: 0x06, // SCSI
        protocol: 0x50, // Bulk-only
        i_interface: 0,
        endpoints: vec![bulk(WINUSB_BULK_IN_EP), bulk(WINUSB_BULK_OUT_EP)],
    }
}

fn winusb_device(max_packet_size0: u8, max_packet_size: u16, i_configuration: u8) -> UsbDescDevice {
    UsbDescDevice {
        bcd_usb: 0x0200,
        class: 0,
        subclass: 0,
        protocol: 0,
        max_packet_size0,
        configs: vec![UsbDescConfig {
            configuration_value: 1,
            i_configuration,
            attributes: ConfigAttributes::ONE | ConfigAttributes::SELF_POWERED,
            max_power: 0,
            interfaces: vec![winusb_iface(max_packet_size)],
        }],
    }
}

/// Descriptor set for a device built from `config`.
pub fn build_desc(config: &WinUsbConfig) -> UsbDesc {
    let identity = &config.identity;
    UsbDesc {
        id: UsbDescId {
            vendor_id: identity.vendor_id,
            product_id: identity.product_id,
            bcd_device: identity.bcd_device,
            i_manufacturer: STR_MANUFACTURER,
            i_product: STR_PRODUCT,
            i_serial_number: STR_SERIALNUMBER,
        },
        full: winusb_device(8, FULL_SPEED_MAX_PACKET, STR_CONFIG_FULL),
        high: Some(winusb_device(64, HIGH_SPEED_MAX_PACKET, STR_CONFIG_HIGH)),
        strings: vec![
            identity.manufacturer.clone(),
            identity.product.clone(),
            identity.serial_number.clone(),
            "Full speed config (USB 1.1)".to_string(),
            "High speed config (USB 2.0)".to_string(),
        ],
        msos: config.msos.clone(),
    }
}

pub(crate) fn check_loopback_len(len: usize) -> Result<()> {
    if len > MAX_LOOPBACK_LEN {
        return Err(WinUsbError::InvalidConfig(format!(
            "loopback_len {len} exceeds {MAX_LOOPBACK_LEN} bytes"
        )));
    }
    Ok(())
}

/// Shared descriptor set of the stock device, built on first use.
pub fn default_desc() -> Arc<UsbDesc> {
    static DESC: OnceLock<Arc<UsbDesc>> = OnceLock::new();
    DESC.get_or_init(|| Arc::new(build_desc(&WinUsbConfig::default())))
        .clone()
}

#[derive(Debug)]
pub struct WinUsbDevice {
    desc: UsbDescState,
    loopback_len: usize,
    /// Present between realize and unrealize.
    loopback: Option<Vec<u8>>,
    /// Packet parked with [`WinUsbDevice::defer_packet`], if any.
    packet: Option<PacketId>,
}

impl Default for WinUsbDevice {
    fn default() -> Self {
        Self::with_desc(default_desc(), UsbSpeed::Full, DEFAULT_LOOPBACK_LEN)
    }
}

impl WinUsbDevice {
    pub fn new(config: &WinUsbConfig) -> Result<Self> {
        check_loopback_len(config.loopback_len)?;
        let desc = build_desc(config);
        desc.validate()?;
        Ok(Self::with_desc(
            Arc::new(desc),
            config.speed,
            config.loopback_len,
        ))
    }

    pub fn with_desc(desc: Arc<UsbDesc>, speed: UsbSpeed, loopback_len: usize) -> Self {
        Self {
            desc: UsbDescState::new(desc, speed),
            loopback_len,
            loopback: None,
            packet: None,
        }
    }

    pub fn is_realized(&self) -> bool {
        self.loopback.is_some()
    }

    /// Current contents of the loopback buffer, `None` while unrealized.
    pub fn loopback(&self) -> Option<&[u8]> {
        self.loopback.as_deref()
    }

    pub fn inflight_packet(&self) -> Option<PacketId> {
        self.packet
    }

    /// Parks `p` as the single in-flight packet.
    ///
    /// The packet is completed later with [`WinUsbDevice::complete_deferred`] or dropped through
    /// [`UsbDevice::cancel_packet`].
    pub fn defer_packet(&mut self, p: &mut UsbPacket) {
        assert!(
            self.packet.is_none(),
            "packet {:?} deferred while {:?} is still in flight",
            p.id,
            self.packet
        );
        trace!(packet = ?p.id, "winusb defer packet");
        p.status = UsbPacketStatus::Async;
        self.packet = Some(p.id);
    }

    /// Services a packet previously parked with [`WinUsbDevice::defer_packet`].
    pub fn complete_deferred(&mut self, p: &mut UsbPacket) {
        assert_eq!(
            self.packet,
            Some(p.id),
            "completed packet is not the in-flight packet"
        );
        self.packet = None;
        p.status = UsbPacketStatus::Success;
        self.handle_data(p);
    }

    fn clear_loopback(&mut self) {
        if let Some(buf) = self.loopback.as_mut() {
            buf.fill(0);
        }
    }

    /// Vendor IN request carrying the MSOS vendor code: `wIndex` selects the extended descriptor.
    fn handle_msos_request(&self, p: &mut UsbPacket, setup: SetupPacket, data: &mut [u8]) -> bool {
        let Some(msos) = self.desc.desc().msos.as_ref() else {
            return false;
        };
        let is_os_feature_request = setup.request_type() == RequestType::Vendor
            && setup.request_direction() == RequestDirection::DeviceToHost
            && matches!(
                setup.recipient(),
                RequestRecipient::Device | RequestRecipient::Interface
            )
            && setup.b_request == msos.vendor_code;
        if !is_os_feature_request {
            return false;
        }

        p.actual_length = msos::deliver(setup.w_index, msos, data, usize::from(setup.w_length));
        true
    }

    /// CLEAR_FEATURE on either bulk endpoint drops whatever the loopback buffer holds.
    fn handle_endpoint_clear(&mut self, setup: SetupPacket) -> bool {
        if setup.bm_request_type != USB_REQUEST_TYPE_ENDPOINT_OUT
            || setup.b_request != USB_REQUEST_CLEAR_FEATURE
        {
            return false;
        }
        match (setup.w_index & 0x00ff) as u8 {
            WINUSB_BULK_OUT_EP | WINUSB_BULK_IN_EP => {
                self.clear_loopback();
                true
            }
            _ => false,
        }
    }
}

impl UsbDevice for WinUsbDevice {
    fn speed(&self) -> UsbSpeed {
        self.desc.speed()
    }

    fn realize(&mut self) -> Result<()> {
        if self.loopback.is_some() {
            return Err(WinUsbError::AlreadyRealized);
        }
        check_loopback_len(self.loopback_len)?;
        self.desc.desc().validate()?;
        self.desc.reset();
        self.loopback = Some(vec![0; self.loopback_len]);
        debug!(
            loopback_len = self.loopback_len,
            speed = ?self.desc.speed(),
            "winusb realized"
        );
        Ok(())
    }

    fn unrealize(&mut self) {
        self.loopback = None;
        self.packet = None;
        debug!("winusb unrealized");
    }

    fn handle_reset(&mut self) {
        trace!("winusb reset");
        self.desc.reset();
        self.clear_loopback();
    }

    fn handle_control(&mut self, p: &mut UsbPacket, setup: SetupPacket, data: &mut [u8]) {
        trace!(
            request = setup.request(),
            value = setup.w_value,
            index = setup.w_index,
            length = setup.w_length,
            "winusb control"
        );

        let handled = self.desc.handle_control(p, setup, data)
            || self.handle_msos_request(p, setup, data)
            || self.handle_endpoint_clear(setup);
        if !handled {
            debug!(request = setup.request(), "winusb stalling control request");
            p.status = UsbPacketStatus::Stall;
        }
    }

    fn handle_data(&mut self, p: &mut UsbPacket) {
        trace!(token = ?p.token, endpoint = p.endpoint, size = p.size(), "winusb data");

        match p.token {
            UsbToken::Out | UsbToken::In => {
                if let Some(buf) = self.loopback.as_mut() {
                    let len = buf.len().min(p.size() - p.actual_length);
                    p.copy(&mut buf[..len]);
                }
                p.status = UsbPacketStatus::Success;
            }
            UsbToken::Setup => {
                p.status = UsbPacketStatus::Stall;
            }
        }
    }

    fn cancel_packet(&mut self, p: &UsbPacket) {
        trace!(packet = ?p.id, "winusb cancel packet");
        assert_eq!(
            self.packet,
            Some(p.id),
            "cancelled packet is not the in-flight packet"
        );
        self.packet = None;
    }

    fn has_endpoint(&self, ep_addr: u8) -> bool {
        self.desc.has_endpoint(ep_addr)
    }
}
