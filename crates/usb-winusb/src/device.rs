use tracing::debug;

use crate::usb::{
    PacketId, RequestDirection, RequestRecipient, RequestType, SetupPacket, UsbDevice, UsbInResult,
    UsbOutResult, UsbPacket, UsbPacketStatus, USB_DIR_IN, USB_REQUEST_SET_ADDRESS,
};
use crate::Result;

/// A USB device as seen by the host controller.
///
/// This wrapper tracks the device address, hands out packet ids and turns whole control/data
/// transfers into [`UsbPacket`]s for a [`UsbDevice`] model. The model never sees SET_ADDRESS.
pub struct AttachedUsbDevice {
    address: u8,
    realized: bool,
    next_packet_id: u64,
    model: Box<dyn UsbDevice>,
}

impl AttachedUsbDevice {
    pub fn new(model: Box<dyn UsbDevice>) -> Self {
        Self {
            address: 0,
            realized: false,
            next_packet_id: 1,
            model,
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn is_realized(&self) -> bool {
        self.realized
    }

    pub fn realize(&mut self) -> Result<()> {
        self.model.realize()?;
        self.realized = true;
        Ok(())
    }

    pub fn unrealize(&mut self) {
        if !self.realized {
            return;
        }
        self.model.unrealize();
        self.realized = false;
        self.address = 0;
    }

    /// Bus reset.
    pub fn reset(&mut self) {
        self.address = 0;
        self.model.handle_reset();
    }

    pub fn alloc_packet_id(&mut self) -> PacketId {
        let id = PacketId(self.next_packet_id);
        self.next_packet_id = self.next_packet_id.wrapping_add(1).max(1);
        id
    }

    /// Runs a device-to-host control transfer and returns the DATA stage.
    pub fn control_in(&mut self, setup: SetupPacket) -> UsbInResult {
        if setup.request_direction() != RequestDirection::DeviceToHost {
            return UsbInResult::Stall;
        }

        let mut p = UsbPacket::setup(self.alloc_packet_id());
        let mut data = vec![0u8; usize::from(setup.w_length)];
        self.model.handle_control(&mut p, setup, &mut data);
        match p.status {
            UsbPacketStatus::Success => {
                data.truncate(p.actual_length);
                UsbInResult::Data(data)
            }
            UsbPacketStatus::Stall => UsbInResult::Stall,
            UsbPacketStatus::Nak | UsbPacketStatus::Async => UsbInResult::Nak,
        }
    }

    /// Runs a host-to-device control transfer with `data` as its DATA stage.
    pub fn control_out(&mut self, setup: SetupPacket, data: &[u8]) -> UsbOutResult {
        if setup.request_direction() != RequestDirection::HostToDevice
            || data.len() != usize::from(setup.w_length)
        {
            return UsbOutResult::Stall;
        }

        // Intercept SET_ADDRESS so device models don't need to track address state.
        if setup.request_type() == RequestType::Standard
            && setup.recipient() == RequestRecipient::Device
            && setup.b_request == USB_REQUEST_SET_ADDRESS
            && setup.w_length == 0
        {
            self.address = (setup.w_value & 0x007f) as u8;
            debug!(address = self.address, "usb device addressed");
            return UsbOutResult::Ack;
        }

        let mut p = UsbPacket::setup(self.alloc_packet_id());
        let mut buf = data.to_vec();
        self.model.handle_control(&mut p, setup, &mut buf);
        out_result(p.status)
    }

    /// Bulk/interrupt IN on a non-zero endpoint number.
    pub fn handle_in(&mut self, endpoint: u8, max_len: usize) -> UsbInResult {
        let ep_addr = USB_DIR_IN | (endpoint & 0x0f);
        if endpoint & 0x0f == 0 || !self.model.has_endpoint(ep_addr) {
            return UsbInResult::Stall;
        }

        let mut p = UsbPacket::input(self.alloc_packet_id(), endpoint, max_len);
        self.model.handle_data(&mut p);
        match p.status {
            UsbPacketStatus::Success => UsbInResult::Data(p.data().to_vec()),
            UsbPacketStatus::Stall => UsbInResult::Stall,
            UsbPacketStatus::Nak | UsbPacketStatus::Async => UsbInResult::Nak,
        }
    }

    /// Bulk/interrupt OUT on a non-zero endpoint number.
    pub fn handle_out(&mut self, endpoint: u8, data: &[u8]) -> UsbOutResult {
        let ep_addr = endpoint & 0x0f;
        if ep_addr == 0 || !self.model.has_endpoint(ep_addr) {
            return UsbOutResult::Stall;
        }

        let mut p = UsbPacket::output(self.alloc_packet_id(), endpoint, data);
        self.model.handle_data(&mut p);
        out_result(p.status)
    }
}

fn out_result(status: UsbPacketStatus) -> UsbOutResult {
    match status {
        UsbPacketStatus::Success => UsbOutResult::Ack,
        UsbPacketStatus::Stall => UsbOutResult::Stall,
        UsbPacketStatus::Nak | UsbPacketStatus::Async => UsbOutResult::Nak,
    }
}
