//! Interface between class drivers and the USB device core.
//!
//! The device core (enumeration, control dispatch, the event queue) lives
//! outside this crate; class drivers reach it through [`UsbdBus`] and receive
//! completed transfers as [`Transfer`] values.

use embassy_usb_driver::{EndpointAddress, EndpointInfo};

/// Standard descriptor types used by the class drivers' descriptor walks.
pub const DESC_TYPE_INTERFACE: u8 = 4;
pub const DESC_TYPE_ENDPOINT: u8 = 5;

/// Standard request codes and feature selectors the class layer cares about.
pub const REQUEST_CLEAR_FEATURE: u8 = 1;
pub const FEATURE_ENDPOINT_HALT: u16 = 0;

/// Stages of a control transfer as relayed to class drivers.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControlStage {
    Setup,
    Data,
    Ack,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestType {
    Standard,
    Class,
    Vendor,
    Reserved,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

/// A parsed SETUP packet.
#[derive(Copy, Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl ControlRequest {
    pub fn parse(raw: &[u8; 8]) -> Self {
        Self {
            request_type: raw[0],
            request: raw[1],
            value: u16::from_le_bytes([raw[2], raw[3]]),
            index: u16::from_le_bytes([raw[4], raw[5]]),
            length: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }

    pub fn kind(&self) -> RequestType {
        match (self.request_type >> 5) & 0b11 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }

    pub fn recipient(&self) -> Recipient {
        match self.request_type & 0b1_1111 {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            _ => Recipient::Other,
        }
    }
}

/// A completed bulk/interrupt transfer handed to a class driver.
///
/// OUT completions carry the received bytes; IN completions only the count.
#[derive(Copy, Clone, Debug)]
pub enum Transfer<'a> {
    In { len: u32 },
    Out { data: &'a [u8] },
}

/// Event a class driver asks the device core to replay from task context.
#[derive(Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeferredEvent {
    /// Synthetic transfer completion; re-enters the class state machine
    /// without any bus traffic.
    Retry { ep_addr: EndpointAddress, bytes: u32 },
    /// An asynchronous application I/O finished with this result.
    IoDone { bytes: i32 },
}

/// Endpoint and control services the device core provides to class drivers.
pub trait UsbdBus {
    fn edpt_open(&mut self, desc: &EndpointInfo);

    /// Queue an IN transfer; `data` is copied out before this returns.
    fn edpt_xfer_in(&mut self, ep_addr: EndpointAddress, data: &[u8]) -> bool;

    /// Arm an OUT transfer of up to `len` bytes. The received payload comes
    /// back with the [`Transfer::Out`] completion.
    fn edpt_xfer_out(&mut self, ep_addr: EndpointAddress, len: u32) -> bool;

    fn edpt_stall(&mut self, ep_addr: EndpointAddress);
    fn edpt_clear_stall(&mut self, ep_addr: EndpointAddress);
    fn edpt_stalled(&mut self, ep_addr: EndpointAddress) -> bool;

    /// True when the endpoint is idle: not stalled and no transfer queued.
    fn edpt_ready(&mut self, ep_addr: EndpointAddress) -> bool;

    /// Answer the control request currently in its data stage; an empty slice
    /// acknowledges with a status-only response.
    fn control_respond(&mut self, req: &ControlRequest, data: &[u8]) -> bool;

    /// Queue `event` on the device task. Safe to call from interrupt context
    /// when `in_isr` says so; the event is delivered back to the class driver
    /// in task context.
    fn defer(&mut self, event: DeferredEvent, in_isr: bool);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_packet_fields() {
        let req = ControlRequest::parse(&[0xA1, 0xFE, 0x00, 0x00, 0x02, 0x00, 0x01, 0x00]);
        assert_eq!(req.kind(), RequestType::Class);
        assert_eq!(req.recipient(), Recipient::Interface);
        assert_eq!(req.request, 0xFE);
        assert_eq!(req.index, 2);
        assert_eq!(req.length, 1);
    }
}
