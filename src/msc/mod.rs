//! USB Mass Storage Class over Bulk-Only Transport.

pub mod bot;
pub mod scsi;

pub use bot::{IoResult, MscClass, MscHandler, Stage};
pub use scsi::{InquiryData, Sense};

pub const CLASS_MSC: u8 = 0x08;
pub const SUBCLASS_SCSI: u8 = 0x06;
pub const PROTOCOL_BOT: u8 = 0x50;

/// Class-specific requests on the control pipe.
pub const REQ_RESET: u8 = 0xFF;
pub const REQ_GET_MAX_LUN: u8 = 0xFE;
