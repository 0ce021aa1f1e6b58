//! USB full-speed device stack core for STM32 "FSDev" peripherals.
//!
//! Two tightly coupled layers:
//! - [`dcd`]: the device controller driver, owning the endpoint registers, the
//!   packet memory area and the per-endpoint transfer engine.
//! - [`msc`]: a Mass Storage Class driver speaking Bulk-Only Transport on top
//!   of the endpoint services of a USB device core.
//!
//! The device core itself (enumeration, control dispatch, the event queue) is
//! not part of this crate; it connects the two layers through the traits in
//! [`usbd`] and [`dcd::EventHandler`].

#![no_std]

// macros must come first
mod fmt;

pub mod dcd;
pub mod fifo;
pub mod msc;
pub mod pma;
pub mod regs;
pub mod usbd;

pub use embassy_usb_driver::{Direction, EndpointAddress, EndpointInfo, EndpointType};
use static_assertions::const_assert;

// The descriptor table plus both control-pipe buffers must fit even the
// smallest packet memory.
const_assert!(pma::PMA_SIZE as usize >= pma::PMA_ALLOC_BASE as usize + 2 * dcd::EP0_SIZE as usize);

/// Register block address of the on-chip full-speed device peripheral.
pub const USB_BASE: u32 = 0x4000_5C00;
/// CPU-side base address of the packet memory.
pub const USB_PMAADDR: u32 = 0x4000_6000;

/// Driver instance over the on-chip peripheral at the standard addresses.
///
/// # Safety
///
/// At most one driver may exist per peripheral, the USB clocks must be
/// running, and the interrupt wiring is the caller's responsibility.
pub unsafe fn usb() -> dcd::Dcd {
    dcd::Dcd::new(
        regs::UsbRegs::from_ptr(USB_BASE as *mut ()),
        pma::Pma::from_ptr(USB_PMAADDR as *mut ()),
    )
}
