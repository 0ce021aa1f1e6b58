//! Device controller driver for the USB full-speed peripheral.
//!
//! Owns the endpoint registers, the packet memory layout and the per-endpoint
//! transfer engine. The interrupt service routine decodes hardware events into
//! calls on an [`EventHandler`]; everything else (control dispatch, class
//! logic) lives upstream and reaches back in through the `edpt_*` methods.

use embassy_usb_driver::{Direction, EndpointAddress, EndpointInfo, EndpointType};
use embedded_hal::delay::DelayNs;

use crate::fifo::Fifo;
use crate::pma::{Pma, PmaAllocator, BTABLE_BASE};
use crate::regs::{EpHwType, EpStatus, Epr, Istr, UsbRegs, EP_COUNT};

/// Max packet size of the default control pipe.
pub const EP0_SIZE: u16 = 64;

/// Frames of resume signaling driven for a remote wakeup.
const RESUME_FRAMES: u16 = 3;

const DIR_OUT: usize = 0;
const DIR_IN: usize = 1;

#[inline(always)]
fn dir_idx(dir: Direction) -> usize {
    match dir {
        Direction::Out => DIR_OUT,
        Direction::In => DIR_IN,
    }
}

/// Receiver for the events decoded by [`Dcd::handle_interrupt`].
///
/// Implementations are expected to do the minimum in interrupt context,
/// typically posting to the device task's event queue.
pub trait EventHandler {
    fn bus_reset(&mut self);
    fn setup_received(&mut self, setup: [u8; 8]);
    fn xfer_complete(&mut self, ep_addr: EndpointAddress, len: u32);
    fn sof(&mut self, frame: u16) {
        let _ = frame;
    }
    fn suspend(&mut self) {}
    fn resume(&mut self) {}
}

#[derive(Copy, Clone)]
enum XferBuf {
    None,
    Slice(*mut u8),
    Fifo(*mut Fifo),
}

/// One direction of one logical endpoint.
#[derive(Copy, Clone)]
struct XferCtl {
    buf: XferBuf,
    total_len: u16,
    queued_len: u16,
    max_packet_size: u16,
    ep_idx: u8,
    iso_in_sending: bool,
}

impl XferCtl {
    const fn new() -> Self {
        Self {
            buf: XferBuf::None,
            total_len: 0,
            queued_len: 0,
            max_packet_size: 0,
            ep_idx: 0,
            iso_in_sending: false,
        }
    }
}

const SLOT_FREE: u8 = 0xff;

/// Hardware endpoint slot bookkeeping. IN and OUT of one endpoint number share
/// a slot, except isochronous endpoints which monopolize theirs (their second
/// descriptor-table half is the second buffer, not the other direction).
#[derive(Copy, Clone)]
struct EpSlot {
    ep_num: u8,
    ep_type: EndpointType,
    allocated: [bool; 2],
}

impl EpSlot {
    const fn free() -> Self {
        Self {
            ep_num: SLOT_FREE,
            ep_type: EndpointType::Bulk,
            allocated: [false; 2],
        }
    }
}

pub struct Dcd {
    regs: UsbRegs,
    pma: Pma,
    alloc: PmaAllocator,
    slots: [EpSlot; EP_COUNT],
    xfer: [[XferCtl; 2]; EP_COUNT],
    resume_countdown: u16,
}

impl Dcd {
    /// # Safety
    ///
    /// `regs` and `pma` must point at the peripheral's register block and
    /// packet memory (or at memory standing in for them) for the lifetime of
    /// the returned driver, and nothing else may touch them concurrently.
    pub const unsafe fn new(regs: UsbRegs, pma: Pma) -> Self {
        Self {
            regs,
            pma,
            alloc: PmaAllocator::new(),
            slots: [EpSlot::free(); EP_COUNT],
            xfer: [[XferCtl::new(); 2]; EP_COUNT],
            resume_countdown: 0,
        }
    }

    /// Bring the peripheral out of power-down, arm the interrupt masks and
    /// present the device to the host.
    pub fn init(&mut self, delay: &mut impl DelayNs) {
        let r = self.regs;

        // Exit power-down while holding the function in reset, then release.
        // The transceiver needs its startup time before the first transaction.
        r.cntr().write(|w| w.set_fres(true));
        delay.delay_us(1);
        r.cntr().write_value(Default::default());
        r.istr().write_value(Istr(0));

        for i in 0..EP_COUNT {
            self.ep_set_stat(i as u8, Direction::In, EpStatus::Disabled);
            self.ep_set_stat(i as u8, Direction::Out, EpStatus::Disabled);
        }

        r.btable().write(|w| w.set_addr(BTABLE_BASE));

        r.cntr().modify(|w| {
            w.set_ctrm(true);
            w.set_resetm(true);
            w.set_esofm(true);
            w.set_suspm(true);
            w.set_wkupm(true);
        });

        self.bus_reset();
        self.connect();
        info!("usb: device controller up");
    }

    /// Enable the DP pull-up, signaling attachment.
    pub fn connect(&mut self) {
        self.regs.bcdr().modify(|w| w.set_dppu(true));
    }

    /// Drop off the bus.
    pub fn disconnect(&mut self) {
        self.regs.bcdr().modify(|w| w.set_dppu(false));
    }

    /// Program the function address assigned by the host.
    pub fn set_address(&mut self, addr: u8) {
        self.regs.daddr().write(|w| {
            w.set_add(addr);
            w.set_ef(true);
        });
    }

    /// Gate the start-of-frame interrupt; reporting every frame is opt-in.
    pub fn sof_enable(&mut self, enabled: bool) {
        self.regs.cntr().modify(|w| w.set_sofm(enabled));
    }

    /// Start driving resume signaling; it is released from the interrupt
    /// handler a few frames later.
    pub fn remote_wakeup(&mut self) {
        self.resume_countdown = RESUME_FRAMES;
        self.regs.cntr().modify(|w| w.set_resume(true));
    }

    /// Open a control, bulk or interrupt endpoint: claim a slot, carve a
    /// packet buffer and park the endpoint at NAK with a clean toggle.
    pub fn edpt_open(&mut self, desc: &EndpointInfo) {
        assert!(desc.ep_type != EndpointType::Isochronous, "use edpt_iso_alloc/activate");
        let ep_num = desc.addr.index() as u8;
        let dir = desc.addr.direction();

        let ep_idx = self.claim_slot(ep_num, desc.ep_type);
        let slot = &mut self.slots[ep_idx as usize];
        assert!(!slot.allocated[dir_idx(dir)], "endpoint direction opened twice");
        slot.allocated[dir_idx(dir)] = true;

        // Bulk runs on the CONTROL hardware type; the peripheral treats the
        // two identically outside of SETUP handling.
        let hw_type = match desc.ep_type {
            EndpointType::Control | EndpointType::Bulk => EpHwType::Control,
            EndpointType::Interrupt => EpHwType::Interrupt,
            EndpointType::Isochronous => unreachable!(),
        };

        let addr = self.alloc.alloc(desc.max_packet_size);
        let regs = self.regs;
        regs.epr(ep_idx as usize)
            .write_value(regs.epr(ep_idx as usize).read().with_config(ep_num, hw_type, false));

        let xfer = &mut self.xfer[ep_num as usize][dir_idx(dir)];
        xfer.max_packet_size = desc.max_packet_size;
        xfer.ep_idx = ep_idx;

        match dir {
            Direction::In => {
                self.pma.btable_set_addr(ep_idx, 0, addr);
                self.ep_set_dtog(ep_idx, Direction::In, false);
                self.ep_set_stat(ep_idx, Direction::In, EpStatus::Nak);
            }
            Direction::Out => {
                self.pma.btable_set_addr(ep_idx, 1, addr);
                self.ep_set_dtog(ep_idx, Direction::Out, false);
                self.ep_set_stat(ep_idx, Direction::Out, EpStatus::Nak);
            }
        }
        trace!("usb: ep {} dir {} open, pma {}", ep_num, dir_idx(dir), addr);
    }

    /// Reserve the double-buffered packet memory for an isochronous endpoint.
    /// Both descriptor-table halves point at one buffer each.
    pub fn edpt_iso_alloc(&mut self, ep_addr: EndpointAddress, largest_packet_size: u16) {
        let ep_num = ep_addr.index() as u8;
        let ep_idx = self.claim_slot(ep_num, EndpointType::Isochronous);
        let slot = &mut self.slots[ep_idx as usize];
        slot.allocated = [true; 2];

        let packed = self.alloc.alloc_double(largest_packet_size);
        self.pma.btable_set_addr(ep_idx, 0, packed as u16);
        self.pma.btable_set_addr(ep_idx, 1, (packed >> 16) as u16);
        self.xfer[ep_num as usize][DIR_OUT].ep_idx = ep_idx;
        self.xfer[ep_num as usize][DIR_IN].ep_idx = ep_idx;
    }

    /// Activate a previously allocated isochronous endpoint for one direction.
    pub fn edpt_iso_activate(&mut self, desc: &EndpointInfo) {
        let ep_num = desc.addr.index() as u8;
        let dir = desc.addr.direction();
        let ep_idx = self.lookup_iso_slot(ep_num);

        let xfer = &mut self.xfer[ep_num as usize][dir_idx(dir)];
        xfer.max_packet_size = desc.max_packet_size;
        xfer.ep_idx = ep_idx;
        xfer.iso_in_sending = false;

        let regs = self.regs;
        regs.epr(ep_idx as usize)
            .write_value(regs.epr(ep_idx as usize).read().with_config(ep_num, EpHwType::Iso, false));

        // The opposite direction must never answer, and the free-buffer pointer
        // starts on buffer 0: for IN that pointer is DTOG_RX, for OUT DTOG_TX.
        match dir {
            Direction::In => {
                self.ep_set_stat(ep_idx, Direction::Out, EpStatus::Disabled);
                self.ep_set_dtog(ep_idx, Direction::Out, true);
            }
            Direction::Out => {
                self.ep_set_stat(ep_idx, Direction::In, EpStatus::Disabled);
                self.ep_set_dtog(ep_idx, Direction::In, true);
            }
        }
    }

    /// Disable every endpoint except the control pipe and hand their packet
    /// memory back.
    pub fn edpt_close_all(&mut self) {
        for i in 1..EP_COUNT {
            self.ep_set_stat(i as u8, Direction::In, EpStatus::Disabled);
            self.ep_set_stat(i as u8, Direction::Out, EpStatus::Disabled);
            self.slots[i] = EpSlot::free();
        }
        self.alloc.reset_keep_ep0(EP0_SIZE);
    }

    /// Schedule a transfer on a linear buffer.
    ///
    /// # Safety
    ///
    /// `buf` must stay valid (and, for OUT, writable) until the completion is
    /// reported through [`EventHandler::xfer_complete`] or the bus resets.
    pub unsafe fn edpt_xfer(&mut self, ep_addr: EndpointAddress, buf: *mut u8, total_len: u16) {
        self.schedule(ep_addr, XferBuf::Slice(buf), total_len);
    }

    /// Schedule a transfer that drains from / fills into a ring buffer.
    ///
    /// # Safety
    ///
    /// `ff` must outlive the transfer; completion is reported through
    /// [`EventHandler::xfer_complete`].
    pub unsafe fn edpt_xfer_fifo(&mut self, ep_addr: EndpointAddress, ff: *mut Fifo, total_len: u16) {
        self.schedule(ep_addr, XferBuf::Fifo(ff), total_len);
    }

    fn schedule(&mut self, ep_addr: EndpointAddress, buf: XferBuf, total_len: u16) {
        let ep_num = ep_addr.index();
        let dir = ep_addr.direction();
        let xfer = &mut self.xfer[ep_num][dir_idx(dir)];
        xfer.buf = buf;
        xfer.total_len = total_len;
        xfer.queued_len = 0;
        let ep_idx = xfer.ep_idx;

        match dir {
            Direction::In => self.transmit_packet(ep_num),
            Direction::Out => {
                let count = total_len.min(self.xfer[ep_num][DIR_OUT].max_packet_size);
                let epr = self.regs.epr(ep_idx as usize).read();
                if epr.ep_type() == EpHwType::Iso as u8 {
                    // Both hardware buffers must be ready to receive.
                    self.pma.btable_set_rx_bufsize(ep_idx, 0, count);
                    self.pma.btable_set_rx_bufsize(ep_idx, 1, count);
                } else {
                    self.pma.btable_set_rx_bufsize(ep_idx, 1, count);
                }
                // Buffer descriptor writes must land before the endpoint is
                // marked VALID.
                self.ep_set_stat(ep_idx, Direction::Out, EpStatus::Valid);
            }
        }
    }

    pub fn edpt_stall(&mut self, ep_addr: EndpointAddress) {
        let ep_idx = self.xfer[ep_addr.index()][dir_idx(ep_addr.direction())].ep_idx;
        self.ep_set_stat(ep_idx, ep_addr.direction(), EpStatus::Stall);
    }

    pub fn edpt_clear_stall(&mut self, ep_addr: EndpointAddress) {
        let ep_idx = self.xfer[ep_addr.index()][dir_idx(ep_addr.direction())].ep_idx;
        self.ep_set_dtog(ep_idx, ep_addr.direction(), false);
        self.ep_set_stat(ep_idx, ep_addr.direction(), EpStatus::Nak);
    }

    pub fn edpt_stalled(&self, ep_addr: EndpointAddress) -> bool {
        let ep_idx = self.xfer[ep_addr.index()][dir_idx(ep_addr.direction())].ep_idx;
        let epr = self.regs.epr(ep_idx as usize).read();
        let stat = match ep_addr.direction() {
            Direction::In => epr.stat_tx(),
            Direction::Out => epr.stat_rx(),
        };
        stat == EpStatus::Stall as u8
    }

    /// Service the peripheral. Call from the USB interrupt with a handler that
    /// forwards events to the device task.
    pub fn handle_interrupt(&mut self, handler: &mut impl EventHandler) {
        let r = self.regs;
        let istr = r.istr().read();

        if istr.sof() {
            r.istr().write_value(Istr::ack(Istr::SOF));
            handler.sof(r.fnr().read().frame());
        }

        if istr.reset() {
            r.istr().write_value(Istr::ack(Istr::RESET));
            trace!("usb: bus reset");
            self.bus_reset();
            handler.bus_reset();
            return;
        }

        if istr.ctr() {
            // One interrupt may cover several endpoints; drain them all so the
            // peripheral's internal ordering is preserved.
            loop {
                let istr = r.istr().read();
                if !istr.ctr() {
                    break;
                }
                let ep_id = istr.ep_id();
                if istr.dir() {
                    self.handle_ctr_rx(handler, ep_id);
                } else {
                    self.handle_ctr_tx(handler, ep_id);
                }
            }
        }

        if istr.wkup() {
            r.cntr().modify(|w| {
                w.set_lp_mode(false);
                w.set_fsusp(false);
            });
            r.istr().write_value(Istr::ack(Istr::WKUP));
            handler.resume();
        }

        if istr.susp() {
            // Suspend only once the bus has really gone idle; the flag also
            // fires on the way into a reset.
            r.cntr().modify(|w| w.set_fsusp(true));
            r.istr().write_value(Istr::ack(Istr::SUSP));
            r.cntr().modify(|w| w.set_lp_mode(true));
            handler.suspend();
        }

        if istr.esof() {
            if self.resume_countdown > 0 {
                self.resume_countdown -= 1;
                if self.resume_countdown == 0 {
                    r.cntr().modify(|w| w.set_resume(false));
                }
            }
            r.istr().write_value(Istr::ack(Istr::ESOF));
        }
    }

    // ------------------------------------------------------------------
    // internals

    /// Find or claim the hardware slot for a logical endpoint number.
    fn claim_slot(&mut self, ep_num: u8, ep_type: EndpointType) -> u8 {
        // Pair with an existing slot of the same number, unless either side is
        // isochronous.
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.ep_num == ep_num
                && ep_type != EndpointType::Isochronous
                && slot.ep_type != EndpointType::Isochronous
            {
                return i as u8;
            }
        }
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.ep_num == SLOT_FREE {
                slot.ep_num = ep_num;
                slot.ep_type = ep_type;
                return i as u8;
            }
        }
        panic!("no endpoint slot available");
    }

    fn lookup_iso_slot(&self, ep_num: u8) -> u8 {
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.ep_num == ep_num && slot.ep_type == EndpointType::Isochronous {
                return i as u8;
            }
        }
        panic!("isochronous endpoint not allocated");
    }

    fn ep_set_stat(&mut self, ep_idx: u8, dir: Direction, status: EpStatus) {
        let reg = self.regs.epr(ep_idx as usize);
        let v = match dir {
            Direction::In => reg.read().with_stat_tx(status),
            Direction::Out => reg.read().with_stat_rx(status),
        };
        reg.write_value(v);
    }

    fn ep_set_dtog(&mut self, ep_idx: u8, dir: Direction, bit: bool) {
        let reg = self.regs.epr(ep_idx as usize);
        let v = match dir {
            Direction::In => reg.read().with_dtog_tx(bit),
            Direction::Out => reg.read().with_dtog_rx(bit),
        };
        reg.write_value(v);
    }

    /// Internal bus reset: drop every transfer, rebuild the packet memory
    /// layout and reopen the control pipe.
    fn bus_reset(&mut self) {
        self.xfer = [[XferCtl::new(); 2]; EP_COUNT];
        self.slots = [EpSlot::free(); EP_COUNT];
        self.alloc.reset();
        self.resume_countdown = 0;

        self.regs.daddr().write(|w| {
            w.set_add(0);
            w.set_ef(true);
        });

        for dir in [Direction::Out, Direction::In] {
            self.edpt_open(&EndpointInfo {
                addr: EndpointAddress::from_parts(0, dir),
                ep_type: EndpointType::Control,
                max_packet_size: EP0_SIZE,
                interval_ms: 0,
            });
        }
    }

    /// Queue the next IN chunk: copy into the packet memory, publish the count
    /// and only then hand the buffer to the hardware.
    fn transmit_packet(&mut self, ep_num: usize) {
        let pma = self.pma;
        let regs = self.regs;
        let xfer = &mut self.xfer[ep_num][DIR_IN];
        let ep_idx = xfer.ep_idx;
        let len = (xfer.total_len - xfer.queued_len).min(xfer.max_packet_size);

        let epr = regs.epr(ep_idx as usize).read();
        let is_iso = epr.ep_type() == EpHwType::Iso as u8;
        // For double-buffered transmission the application side owns the
        // buffer the hardware is *not* pointed at.
        let buf_id = if is_iso {
            if epr.dtog_tx() {
                1
            } else {
                0
            }
        } else {
            0
        };
        let addr = pma.btable_get_addr(ep_idx, buf_id);

        if len > 0 {
            match xfer.buf {
                XferBuf::Slice(p) => {
                    let src = unsafe { core::slice::from_raw_parts(p.add(xfer.queued_len as usize), len as usize) };
                    pma.write_buf(addr, src);
                }
                XferBuf::Fifo(ff) => {
                    pma.write_fifo(addr, unsafe { &mut *ff }, len);
                }
                XferBuf::None => {}
            }
        }
        pma.btable_set_count(ep_idx, buf_id, len);
        xfer.queued_len += len;

        if is_iso {
            // Must be observable before the completion interrupt can fire.
            xfer.iso_in_sending = true;
        }
        self.ep_set_stat(ep_idx, Direction::In, EpStatus::Valid);
    }

    fn handle_ctr_tx(&mut self, handler: &mut impl EventHandler, ep_id: u8) {
        let regs = self.regs;
        let epr = regs.epr(ep_id as usize).read();
        let ep_num = epr.ea() as usize;
        let is_iso = epr.ep_type() == EpHwType::Iso as u8;

        regs.epr(ep_id as usize).write_value(epr.with_ctr_tx_cleared());

        if is_iso {
            let xfer = &mut self.xfer[ep_num][DIR_IN];
            if !xfer.iso_in_sending {
                // The host polled an empty endpoint; nothing of ours completed.
                return;
            }
            xfer.iso_in_sending = false;
            // The buffer just sent is the one the hardware moved away from;
            // zero its count so a stray poll cannot replay stale data.
            let sent_buf = if epr.dtog_tx() { 0 } else { 1 };
            self.pma.btable_set_count(ep_id, sent_buf, 0);
        }

        let (queued, total) = {
            let xfer = &self.xfer[ep_num][DIR_IN];
            (xfer.queued_len, xfer.total_len)
        };
        if queued < total {
            self.transmit_packet(ep_num);
        } else {
            handler.xfer_complete(EndpointAddress::from_parts(ep_num, Direction::In), queued as u32);
        }
    }

    fn handle_ctr_rx(&mut self, handler: &mut impl EventHandler, ep_id: u8) {
        errata_delay();

        let pma = self.pma;
        let regs = self.regs;
        let epr = regs.epr(ep_id as usize).read();

        if epr.setup() {
            // A SETUP is always exactly 8 bytes; anything else is line noise
            // and the host will retry.
            if pma.btable_get_count(ep_id, 1) == 8 {
                let mut setup = [0u8; 8];
                pma.read_buf(pma.btable_get_addr(ep_id, 1), &mut setup);
                regs.epr(ep_id as usize).write_value(epr.with_setup_handled());
                handler.setup_received(setup);
            } else {
                regs.epr(ep_id as usize).write_value(epr.with_ctr_rx_cleared());
            }
            return;
        }

        let ep_num = epr.ea() as usize;
        let is_iso = epr.ep_type() == EpHwType::Iso as u8;
        let buf_id = if is_iso {
            // The hardware just filled the buffer it is not pointed at anymore.
            if epr.dtog_rx() {
                0
            } else {
                1
            }
        } else {
            1
        };

        let count = pma.btable_get_count(ep_id, buf_id);
        let addr = pma.btable_get_addr(ep_id, buf_id);

        let (queued, total, max_packet) = {
            let xfer = &mut self.xfer[ep_num][DIR_OUT];
            if count > 0 {
                match xfer.buf {
                    XferBuf::Slice(p) => {
                        let dst = unsafe {
                            core::slice::from_raw_parts_mut(p.add(xfer.queued_len as usize), count as usize)
                        };
                        pma.read_buf(addr, dst);
                    }
                    XferBuf::Fifo(ff) => {
                        pma.read_fifo(addr, unsafe { &mut *ff }, count);
                    }
                    XferBuf::None => {}
                }
            }
            xfer.queued_len += count;
            (xfer.queued_len, xfer.total_len, xfer.max_packet_size)
        };

        // Short packet or everything received: the transfer is over. The
        // completion flag is acknowledged only after the data has been copied
        // out; clearing it earlier would let the next packet overwrite a
        // buffer still being read.
        if count < max_packet || queued >= total {
            if ep_num == 0 {
                // The control pipe is re-armed for whatever comes next before
                // the completion is released.
                pma.btable_set_rx_bufsize(ep_id, 1, EP0_SIZE);
            }
            regs.epr(ep_id as usize).write_value(epr.with_ctr_rx_cleared());
            handler.xfer_complete(EndpointAddress::from_parts(ep_num, Direction::Out), queued as u32);
        } else {
            let next = (total - queued).min(max_packet);
            pma.btable_set_rx_bufsize(ep_id, buf_id, next);
            regs.epr(ep_id as usize)
                .write_value(epr.with_stat_rx(EpStatus::Valid).and_clear_ctr_rx());
        }
    }
}

/// Reading the packet memory too soon after a completion returns stale data on
/// the 32-bit-bus parts; spin for ~800 ns before touching it.
#[cfg(feature = "bus-32bit")]
#[inline(always)]
fn errata_delay() {
    for _ in 0..60 {
        core::hint::spin_loop();
    }
}

#[cfg(not(feature = "bus-32bit"))]
#[inline(always)]
fn errata_delay() {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pma::PMA_ALLOC_BASE;

    struct FakeUsb {
        regs: [u16; 0x60 / 2],
        pma: [u16; 512],
    }

    impl FakeUsb {
        fn new() -> Self {
            Self {
                regs: [0; 0x60 / 2],
                pma: [0; 512],
            }
        }
        fn dcd(&mut self) -> Dcd {
            unsafe {
                Dcd::new(
                    UsbRegs::from_ptr(self.regs.as_mut_ptr() as *mut ()),
                    Pma::from_ptr(self.pma.as_mut_ptr() as *mut ()),
                )
            }
        }
        fn pma(&self) -> Pma {
            unsafe { Pma::from_ptr(self.pma.as_ptr() as *mut u16 as *mut ()) }
        }
        fn set_epr(&mut self, ep_id: usize, val: u16) {
            self.regs[ep_id * 2] = val;
        }
        fn epr(&self, ep_id: usize) -> u16 {
            self.regs[ep_id * 2]
        }
    }

    #[derive(Default)]
    struct Events {
        resets: usize,
        setups: Option<[u8; 8]>,
        completions: recorder::Completions,
        suspends: usize,
        resumes: usize,
        sofs: usize,
    }

    // A tiny fixed-capacity recorder, to keep the tests core-only.
    mod recorder {
        use embassy_usb_driver::EndpointAddress;
        #[derive(Default)]
        pub struct Completions {
            pub items: [(u8, u32); 8],
            pub len: usize,
        }
        impl Completions {
            pub fn push(&mut self, ep: EndpointAddress, len: u32) {
                self.items[self.len] = (u8::from(ep), len);
                self.len += 1;
            }
        }
    }

    impl EventHandler for Events {
        fn bus_reset(&mut self) {
            self.resets += 1;
        }
        fn setup_received(&mut self, setup: [u8; 8]) {
            self.setups = Some(setup);
        }
        fn xfer_complete(&mut self, ep_addr: EndpointAddress, len: u32) {
            self.completions.push(ep_addr, len);
        }
        fn sof(&mut self, _frame: u16) {
            self.sofs += 1;
        }
        fn suspend(&mut self) {
            self.suspends += 1;
        }
        fn resume(&mut self) {
            self.resumes += 1;
        }
    }

    struct NoDelay;
    impl embedded_hal::delay::DelayNs for NoDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }

    fn bulk_out(ep_num: u8, mps: u16) -> EndpointInfo {
        EndpointInfo {
            addr: EndpointAddress::from_parts(ep_num as usize, Direction::Out),
            ep_type: EndpointType::Bulk,
            max_packet_size: mps,
            interval_ms: 0,
        }
    }

    fn bulk_in(ep_num: u8, mps: u16) -> EndpointInfo {
        EndpointInfo {
            addr: EndpointAddress::from_parts(ep_num as usize, Direction::In),
            ep_type: EndpointType::Bulk,
            max_packet_size: mps,
            interval_ms: 0,
        }
    }

    #[test]
    fn init_lays_out_control_pipe() {
        let mut hw = FakeUsb::new();
        let mut dcd = hw.dcd();
        dcd.init(&mut NoDelay);
        let pma = hw.pma();
        // EP0 buffers sit right above the descriptor table, OUT first.
        assert_eq!(pma.btable_get_addr(0, 1), PMA_ALLOC_BASE);
        assert_eq!(pma.btable_get_addr(0, 0), PMA_ALLOC_BASE + EP0_SIZE);
        // Pull-up enabled.
        assert_eq!(hw.regs[0x58 / 2] & (1 << 15), 1 << 15);
    }

    #[test]
    fn open_pairs_directions_in_one_slot() {
        let mut hw = FakeUsb::new();
        let mut dcd = hw.dcd();
        dcd.init(&mut NoDelay);
        dcd.edpt_open(&bulk_out(1, 64));
        dcd.edpt_open(&bulk_in(1, 64));
        let pma = hw.pma();
        // Same slot (index 1), two buffers allocated back to back after EP0's.
        let ep0_end = PMA_ALLOC_BASE + 2 * EP0_SIZE;
        assert_eq!(pma.btable_get_addr(1, 1), ep0_end);
        assert_eq!(pma.btable_get_addr(1, 0), ep0_end + 64);
    }

    #[test]
    fn in_transfer_chunks_through_packet_memory() {
        let mut hw = FakeUsb::new();
        let mut dcd = hw.dcd();
        dcd.init(&mut NoDelay);
        dcd.edpt_open(&bulk_in(1, 64));

        let mut data = [0u8; 100];
        for (i, b) in data.iter_mut().enumerate() {
            *b = i as u8;
        }
        let ep_in = EndpointAddress::from_parts(1, Direction::In);
        unsafe { dcd.edpt_xfer(ep_in, data.as_mut_ptr(), 100) };

        let pma = hw.pma();
        assert_eq!(pma.btable_get_count(1, 0), 64);
        let mut first = [0u8; 64];
        pma.read_buf(pma.btable_get_addr(1, 0), &mut first);
        assert_eq!(&first[..], &data[..64]);

        // Completion of the first packet queues the remainder.
        hw.set_epr(1, Epr::CTR_TX | 1);
        let mut ev = Events::default();
        dcd.handle_ctr_tx(&mut ev, 1);
        assert_eq!(ev.completions.len, 0);
        assert_eq!(pma.btable_get_count(1, 0), 36);
        let mut second = [0u8; 36];
        pma.read_buf(pma.btable_get_addr(1, 0), &mut second);
        assert_eq!(&second[..], &data[64..]);

        // Completion of the last packet reports the whole transfer.
        hw.set_epr(1, Epr::CTR_TX | 1);
        dcd.handle_ctr_tx(&mut ev, 1);
        assert_eq!(ev.completions.len, 1);
        assert_eq!(ev.completions.items[0], (u8::from(ep_in), 100));
    }

    #[test]
    fn out_transfer_rearms_until_total_then_reports() {
        let mut hw = FakeUsb::new();
        let mut dcd = hw.dcd();
        dcd.init(&mut NoDelay);
        dcd.edpt_open(&bulk_out(2, 64));

        let mut buf = [0u8; 128];
        let ep_out = EndpointAddress::from_parts(2, Direction::Out);
        unsafe { dcd.edpt_xfer(ep_out, buf.as_mut_ptr(), 128) };

        let pma = hw.pma();
        let addr = pma.btable_get_addr(1, 1);

        // Host sends a full first packet.
        let chunk: [u8; 64] = core::array::from_fn(|i| i as u8);
        pma.write_buf(addr, &chunk);
        pma.btable_set_count(1, 1, 64);
        hw.set_epr(1, 2); // EA = 2, no SETUP
        let mut ev = Events::default();
        dcd.handle_ctr_rx(&mut ev, 1);
        assert_eq!(ev.completions.len, 0);

        // Second full packet finishes the transfer.
        pma.write_buf(addr, &chunk);
        pma.btable_set_count(1, 1, 64);
        hw.set_epr(1, 2);
        dcd.handle_ctr_rx(&mut ev, 1);
        assert_eq!(ev.completions.len, 1);
        assert_eq!(ev.completions.items[0], (u8::from(ep_out), 128));
        assert_eq!(&buf[..64], &chunk[..]);
        assert_eq!(&buf[64..], &chunk[..]);
    }

    #[test]
    fn short_out_packet_completes_early() {
        let mut hw = FakeUsb::new();
        let mut dcd = hw.dcd();
        dcd.init(&mut NoDelay);
        dcd.edpt_open(&bulk_out(2, 64));

        let mut buf = [0u8; 128];
        unsafe { dcd.edpt_xfer(EndpointAddress::from_parts(2, Direction::Out), buf.as_mut_ptr(), 128) };

        let pma = hw.pma();
        pma.write_buf(pma.btable_get_addr(1, 1), &[9, 9, 9]);
        pma.btable_set_count(1, 1, 3);
        hw.set_epr(1, 2);
        let mut ev = Events::default();
        dcd.handle_ctr_rx(&mut ev, 1);
        assert_eq!(ev.completions.len, 1);
        assert_eq!(ev.completions.items[0].1, 3);
        assert_eq!(&buf[..3], &[9, 9, 9]);
    }

    #[test]
    fn setup_of_eight_bytes_is_reported() {
        let mut hw = FakeUsb::new();
        let mut dcd = hw.dcd();
        dcd.init(&mut NoDelay);

        let pma = hw.pma();
        let setup = [0x80u8, 0x06, 0, 1, 0, 0, 0x40, 0];
        pma.write_buf(pma.btable_get_addr(0, 1), &setup);
        pma.btable_set_count(0, 1, 8);
        hw.set_epr(0, Epr::SETUP | Epr::CTR_RX);
        let mut ev = Events::default();
        dcd.handle_ctr_rx(&mut ev, 0);
        assert_eq!(ev.setups, Some(setup));
    }

    #[test]
    fn runt_setup_is_ignored() {
        let mut hw = FakeUsb::new();
        let mut dcd = hw.dcd();
        dcd.init(&mut NoDelay);

        let pma = hw.pma();
        pma.btable_set_count(0, 1, 6);
        hw.set_epr(0, Epr::SETUP | Epr::CTR_RX);
        let mut ev = Events::default();
        dcd.handle_ctr_rx(&mut ev, 0);
        assert_eq!(ev.setups, None);
    }

    #[test]
    fn reset_interrupt_rebuilds_and_reports() {
        let mut hw = FakeUsb::new();
        let mut dcd = hw.dcd();
        dcd.init(&mut NoDelay);
        dcd.edpt_open(&bulk_out(1, 64));

        hw.regs[0x44 / 2] = Istr::RESET;
        let mut ev = Events::default();
        dcd.handle_interrupt(&mut ev);
        assert_eq!(ev.resets, 1);
        // Packet memory above EP0 is reclaimed: the next open lands where the
        // first one used to.
        dcd.edpt_open(&bulk_out(3, 64));
        assert_eq!(hw.pma().btable_get_addr(1, 1), PMA_ALLOC_BASE + 2 * EP0_SIZE);
    }

    #[test]
    fn iso_in_spurious_completion_is_ignored() {
        let mut hw = FakeUsb::new();
        let mut dcd = hw.dcd();
        dcd.init(&mut NoDelay);

        let ep = EndpointAddress::from_parts(3, Direction::In);
        dcd.edpt_iso_alloc(ep, 64);
        dcd.edpt_iso_activate(&EndpointInfo {
            addr: ep,
            ep_type: EndpointType::Isochronous,
            max_packet_size: 64,
            interval_ms: 1,
        });

        // Host polls while nothing is queued: no completion may surface.
        hw.set_epr(1, Epr::CTR_TX | (EpHwType::Iso as u16) << 9 | 3);
        let mut ev = Events::default();
        dcd.handle_ctr_tx(&mut ev, 1);
        assert_eq!(ev.completions.len, 0);

        // A queued buffer, however, completes normally.
        let mut data = [0xAAu8; 32];
        unsafe { dcd.edpt_xfer(ep, data.as_mut_ptr(), 32) };
        hw.set_epr(1, Epr::CTR_TX | (EpHwType::Iso as u16) << 9 | 3);
        dcd.handle_ctr_tx(&mut ev, 1);
        assert_eq!(ev.completions.len, 1);
        assert_eq!(ev.completions.items[0], (u8::from(ep), 32));
    }

    #[test]
    fn suspend_resume_paths() {
        let mut hw = FakeUsb::new();
        let mut dcd = hw.dcd();
        dcd.init(&mut NoDelay);

        hw.regs[0x44 / 2] = Istr::SUSP;
        let mut ev = Events::default();
        dcd.handle_interrupt(&mut ev);
        assert_eq!(ev.suspends, 1);

        hw.regs[0x44 / 2] = Istr::WKUP;
        dcd.handle_interrupt(&mut ev);
        assert_eq!(ev.resumes, 1);
    }
}
