//! Bulk-Only Transport protocol engine.
//!
//! One instance drives one storage interface: it owns the staging buffer, the
//! current command/status wrappers and the stage of the Command → Data →
//! Status cycle, and it resolves the mismatch cases between what the host
//! announced in the CBW and what the device actually produces.

use embassy_usb_driver::{EndpointAddress, EndpointInfo, EndpointType};

use super::scsi::*;
use super::{CLASS_MSC, PROTOCOL_BOT, REQ_GET_MAX_LUN, REQ_RESET, SUBCLASS_SCSI};
use crate::usbd::{
    ControlRequest, ControlStage, DeferredEvent, Recipient, RequestType, Transfer, UsbdBus,
    DESC_TYPE_ENDPOINT, DESC_TYPE_INTERFACE, FEATURE_ENDPOINT_HALT, REQUEST_CLEAR_FEATURE,
};

/// Result of an application block-I/O callback.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IoResult {
    /// Bytes produced (read) or consumed (write).
    Bytes(u32),
    /// Not ready yet; the driver re-polls via a deferred event.
    Busy,
    /// The operation failed; sense is set to "medium not present" unless the
    /// application already reported something more specific.
    Error,
    /// The application completes later through
    /// [`MscClass::async_io_done`].
    Async,
}

/// Application side of the storage interface.
///
/// `inquiry`, `capacity`, `read10` and `write10` are the required surface;
/// everything else has a workable default.
pub trait MscHandler {
    /// Fill in the identification strings reported by INQUIRY.
    fn inquiry(&mut self, lun: u8, data: &mut InquiryData);

    /// Capacity as `(block_count, block_size)`. Zeroes mean no medium.
    fn capacity(&mut self, lun: u8) -> (u32, u16);

    /// `offset` is the byte position inside the block at `lba` where this
    /// chunk starts.
    fn read10(&mut self, lun: u8, lba: u32, offset: u32, buf: &mut [u8]) -> IoResult;

    fn write10(&mut self, lun: u8, lba: u32, offset: u32, buf: &[u8]) -> IoResult;

    fn test_unit_ready(&mut self, lun: u8) -> bool {
        let _ = lun;
        true
    }

    fn is_writable(&mut self, lun: u8) -> bool {
        let _ = lun;
        true
    }

    fn start_stop(&mut self, lun: u8, power_condition: u8, start: bool, load_eject: bool) -> bool {
        let _ = (lun, power_condition, start, load_eject);
        true
    }

    fn prevent_allow_medium_removal(&mut self, lun: u8, prohibit_removal: bool) -> bool {
        let _ = (lun, prohibit_removal);
        true
    }

    /// Number of logical units, at least 1.
    fn max_lun(&mut self) -> u8 {
        1
    }

    /// Take over the whole 36-byte INQUIRY response. Return 0 to fall back to
    /// the vendor/product/revision triple from [`Self::inquiry`].
    fn inquiry_full(&mut self, lun: u8, response: &mut [u8; 36]) -> usize {
        let _ = (lun, response);
        0
    }

    /// Override the REQUEST_SENSE response. `None` uses the fixed-format
    /// response built from the driver's sense state.
    fn request_sense(&mut self, lun: u8, buf: &mut [u8]) -> Option<usize> {
        let _ = (lun, buf);
        None
    }

    /// Catch-all for commands without a built-in handler. For data-in commands
    /// fill `buf` and return the length; data-out commands get the received
    /// payload in `buf`.
    fn scsi_command(&mut self, lun: u8, cdb: &[u8; 16], buf: &mut [u8]) -> IoResult {
        let _ = (lun, cdb, buf);
        IoResult::Error
    }

    /// Invoked after the status for a command went out on the wire.
    fn command_complete(&mut self, lun: u8, cdb: &[u8; 16]) {
        let _ = (lun, cdb);
    }
}

/// Protocol stage of the interface.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Stage {
    /// Waiting for a command wrapper.
    Cmd,
    /// Streaming the data phase.
    Data,
    /// Data done; status wrapper not yet queued.
    Status,
    /// Status wrapper queued on the IN endpoint.
    StatusSent,
    /// Protocol violation; only a Bulk-Only reset recovers.
    NeedReset,
}

/// One Bulk-Only Transport storage interface.
///
/// `BUF_SIZE` is the staging buffer, at least 64 bytes and ideally one block:
/// large transfers are streamed through it one chunk at a time.
pub struct MscClass<H: MscHandler, const BUF_SIZE: usize = 512> {
    handler: H,
    stage: Stage,
    cbw: Cbw,
    csw: Csw,
    itf_num: u8,
    ep_in: EndpointAddress,
    ep_out: EndpointAddress,
    /// Length of the current data phase (host expectation, possibly clamped
    /// to what the device will actually produce).
    total_len: u32,
    xferred_len: u32,
    sense: Sense,
    pending_io: bool,
    /// Transfer size handed to the application when it went asynchronous.
    pending_io_bytes: u32,
    buf: [u8; BUF_SIZE],
}

impl<H: MscHandler, const BUF_SIZE: usize> MscClass<H, BUF_SIZE> {
    pub fn new(handler: H) -> Self {
        assert!(BUF_SIZE >= 64, "staging buffer too small for command framing");
        Self {
            handler,
            stage: Stage::Cmd,
            cbw: Cbw::default(),
            csw: Csw::default(),
            itf_num: 0,
            ep_in: EndpointAddress::from(0),
            ep_out: EndpointAddress::from(0),
            total_len: 0,
            xferred_len: 0,
            sense: Sense::default(),
            pending_io: false,
            pending_io_bytes: 0,
            buf: [0; BUF_SIZE],
        }
    }

    pub fn handler(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn sense(&self) -> Sense {
        self.sense
    }

    /// Staging buffer access for applications that answered an I/O callback
    /// with [`IoResult::Async`]: a pending read is completed by filling it, a
    /// pending write can consume from it. Call [`Self::async_io_done`] when
    /// finished. Valid until the next event reaches the interface.
    pub fn io_buffer(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Clear all protocol state, e.g. on bus reset.
    pub fn reset(&mut self) {
        self.stage = Stage::Cmd;
        self.cbw = Cbw::default();
        self.csw = Csw::default();
        self.itf_num = 0;
        self.ep_in = EndpointAddress::from(0);
        self.ep_out = EndpointAddress::from(0);
        self.total_len = 0;
        self.xferred_len = 0;
        self.sense.clear();
        self.pending_io = false;
        self.pending_io_bytes = 0;
    }

    /// Claim a storage interface from a configuration descriptor fragment.
    /// Returns the number of descriptor bytes consumed, 0 if the interface is
    /// not ours.
    pub fn open(&mut self, bus: &mut impl UsbdBus, desc: &[u8]) -> usize {
        if desc.len() < 9 + 2 * 7
            || desc[1] != DESC_TYPE_INTERFACE
            || desc[4] != 2
            || desc[5] != CLASS_MSC
            || desc[6] != SUBCLASS_SCSI
            || desc[7] != PROTOCOL_BOT
        {
            return 0;
        }
        self.itf_num = desc[2];

        let mut offset = 9;
        for _ in 0..2 {
            let ep = &desc[offset..];
            if ep[0] < 7 || ep[1] != DESC_TYPE_ENDPOINT || ep[3] & 0x03 != EndpointType::Bulk as u8 {
                return 0;
            }
            let info = EndpointInfo {
                addr: EndpointAddress::from(ep[2]),
                ep_type: EndpointType::Bulk,
                max_packet_size: u16::from_le_bytes([ep[4], ep[5]]),
                interval_ms: 0,
            };
            bus.edpt_open(&info);
            if info.addr.is_in() {
                self.ep_in = info.addr;
            } else {
                self.ep_out = info.addr;
            }
            offset += ep[0] as usize;
        }

        info!("msc: interface {} claimed", self.itf_num);
        self.prepare_cbw(bus);
        offset
    }

    /// Class and recovery requests on the control pipe. Returns false for
    /// requests this interface does not handle.
    pub fn control_xfer(&mut self, bus: &mut impl UsbdBus, stage: ControlStage, req: &ControlRequest) -> bool {
        // Clear-Feature(ENDPOINT_HALT) doubles as the recovery signal of the
        // transport; act once the halt is actually gone.
        if req.kind() == RequestType::Standard
            && req.recipient() == Recipient::Endpoint
            && req.request == REQUEST_CLEAR_FEATURE
            && req.value == FEATURE_ENDPOINT_HALT
        {
            if stage == ControlStage::Ack {
                let ep_addr = EndpointAddress::from(req.index as u8);
                if self.stage == Stage::NeedReset {
                    // Only a Bulk-Only reset unlocks the interface.
                    bus.edpt_stall(ep_addr);
                } else if ep_addr == self.ep_in {
                    if self.stage == Stage::Status {
                        self.send_csw(bus);
                    }
                } else if ep_addr == self.ep_out {
                    if self.stage == Stage::Cmd && bus.edpt_ready(ep_addr) {
                        self.prepare_cbw(bus);
                    }
                }
            }
            return true;
        }

        if req.kind() != RequestType::Class || req.recipient() != Recipient::Interface {
            return false;
        }

        match req.request {
            REQ_RESET => {
                if req.value != 0 || req.length != 0 {
                    return false;
                }
                match stage {
                    ControlStage::Setup => {
                        bus.control_respond(req, &[]);
                    }
                    ControlStage::Ack => {
                        debug!("msc: bulk-only reset");
                        self.stage = Stage::Cmd;
                        self.sense.clear();
                        self.total_len = 0;
                        self.xferred_len = 0;
                        self.pending_io = false;
                        // Endpoints stay halted until the host clears them.
                    }
                    ControlStage::Data => {}
                }
                true
            }
            REQ_GET_MAX_LUN => {
                if req.value != 0 || req.length != 1 {
                    return false;
                }
                if stage == ControlStage::Setup {
                    let luns = self.handler.max_lun();
                    if luns == 0 {
                        return false;
                    }
                    bus.control_respond(req, &[luns - 1]);
                }
                true
            }
            _ => false,
        }
    }

    /// Bulk endpoint completion entry, called by the device core for every
    /// finished transfer on our endpoints.
    pub fn xfer_complete(&mut self, bus: &mut impl UsbdBus, ep_addr: EndpointAddress, xfer: Transfer<'_>) -> bool {
        let bytes = match xfer {
            Transfer::In { len } => len,
            Transfer::Out { data } => {
                let n = data.len().min(BUF_SIZE);
                self.buf[..n].copy_from_slice(&data[..n]);
                n as u32
            }
        };
        self.process_event(bus, ep_addr, bytes)
    }

    /// Deferred-event entry: replays from task context what could not be done
    /// inline (busy polls, partial writes, asynchronous completions).
    pub fn on_deferred(&mut self, bus: &mut impl UsbdBus, event: DeferredEvent) {
        match event {
            DeferredEvent::Retry { ep_addr, bytes } => {
                self.process_event(bus, ep_addr, bytes);
            }
            DeferredEvent::IoDone { bytes } => {
                if !self.pending_io {
                    // The interface was reset while the I/O was in flight.
                    return;
                }
                self.pending_io = false;
                let result = if bytes < 0 {
                    IoResult::Error
                } else {
                    IoResult::Bytes(bytes as u32)
                };
                match self.cbw.command[0] {
                    CMD_READ_10 => self.read10_result(bus, result),
                    CMD_WRITE_10 => {
                        let xfer_bytes = self.pending_io_bytes;
                        self.write10_result(bus, result, xfer_bytes);
                    }
                    _ => {}
                }
                if self.stage == Stage::Status && !self.pending_io {
                    self.finish_data(bus);
                }
            }
        }
    }

    /// Application-side completion of an [`IoResult::Async`] operation.
    /// `bytes` follows the callback convention (negative = error). Safe from
    /// interrupt context; the continuation runs on the device task.
    pub fn async_io_done(&mut self, bus: &mut impl UsbdBus, bytes: i32, in_isr: bool) {
        bus.defer(DeferredEvent::IoDone { bytes }, in_isr);
    }

    // ------------------------------------------------------------------
    // stage machinery

    fn process_event(&mut self, bus: &mut impl UsbdBus, ep_addr: EndpointAddress, bytes: u32) -> bool {
        match self.stage {
            Stage::Cmd => {
                if ep_addr != self.ep_out {
                    return false;
                }
                let signature = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
                if bytes as usize != CBW_LEN || signature != CBW_SIGNATURE {
                    error!("msc: malformed command wrapper, halting interface");
                    self.stage = Stage::NeedReset;
                    bus.edpt_stall(self.ep_in);
                    bus.edpt_stall(self.ep_out);
                    return false;
                }
                let mut raw = [0u8; CBW_LEN];
                raw.copy_from_slice(&self.buf[..CBW_LEN]);
                self.cbw = Cbw::parse(&raw);
                self.new_command(bus);
            }
            Stage::Data => self.data_complete(bus, bytes),
            Stage::Status => {}
            Stage::StatusSent => {
                if ep_addr == self.ep_in {
                    let lun = self.cbw.lun;
                    let cdb = self.cbw.command;
                    self.handler.command_complete(lun, &cdb);
                    self.prepare_cbw(bus);
                }
            }
            Stage::NeedReset => {}
        }

        if self.stage == Stage::Status && !self.pending_io {
            self.finish_data(bus);
        }
        true
    }

    /// Dispatch a freshly received command wrapper.
    fn new_command(&mut self, bus: &mut impl UsbdBus) {
        self.total_len = self.cbw.total_bytes;
        self.xferred_len = 0;
        self.stage = Stage::Data;
        self.csw = Csw {
            tag: self.cbw.tag,
            data_residue: 0,
            status: CswStatus::Passed,
        };
        trace!("msc: command {} tag {}", self.cbw.command[0], self.cbw.tag);

        let cmd = self.cbw.command[0];
        match cmd {
            CMD_READ_10 | CMD_WRITE_10 => match self.rdwr10_validate() {
                Err(status) => self.fail_op(bus, status),
                Ok(false) => self.stage = Stage::Status,
                Ok(true) => {
                    if cmd == CMD_WRITE_10 && !self.handler.is_writable(self.cbw.lun) {
                        self.sense = Sense::new(SENSE_KEY_DATA_PROTECT, 0x27, 0x00);
                        self.fail_op(bus, CswStatus::Failed);
                    } else if cmd == CMD_READ_10 {
                        self.proc_read10(bus);
                    } else {
                        let nbytes = (self.total_len - self.xferred_len).min(BUF_SIZE as u32);
                        bus.edpt_xfer_out(self.ep_out, nbytes);
                    }
                }
            },
            _ => {
                if self.cbw.total_bytes > 0 && !self.cbw.is_in() {
                    // Generic command with host data: take it all in one
                    // transfer, then hand it to the application.
                    if self.cbw.total_bytes as usize > BUF_SIZE {
                        warn!("msc: data-out command exceeds the staging buffer");
                        self.fail_op(bus, CswStatus::Failed);
                    } else {
                        bus.edpt_xfer_out(self.ep_out, self.cbw.total_bytes);
                    }
                } else {
                    match self.proc_builtin() {
                        Err(()) => self.fail_op(bus, CswStatus::Failed),
                        Ok(0) => {
                            if self.cbw.total_bytes > 0 {
                                // Host expects data, device has none.
                                self.fail_op(bus, CswStatus::Failed);
                            } else {
                                self.stage = Stage::Status;
                            }
                        }
                        Ok(resplen) => {
                            if self.cbw.total_bytes == 0 {
                                // Device produced data the host never asked for.
                                self.fail_op(bus, CswStatus::PhaseError);
                            } else {
                                let n = (resplen as u32).min(self.cbw.total_bytes);
                                self.total_len = n;
                                bus.edpt_xfer_in(self.ep_in, &self.buf[..n as usize]);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Check a READ(10)/WRITE(10) against the wrapper's announced transfer.
    /// `Ok(false)` means a well-formed command with no data phase.
    fn rdwr10_validate(&self) -> Result<bool, CswStatus> {
        let block_count = rdwr10_block_count(&self.cbw.command) as u32;
        if self.cbw.total_bytes == 0 {
            if block_count > 0 {
                // Host announced no transfer but the command carries one.
                return Err(CswStatus::PhaseError);
            }
            return Ok(false);
        }
        let is_read = self.cbw.command[0] == CMD_READ_10;
        if is_read != self.cbw.is_in() {
            return Err(CswStatus::PhaseError);
        }
        if block_count == 0 {
            return Err(CswStatus::Failed);
        }
        if self.cbw.total_bytes / block_count == 0 {
            // Announced bytes smaller than the block count: no usable block
            // size can be derived.
            return Err(CswStatus::PhaseError);
        }
        Ok(true)
    }

    /// Block size derived from the wrapper; only meaningful after
    /// [`Self::rdwr10_validate`] accepted the command.
    fn block_size(&self) -> u32 {
        self.cbw.total_bytes / rdwr10_block_count(&self.cbw.command) as u32
    }

    fn data_complete(&mut self, bus: &mut impl UsbdBus, bytes: u32) {
        match self.cbw.command[0] {
            CMD_READ_10 => {
                self.xferred_len += bytes;
                if self.xferred_len >= self.total_len {
                    self.stage = Stage::Status;
                } else {
                    self.proc_read10(bus);
                }
            }
            CMD_WRITE_10 => self.write10_data(bus, bytes),
            _ => {
                self.xferred_len += bytes;
                if !self.cbw.is_in() {
                    let lun = self.cbw.lun;
                    let cdb = self.cbw.command;
                    if let IoResult::Error = self.handler.scsi_command(lun, &cdb, &mut self.buf[..bytes as usize]) {
                        self.fail_op(bus, CswStatus::Failed);
                        return;
                    }
                }
                self.stage = Stage::Status;
            }
        }
    }

    /// One chunk of the READ(10) stream: ask the application for the next
    /// piece and act on its answer.
    fn proc_read10(&mut self, bus: &mut impl UsbdBus) {
        let block_size = self.block_size();
        let lba = rdwr10_lba(&self.cbw.command) + self.xferred_len / block_size;
        let offset = self.xferred_len % block_size;
        let nbytes = (self.total_len - self.xferred_len).min(BUF_SIZE as u32);
        let lun = self.cbw.lun;
        let result = self.handler.read10(lun, lba, offset, &mut self.buf[..nbytes as usize]);
        self.read10_result(bus, result);
    }

    fn read10_result(&mut self, bus: &mut impl UsbdBus, result: IoResult) {
        match result {
            IoResult::Bytes(0) | IoResult::Busy => {
                // Re-poll later; a zero-length synthetic completion loops the
                // data stage without touching the wire.
                bus.defer(
                    DeferredEvent::Retry {
                        ep_addr: self.ep_in,
                        bytes: 0,
                    },
                    false,
                );
            }
            IoResult::Bytes(n) => {
                let n = n.min((self.total_len - self.xferred_len).min(BUF_SIZE as u32));
                bus.edpt_xfer_in(self.ep_in, &self.buf[..n as usize]);
            }
            IoResult::Error => {
                if !self.sense.is_set() {
                    self.sense = Sense::new(SENSE_KEY_NOT_READY, 0x3A, 0x00);
                }
                self.fail_op(bus, CswStatus::Failed);
            }
            IoResult::Async => self.pending_io = true,
        }
    }

    /// Host data for the WRITE(10) stream has landed in the staging buffer.
    fn write10_data(&mut self, bus: &mut impl UsbdBus, bytes: u32) {
        let block_size = self.block_size();
        let lba = rdwr10_lba(&self.cbw.command) + self.xferred_len / block_size;
        let offset = self.xferred_len % block_size;
        let lun = self.cbw.lun;
        let result = self.handler.write10(lun, lba, offset, &self.buf[..bytes as usize]);
        self.write10_result(bus, result, bytes);
    }

    fn write10_result(&mut self, bus: &mut impl UsbdBus, result: IoResult, xfer_bytes: u32) {
        match result {
            IoResult::Bytes(0) | IoResult::Busy => {
                // Not consumed; replay the same payload later.
                bus.defer(
                    DeferredEvent::Retry {
                        ep_addr: self.ep_out,
                        bytes: xfer_bytes,
                    },
                    false,
                );
            }
            IoResult::Bytes(n) => {
                let n = n.min(xfer_bytes);
                self.xferred_len += n;
                if n < xfer_bytes {
                    // Partially consumed: shift the remainder down and replay
                    // with the reduced count.
                    let (taken, end) = (n as usize, xfer_bytes as usize);
                    self.buf.copy_within(taken..end, 0);
                    bus.defer(
                        DeferredEvent::Retry {
                            ep_addr: self.ep_out,
                            bytes: xfer_bytes - n,
                        },
                        false,
                    );
                } else if self.xferred_len >= self.total_len {
                    self.stage = Stage::Status;
                } else {
                    let nbytes = (self.total_len - self.xferred_len).min(BUF_SIZE as u32);
                    bus.edpt_xfer_out(self.ep_out, nbytes);
                }
            }
            IoResult::Error => {
                if !self.sense.is_set() {
                    self.sense = Sense::new(SENSE_KEY_NOT_READY, 0x3A, 0x00);
                }
                self.fail_op(bus, CswStatus::Failed);
            }
            IoResult::Async => {
                self.pending_io = true;
                self.pending_io_bytes = xfer_bytes;
            }
        }
    }

    /// Built-in command processor. Returns the response length placed in the
    /// staging buffer; `Err` marks an unsupported or failed command.
    fn proc_builtin(&mut self) -> Result<usize, ()> {
        let lun = self.cbw.lun;
        let cdb = self.cbw.command;
        match cdb[0] {
            CMD_TEST_UNIT_READY => {
                if self.handler.test_unit_ready(lun) {
                    Ok(0)
                } else {
                    self.sense_not_ready();
                    Err(())
                }
            }
            CMD_START_STOP_UNIT => {
                let power_condition = cdb[4] >> 4;
                let start = cdb[4] & 0x01 != 0;
                let load_eject = cdb[4] & 0x02 != 0;
                if self.handler.start_stop(lun, power_condition, start, load_eject) {
                    Ok(0)
                } else {
                    self.sense_not_ready();
                    Err(())
                }
            }
            CMD_PREVENT_ALLOW_MEDIUM_REMOVAL => {
                let prohibit = cdb[4] & 0x01 != 0;
                if self.handler.prevent_allow_medium_removal(lun, prohibit) {
                    Ok(0)
                } else {
                    self.sense_not_ready();
                    Err(())
                }
            }
            CMD_READ_CAPACITY_10 => {
                let (block_count, block_size) = self.handler.capacity(lun);
                if block_count == 0 || block_size == 0 {
                    self.sense_not_ready();
                    Err(())
                } else {
                    self.buf[..8].copy_from_slice(&read_capacity10_response(block_count, block_size as u32));
                    Ok(8)
                }
            }
            CMD_READ_FORMAT_CAPACITY => {
                let (block_count, block_size) = self.handler.capacity(lun);
                if block_count == 0 || block_size == 0 {
                    self.sense_not_ready();
                    Err(())
                } else {
                    self.buf[..12].copy_from_slice(&read_format_capacity_response(block_count, block_size));
                    Ok(12)
                }
            }
            CMD_INQUIRY => {
                let Some(response) = self.buf.first_chunk_mut::<36>() else {
                    return Err(());
                };
                let n = self.handler.inquiry_full(lun, response);
                if n > 0 {
                    return Ok(n.min(36));
                }
                let mut data = InquiryData::default();
                self.handler.inquiry(lun, &mut data);
                *response = inquiry_response(&data);
                Ok(36)
            }
            CMD_MODE_SENSE_6 => {
                let write_protected = !self.handler.is_writable(lun);
                self.buf[..4].copy_from_slice(&mode_sense6_response(write_protected));
                Ok(4)
            }
            CMD_REQUEST_SENSE => {
                let n = match self.handler.request_sense(lun, &mut self.buf) {
                    Some(n) => n,
                    None => {
                        self.buf[..18].copy_from_slice(&request_sense_response(self.sense));
                        18
                    }
                };
                // Reading the sense consumes it.
                self.sense.clear();
                Ok(n)
            }
            _ => match self.handler.scsi_command(lun, &cdb, &mut self.buf) {
                IoResult::Bytes(n) => Ok(n as usize),
                _ => Err(()),
            },
        }
    }

    fn sense_not_ready(&mut self) {
        if !self.sense.is_set() {
            self.sense = Sense::new(SENSE_KEY_NOT_READY, 0x3A, 0x00);
        }
    }

    /// Terminate the command with `status`. A data phase that never finished
    /// leaves its endpoint stalled so the host stops waiting on it.
    fn fail_op(&mut self, bus: &mut impl UsbdBus, status: CswStatus) {
        self.csw.status = status;
        self.stage = Stage::Status;
        if !self.sense.is_set() {
            self.sense = Sense::new(SENSE_KEY_ILLEGAL_REQUEST, 0x20, 0x00);
        }
        if self.cbw.total_bytes > 0 && self.xferred_len < self.cbw.total_bytes {
            if self.cbw.is_in() {
                bus.edpt_stall(self.ep_in);
            } else {
                bus.edpt_stall(self.ep_out);
            }
        }
    }

    /// The data phase is over: stall short IN transfers, otherwise queue the
    /// status wrapper.
    fn finish_data(&mut self, bus: &mut impl UsbdBus) {
        if bus.edpt_stalled(self.ep_in) {
            // The wrapper goes out once the host clears the halt.
            return;
        }
        if self.cbw.is_in() && self.xferred_len < self.cbw.total_bytes {
            bus.edpt_stall(self.ep_in);
        } else {
            self.send_csw(bus);
        }
    }

    fn send_csw(&mut self, bus: &mut impl UsbdBus) {
        self.stage = Stage::StatusSent;
        self.csw.data_residue = self.cbw.total_bytes - self.xferred_len;
        let raw = self.csw.to_bytes();
        bus.edpt_xfer_in(self.ep_in, &raw);
    }

    fn prepare_cbw(&mut self, bus: &mut impl UsbdBus) {
        self.stage = Stage::Cmd;
        bus.edpt_xfer_out(self.ep_out, CBW_LEN as u32);
    }
}
