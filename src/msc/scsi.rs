//! SCSI wire structures and constants for the storage class.
//!
//! Command descriptor blocks carry multi-byte fields big-endian; the transport
//! wrappers (CBW/CSW) are little-endian. Everything here is plain parsing and
//! serialization, kept separate from the protocol state machine.

/// SCSI operation codes handled by the built-in processor.
pub const CMD_TEST_UNIT_READY: u8 = 0x00;
pub const CMD_REQUEST_SENSE: u8 = 0x03;
pub const CMD_INQUIRY: u8 = 0x12;
pub const CMD_MODE_SENSE_6: u8 = 0x1A;
pub const CMD_START_STOP_UNIT: u8 = 0x1B;
pub const CMD_PREVENT_ALLOW_MEDIUM_REMOVAL: u8 = 0x1E;
pub const CMD_READ_FORMAT_CAPACITY: u8 = 0x23;
pub const CMD_READ_CAPACITY_10: u8 = 0x25;
pub const CMD_READ_10: u8 = 0x28;
pub const CMD_WRITE_10: u8 = 0x2A;

/// Sense keys used by the driver.
pub const SENSE_KEY_NOT_READY: u8 = 0x02;
pub const SENSE_KEY_ILLEGAL_REQUEST: u8 = 0x05;
pub const SENSE_KEY_DATA_PROTECT: u8 = 0x07;

pub const CBW_SIGNATURE: u32 = 0x4342_5355;
pub const CSW_SIGNATURE: u32 = 0x5342_5355;
pub const CBW_LEN: usize = 31;
pub const CSW_LEN: usize = 13;

/// Direction bit of `bmCBWFlags`.
const CBW_DIR_IN: u8 = 0x80;

/// Sense triple reported through REQUEST_SENSE. A zero key means no error is
/// pending.
#[derive(Copy, Clone, Default, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Sense {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
}

impl Sense {
    pub const fn new(key: u8, asc: u8, ascq: u8) -> Self {
        Self { key, asc, ascq }
    }

    pub const fn is_set(&self) -> bool {
        self.key != 0
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Command Block Wrapper, the host's 31-byte request framing.
#[derive(Copy, Clone, Default, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Cbw {
    pub signature: u32,
    pub tag: u32,
    pub total_bytes: u32,
    pub flags: u8,
    pub lun: u8,
    pub cmd_len: u8,
    pub command: [u8; 16],
}

impl Cbw {
    pub fn parse(raw: &[u8; CBW_LEN]) -> Self {
        let mut command = [0u8; 16];
        command.copy_from_slice(&raw[15..31]);
        Self {
            signature: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            tag: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            total_bytes: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            flags: raw[12],
            lun: raw[13] & 0x0f,
            cmd_len: raw[14] & 0x1f,
            command,
        }
    }

    /// Host expects data from the device.
    pub const fn is_in(&self) -> bool {
        self.flags & CBW_DIR_IN != 0
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum CswStatus {
    Passed = 0,
    Failed = 1,
    PhaseError = 2,
}

impl Default for CswStatus {
    fn default() -> Self {
        CswStatus::Passed
    }
}

/// Command Status Wrapper, the device's 13-byte response framing.
#[derive(Copy, Clone, Default, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Csw {
    pub tag: u32,
    pub data_residue: u32,
    pub status: CswStatus,
}

impl Csw {
    pub fn to_bytes(&self) -> [u8; CSW_LEN] {
        let mut out = [0u8; CSW_LEN];
        out[0..4].copy_from_slice(&CSW_SIGNATURE.to_le_bytes());
        out[4..8].copy_from_slice(&self.tag.to_le_bytes());
        out[8..12].copy_from_slice(&self.data_residue.to_le_bytes());
        out[12] = self.status as u8;
        out
    }
}

/// Logical block address of a READ(10)/WRITE(10) command.
pub fn rdwr10_lba(cdb: &[u8; 16]) -> u32 {
    u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]])
}

/// Transfer length in blocks of a READ(10)/WRITE(10) command.
pub fn rdwr10_block_count(cdb: &[u8; 16]) -> u16 {
    u16::from_be_bytes([cdb[7], cdb[8]])
}

/// Vendor / product / revision strings reported by INQUIRY.
#[derive(Copy, Clone)]
pub struct InquiryData {
    pub vendor_id: [u8; 8],
    pub product_id: [u8; 16],
    pub product_rev: [u8; 4],
}

impl Default for InquiryData {
    fn default() -> Self {
        Self {
            vendor_id: [b' '; 8],
            product_id: [b' '; 16],
            product_rev: [b' '; 4],
        }
    }
}

/// Standard 36-byte INQUIRY response for a removable direct-access device.
pub fn inquiry_response(data: &InquiryData) -> [u8; 36] {
    let mut out = [0u8; 36];
    out[1] = 0x80; // removable medium
    out[2] = 0x02; // SPC-2 compliance claimed
    out[3] = 0x02; // response data format
    out[4] = 36 - 5; // additional length
    out[8..16].copy_from_slice(&data.vendor_id);
    out[16..32].copy_from_slice(&data.product_id);
    out[32..36].copy_from_slice(&data.product_rev);
    out
}

/// READ CAPACITY (10): highest addressable block and the block length,
/// big-endian.
pub fn read_capacity10_response(block_count: u32, block_size: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0..4].copy_from_slice(&(block_count - 1).to_be_bytes());
    out[4..8].copy_from_slice(&block_size.to_be_bytes());
    out
}

/// READ FORMAT CAPACITIES: one current-capacity descriptor flagged as
/// formatted media.
pub fn read_format_capacity_response(block_count: u32, block_size: u16) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[3] = 8; // capacity list length
    out[4..8].copy_from_slice(&block_count.to_be_bytes());
    out[8] = 0x02; // formatted media
    out[10..12].copy_from_slice(&block_size.to_be_bytes());
    out
}

/// MODE SENSE (6) header with no mode pages; only the write-protect bit is
/// meaningful.
pub fn mode_sense6_response(write_protected: bool) -> [u8; 4] {
    [3, 0, if write_protected { 0x80 } else { 0 }, 0]
}

/// Fixed-format sense data carrying the current sense triple.
pub fn request_sense_response(sense: Sense) -> [u8; 18] {
    let mut out = [0u8; 18];
    out[0] = 0x70 | 0x80; // current error, valid
    out[2] = sense.key & 0x0f;
    out[7] = 18 - 8; // additional sense length
    out[12] = sense.asc;
    out[13] = sense.ascq;
    out
}
