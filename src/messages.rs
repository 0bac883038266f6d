//! Encoders and decoders for the bulk data exchange message family.
//!
//! Every message here is a payload carried over an already established
//! exchange; the carrier's header is represented only by its
//! [MessageTypeData] tag pair.

use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use core::fmt;
use std::io::{Cursor, Read, Write};

/// Protocol id + message type pair identifying one transfer message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageTypeData {
    pub protocol_id: u16,
    pub message_type: u8,
}

impl MessageTypeData {
    pub const PROTOCOL_ID_SECURE_CHANNEL: u16 = 0x0000;
    pub const PROTOCOL_ID_BDX: u16 = 0x0002;

    pub const MSG_TYPE_SEND_INIT: u8 = 0x01;
    pub const MSG_TYPE_SEND_ACCEPT: u8 = 0x02;
    pub const MSG_TYPE_RECEIVE_INIT: u8 = 0x04;
    pub const MSG_TYPE_RECEIVE_ACCEPT: u8 = 0x05;
    pub const MSG_TYPE_BLOCK_QUERY: u8 = 0x10;
    pub const MSG_TYPE_BLOCK: u8 = 0x11;
    pub const MSG_TYPE_BLOCK_EOF: u8 = 0x12;
    pub const MSG_TYPE_BLOCK_ACK: u8 = 0x13;
    pub const MSG_TYPE_BLOCK_ACK_EOF: u8 = 0x14;
    pub const MSG_TYPE_STATUS_REPORT: u8 = 0x40;

    pub fn bdx(message_type: u8) -> Self {
        Self {
            protocol_id: Self::PROTOCOL_ID_BDX,
            message_type,
        }
    }

    pub fn status_report() -> Self {
        Self {
            protocol_id: Self::PROTOCOL_ID_SECURE_CHANNEL,
            message_type: Self::MSG_TYPE_STATUS_REPORT,
        }
    }

    pub fn is_status_report(&self) -> bool {
        self.protocol_id == Self::PROTOCOL_ID_SECURE_CHANNEL
            && self.message_type == Self::MSG_TYPE_STATUS_REPORT
    }
}

/// Transfer control bits carried in the first byte of init/accept messages.
/// Low nibble is the protocol version.
pub const CONTROL_VERSION_MASK: u8 = 0x0f;
pub const CONTROL_SENDER_DRIVE: u8 = 0x10;
pub const CONTROL_RECEIVER_DRIVE: u8 = 0x20;
pub const CONTROL_ASYNC: u8 = 0x40;

pub const PROTOCOL_VERSION: u8 = 1;

const RANGE_DEFLEN: u8 = 0x01;
const RANGE_START_OFFSET: u8 = 0x02;
const RANGE_WIDERANGE: u8 = 0x10;

/// SendInit/ReceiveInit payload. The file designator is a length-prefixed
/// byte string and is not null terminated; metadata is whatever trails it.
#[derive(Clone, PartialEq, Eq)]
pub struct TransferInit {
    pub proposed_control: u8,
    pub max_block_size: u16,
    pub start_offset: u64,
    pub max_length: u64,
    pub file_designator: Vec<u8>,
    pub metadata: Vec<u8>,
}

impl fmt::Debug for TransferInit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferInit")
            .field("proposed_control", &self.proposed_control)
            .field("max_block_size", &self.max_block_size)
            .field("start_offset", &self.start_offset)
            .field("max_length", &self.max_length)
            .field(
                "file_designator",
                &String::from_utf8_lossy(&self.file_designator),
            )
            .field("metadata", &hex::encode(&self.metadata))
            .finish()
    }
}

impl TransferInit {
    fn range_control(&self) -> u8 {
        let mut range = 0;
        if self.max_length > 0 {
            range |= RANGE_DEFLEN;
        }
        if self.start_offset > 0 {
            range |= RANGE_START_OFFSET;
        }
        if self.start_offset > u32::MAX as u64 || self.max_length > u32::MAX as u64 {
            range |= RANGE_WIDERANGE;
        }
        range
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.file_designator.len() > u16::MAX as usize {
            anyhow::bail!("file designator too long: {}", self.file_designator.len());
        }
        let range = self.range_control();
        let wide = (range & RANGE_WIDERANGE) != 0;
        let mut out = Vec::with_capacity(32 + self.file_designator.len() + self.metadata.len());
        out.write_u8(self.proposed_control)?;
        out.write_u8(range)?;
        out.write_u16::<LittleEndian>(self.max_block_size)?;
        if (range & RANGE_START_OFFSET) != 0 {
            if wide {
                out.write_u64::<LittleEndian>(self.start_offset)?;
            } else {
                out.write_u32::<LittleEndian>(self.start_offset as u32)?;
            }
        }
        if (range & RANGE_DEFLEN) != 0 {
            if wide {
                out.write_u64::<LittleEndian>(self.max_length)?;
            } else {
                out.write_u32::<LittleEndian>(self.max_length as u32)?;
            }
        }
        out.write_u16::<LittleEndian>(self.file_designator.len() as u16)?;
        out.write_all(&self.file_designator)?;
        out.write_all(&self.metadata)?;
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let proposed_control = cursor.read_u8()?;
        let range = cursor.read_u8()?;
        let max_block_size = cursor.read_u16::<LittleEndian>()?;
        let wide = (range & RANGE_WIDERANGE) != 0;
        let start_offset = if (range & RANGE_START_OFFSET) != 0 {
            if wide {
                cursor.read_u64::<LittleEndian>()?
            } else {
                cursor.read_u32::<LittleEndian>()? as u64
            }
        } else {
            0
        };
        let max_length = if (range & RANGE_DEFLEN) != 0 {
            if wide {
                cursor.read_u64::<LittleEndian>()?
            } else {
                cursor.read_u32::<LittleEndian>()? as u64
            }
        } else {
            0
        };
        let designator_len = cursor.read_u16::<LittleEndian>()? as usize;
        let mut file_designator = vec![0; designator_len];
        cursor
            .read_exact(file_designator.as_mut())
            .context("truncated file designator")?;
        let mut metadata = Vec::new();
        cursor.read_to_end(&mut metadata)?;
        Ok(Self {
            proposed_control,
            max_block_size,
            start_offset,
            max_length,
            file_designator,
            metadata,
        })
    }
}

/// SendAccept payload - sent by the receiving side to accept a SendInit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendAccept {
    pub transfer_control: u8,
    pub max_block_size: u16,
    pub metadata: Vec<u8>,
}

impl SendAccept {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(8 + self.metadata.len());
        out.write_u8(self.transfer_control)?;
        out.write_u16::<LittleEndian>(self.max_block_size)?;
        out.write_all(&self.metadata)?;
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let transfer_control = cursor.read_u8()?;
        let max_block_size = cursor.read_u16::<LittleEndian>()?;
        let mut metadata = Vec::new();
        cursor.read_to_end(&mut metadata)?;
        Ok(Self {
            transfer_control,
            max_block_size,
            metadata,
        })
    }
}

/// ReceiveAccept payload - sent by the sending side to accept a ReceiveInit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveAccept {
    pub transfer_control: u8,
    pub max_block_size: u16,
    pub length: u64,
    pub metadata: Vec<u8>,
}

impl ReceiveAccept {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut range = 0;
        if self.length > 0 {
            range |= RANGE_DEFLEN;
        }
        if self.length > u32::MAX as u64 {
            range |= RANGE_WIDERANGE;
        }
        let mut out = Vec::with_capacity(16 + self.metadata.len());
        out.write_u8(self.transfer_control)?;
        out.write_u8(range)?;
        out.write_u16::<LittleEndian>(self.max_block_size)?;
        if (range & RANGE_DEFLEN) != 0 {
            if (range & RANGE_WIDERANGE) != 0 {
                out.write_u64::<LittleEndian>(self.length)?;
            } else {
                out.write_u32::<LittleEndian>(self.length as u32)?;
            }
        }
        out.write_all(&self.metadata)?;
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let transfer_control = cursor.read_u8()?;
        let range = cursor.read_u8()?;
        let max_block_size = cursor.read_u16::<LittleEndian>()?;
        let length = if (range & RANGE_DEFLEN) != 0 {
            if (range & RANGE_WIDERANGE) != 0 {
                cursor.read_u64::<LittleEndian>()?
            } else {
                cursor.read_u32::<LittleEndian>()? as u64
            }
        } else {
            0
        };
        let mut metadata = Vec::new();
        cursor.read_to_end(&mut metadata)?;
        Ok(Self {
            transfer_control,
            max_block_size,
            length,
            metadata,
        })
    }
}

/// Block/BlockEOF payload - counter followed by raw chunk bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Block {
    pub block_counter: u32,
    pub data: Vec<u8>,
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("block_counter", &self.block_counter)
            .field("data", &hex::encode(&self.data))
            .finish()
    }
}

impl Block {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(4 + self.data.len());
        out.write_u32::<LittleEndian>(self.block_counter)?;
        out.write_all(&self.data)?;
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let block_counter = cursor.read_u32::<LittleEndian>()?;
        let mut payload = Vec::new();
        cursor.read_to_end(&mut payload)?;
        Ok(Self {
            block_counter,
            data: payload,
        })
    }
}

/// BlockQuery/BlockAck/BlockAckEOF payload - a bare block counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterMessage {
    pub block_counter: u32,
}

impl CounterMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(4);
        out.write_u32::<LittleEndian>(self.block_counter)?;
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let block_counter = cursor.read_u32::<LittleEndian>()?;
        Ok(Self { block_counter })
    }
}

pub const GENERAL_CODE_SUCCESS: u16 = 0;
pub const GENERAL_CODE_FAILURE: u16 = 1;

/// Transfer status codes carried in the protocol code field of a status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Overflow = 0x0011,
    LengthTooLarge = 0x0012,
    LengthTooShort = 0x0013,
    LengthMismatch = 0x0014,
    LengthRequired = 0x0015,
    BadMessageContents = 0x0016,
    BadBlockCounter = 0x0017,
    UnexpectedMessage = 0x0018,
    ResponderBusy = 0x0019,
    TransferFailedUnknownError = 0x001f,
    TransferMethodNotSupported = 0x0050,
    FileDesignatorUnknown = 0x0051,
    StartOffsetNotSupported = 0x0052,
    VersionNotSupported = 0x0053,
    Unknown = 0x005f,
}

impl From<u16> for StatusCode {
    fn from(value: u16) -> Self {
        match value {
            0x0011 => StatusCode::Overflow,
            0x0012 => StatusCode::LengthTooLarge,
            0x0013 => StatusCode::LengthTooShort,
            0x0014 => StatusCode::LengthMismatch,
            0x0015 => StatusCode::LengthRequired,
            0x0016 => StatusCode::BadMessageContents,
            0x0017 => StatusCode::BadBlockCounter,
            0x0018 => StatusCode::UnexpectedMessage,
            0x0019 => StatusCode::ResponderBusy,
            0x001f => StatusCode::TransferFailedUnknownError,
            0x0050 => StatusCode::TransferMethodNotSupported,
            0x0051 => StatusCode::FileDesignatorUnknown,
            0x0052 => StatusCode::StartOffsetNotSupported,
            0x0053 => StatusCode::VersionNotSupported,
            _ => StatusCode::Unknown,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusCode::Overflow => write!(f, "OVERFLOW"),
            StatusCode::LengthTooLarge => write!(f, "LENGTH_TOO_LARGE"),
            StatusCode::LengthTooShort => write!(f, "LENGTH_TOO_SHORT"),
            StatusCode::LengthMismatch => write!(f, "LENGTH_MISMATCH"),
            StatusCode::LengthRequired => write!(f, "LENGTH_REQUIRED"),
            StatusCode::BadMessageContents => write!(f, "BAD_MESSAGE_CONTENTS"),
            StatusCode::BadBlockCounter => write!(f, "BAD_BLOCK_COUNTER"),
            StatusCode::UnexpectedMessage => write!(f, "UNEXPECTED_MESSAGE"),
            StatusCode::ResponderBusy => write!(f, "RESPONDER_BUSY"),
            StatusCode::TransferFailedUnknownError => write!(f, "TRANSFER_FAILED_UNKNOWN_ERROR"),
            StatusCode::TransferMethodNotSupported => write!(f, "TRANSFER_METHOD_NOT_SUPPORTED"),
            StatusCode::FileDesignatorUnknown => write!(f, "FILE_DESIGNATOR_UNKNOWN"),
            StatusCode::StartOffsetNotSupported => write!(f, "START_OFFSET_NOT_SUPPORTED"),
            StatusCode::VersionNotSupported => write!(f, "VERSION_NOT_SUPPORTED"),
            StatusCode::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Status report payload signalling termination of a transfer.
#[derive(Debug, Clone, Copy)]
pub struct StatusReportInfo {
    pub general_code: u16,
    pub protocol_id: u32,
    pub protocol_code: u16,
}

impl fmt::Display for StatusReportInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.general_code == GENERAL_CODE_SUCCESS {
            return write!(f, "StatusReportInfo: OK");
        }
        write!(
            f,
            "StatusReportInfo: general_code={}, protocol_id={}, protocol_code={}",
            self.general_code,
            self.protocol_id,
            StatusCode::from(self.protocol_code)
        )
    }
}

impl StatusReportInfo {
    pub fn failure(code: StatusCode) -> Self {
        Self {
            general_code: GENERAL_CODE_FAILURE,
            protocol_id: MessageTypeData::PROTOCOL_ID_BDX as u32,
            protocol_code: code as u16,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(8);
        out.write_u16::<LittleEndian>(self.general_code)?;
        out.write_u32::<LittleEndian>(self.protocol_id)?;
        out.write_u16::<LittleEndian>(self.protocol_code)?;
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let general_code = cursor.read_u16::<LittleEndian>()?;
        let protocol_id = cursor.read_u32::<LittleEndian>()?;
        let protocol_code = cursor.read_u16::<LittleEndian>()?;
        Ok(Self {
            general_code,
            protocol_id,
            protocol_code,
        })
    }

    pub fn is_ok(&self) -> bool {
        self.general_code == GENERAL_CODE_SUCCESS
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from(self.protocol_code)
    }
}
