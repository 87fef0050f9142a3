//! Attribute Protocol
//!
//! Opcodes, error codes, UUIDs and the PDU codec shared by the GATT server
//! and client. Every PDU travels on the fixed ATT channel (CID 0x0004) and
//! starts with a one byte opcode; multi-byte fields are little endian.

use crate::Error;
use crate::codec::{Reader, Writer};

/// ATT opcodes
pub mod opcode {
    /// Error Response
    pub const ERROR_RSP: u8 = 0x01;
    /// Exchange MTU Request
    pub const EXCHANGE_MTU_REQ: u8 = 0x02;
    /// Exchange MTU Response
    pub const EXCHANGE_MTU_RSP: u8 = 0x03;
    /// Find Information Request
    pub const FIND_INFORMATION_REQ: u8 = 0x04;
    /// Find Information Response
    pub const FIND_INFORMATION_RSP: u8 = 0x05;
    /// Find By Type Value Request
    pub const FIND_BY_TYPE_VALUE_REQ: u8 = 0x06;
    /// Find By Type Value Response
    pub const FIND_BY_TYPE_VALUE_RSP: u8 = 0x07;
    /// Read By Type Request
    pub const READ_BY_TYPE_REQ: u8 = 0x08;
    /// Read By Type Response
    pub const READ_BY_TYPE_RSP: u8 = 0x09;
    /// Read Request
    pub const READ_REQ: u8 = 0x0A;
    /// Read Response
    pub const READ_RSP: u8 = 0x0B;
    /// Read Blob Request
    pub const READ_BLOB_REQ: u8 = 0x0C;
    /// Read Blob Response
    pub const READ_BLOB_RSP: u8 = 0x0D;
    /// Read By Group Type Request
    pub const READ_BY_GROUP_TYPE_REQ: u8 = 0x10;
    /// Read By Group Type Response
    pub const READ_BY_GROUP_TYPE_RSP: u8 = 0x11;
    /// Write Request
    pub const WRITE_REQ: u8 = 0x12;
    /// Write Response
    pub const WRITE_RSP: u8 = 0x13;
    /// Prepare Write Request
    pub const PREPARE_WRITE_REQ: u8 = 0x16;
    /// Prepare Write Response
    pub const PREPARE_WRITE_RSP: u8 = 0x17;
    /// Execute Write Request
    pub const EXECUTE_WRITE_REQ: u8 = 0x18;
    /// Execute Write Response
    pub const EXECUTE_WRITE_RSP: u8 = 0x19;
    /// Handle Value Notification
    pub const NOTIFICATION: u8 = 0x1B;
    /// Handle Value Indication
    pub const INDICATION: u8 = 0x1D;
    /// Handle Value Confirmation
    pub const CONFIRMATION: u8 = 0x1E;
    /// Write Command
    pub const WRITE_CMD: u8 = 0x52;

    /// Set on PDUs that never get a response
    pub const COMMAND_FLAG: u8 = 0x40;

    /// True if `opcode` is a request this stack serves
    #[must_use]
    pub const fn is_request(opcode: u8) -> bool {
        matches!(
            opcode,
            EXCHANGE_MTU_REQ
                | FIND_INFORMATION_REQ
                | FIND_BY_TYPE_VALUE_REQ
                | READ_BY_TYPE_REQ
                | READ_REQ
                | READ_BLOB_REQ
                | READ_BY_GROUP_TYPE_REQ
                | WRITE_REQ
                | PREPARE_WRITE_REQ
                | EXECUTE_WRITE_REQ
        )
    }
}

/// Execute Write flag: drop every prepared value
pub const EXECUTE_CANCEL: u8 = 0x00;

/// Execute Write flag: write every prepared value
pub const EXECUTE_WRITE: u8 = 0x01;

/// Error codes carried by an Error Response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AttErrorCode {
    /// The handle is not valid on this server
    InvalidHandle,
    /// The attribute cannot be read
    ReadNotPermitted,
    /// The attribute cannot be written
    WriteNotPermitted,
    /// The PDU was malformed
    InvalidPdu,
    /// Authentication is required
    InsufficientAuthentication,
    /// The server does not support the request
    RequestNotSupported,
    /// The offset is past the end of the value
    InvalidOffset,
    /// Authorization is required
    InsufficientAuthorization,
    /// Too many prepared writes are queued
    PrepareQueueFull,
    /// No attribute in the handle range matched
    AttributeNotFound,
    /// The attribute cannot be read with Read Blob
    AttributeNotLong,
    /// The encryption key is too short
    InsufficientEncryptionKeySize,
    /// The value has the wrong length
    InvalidAttributeValueLength,
    /// The request failed for an unlikely reason
    UnlikelyError,
    /// Encryption is required
    InsufficientEncryption,
    /// The group type is not a grouping attribute
    UnsupportedGroupType,
    /// Not enough resources to complete the request
    InsufficientResources,
    /// Application or profile defined code
    Other(u8),
}

impl AttErrorCode {
    /// Convert from the wire value
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0x01 => Self::InvalidHandle,
            0x02 => Self::ReadNotPermitted,
            0x03 => Self::WriteNotPermitted,
            0x04 => Self::InvalidPdu,
            0x05 => Self::InsufficientAuthentication,
            0x06 => Self::RequestNotSupported,
            0x07 => Self::InvalidOffset,
            0x08 => Self::InsufficientAuthorization,
            0x09 => Self::PrepareQueueFull,
            0x0A => Self::AttributeNotFound,
            0x0B => Self::AttributeNotLong,
            0x0C => Self::InsufficientEncryptionKeySize,
            0x0D => Self::InvalidAttributeValueLength,
            0x0E => Self::UnlikelyError,
            0x0F => Self::InsufficientEncryption,
            0x10 => Self::UnsupportedGroupType,
            0x11 => Self::InsufficientResources,
            other => Self::Other(other),
        }
    }

    /// Wire value
    #[must_use]
    pub const fn to_u8(self) -> u8 {
        match self {
            Self::InvalidHandle => 0x01,
            Self::ReadNotPermitted => 0x02,
            Self::WriteNotPermitted => 0x03,
            Self::InvalidPdu => 0x04,
            Self::InsufficientAuthentication => 0x05,
            Self::RequestNotSupported => 0x06,
            Self::InvalidOffset => 0x07,
            Self::InsufficientAuthorization => 0x08,
            Self::PrepareQueueFull => 0x09,
            Self::AttributeNotFound => 0x0A,
            Self::AttributeNotLong => 0x0B,
            Self::InsufficientEncryptionKeySize => 0x0C,
            Self::InvalidAttributeValueLength => 0x0D,
            Self::UnlikelyError => 0x0E,
            Self::InsufficientEncryption => 0x0F,
            Self::UnsupportedGroupType => 0x10,
            Self::InsufficientResources => 0x11,
            Self::Other(value) => value,
        }
    }
}

impl From<AttErrorCode> for Error {
    fn from(code: AttErrorCode) -> Self {
        Error::Att(code)
    }
}

// 0000xxxx-0000-1000-8000-00805F9B34FB, little endian
const BASE_UUID: [u8; 16] = [
    0xFB, 0x34, 0x9B, 0x5F, 0x80, 0x00, 0x00, 0x80, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Attribute type
///
/// A 16-bit UUID is shorthand for a 128-bit one built on the Bluetooth base
/// UUID, and the two forms compare equal:
///
/// ```rust
/// use bluewren::Uuid;
///
/// let mut long = [0xFB, 0x34, 0x9B, 0x5F, 0x80, 0, 0, 0x80, 0, 0x10, 0, 0, 0x0D, 0x18, 0, 0];
/// assert_eq!(Uuid::Uuid128(long), Uuid::Uuid16(0x180D));
/// long[0] = 0;
/// assert_ne!(Uuid::Uuid128(long), Uuid::Uuid16(0x180D));
/// ```
#[derive(Debug, Clone, Copy, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Uuid {
    /// Assigned number
    Uuid16(u16),
    /// Full UUID, little endian
    Uuid128([u8; 16]),
}

impl Uuid {
    /// Primary Service declaration
    pub const PRIMARY_SERVICE: Self = Self::Uuid16(0x2800);
    /// Secondary Service declaration
    pub const SECONDARY_SERVICE: Self = Self::Uuid16(0x2801);
    /// Include declaration
    pub const INCLUDE: Self = Self::Uuid16(0x2802);
    /// Characteristic declaration
    pub const CHARACTERISTIC: Self = Self::Uuid16(0x2803);
    /// Characteristic User Description descriptor
    pub const USER_DESCRIPTION: Self = Self::Uuid16(0x2901);
    /// Client Characteristic Configuration descriptor
    pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Self = Self::Uuid16(0x2902);

    /// Parse a 2 or 16 byte little-endian UUID
    ///
    /// # Errors
    /// Returns [`Error::InvalidPacket`] for any other length
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        match bytes.len() {
            2 => Ok(Self::Uuid16(u16::from_le_bytes([bytes[0], bytes[1]]))),
            16 => {
                let mut uuid = [0u8; 16];
                uuid.copy_from_slice(bytes);
                Ok(Self::Uuid128(uuid))
            }
            _ => Err(Error::InvalidPacket),
        }
    }

    /// The 16-bit form, if this UUID is built on the base UUID
    #[must_use]
    pub fn as_short(&self) -> Option<u16> {
        match self {
            Self::Uuid16(uuid) => Some(*uuid),
            Self::Uuid128(uuid) if uuid[..12] == BASE_UUID[..12] && uuid[14..] == [0, 0] => {
                Some(u16::from_le_bytes([uuid[12], uuid[13]]))
            }
            Self::Uuid128(_) => None,
        }
    }

    /// The 128-bit form
    #[must_use]
    pub fn to_u128_bytes(&self) -> [u8; 16] {
        match self {
            Self::Uuid16(uuid) => {
                let mut full = BASE_UUID;
                full[12..14].copy_from_slice(&uuid.to_le_bytes());
                full
            }
            Self::Uuid128(uuid) => *uuid,
        }
    }

    /// Encoded length: 2 or 16
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Uuid16(_) => 2,
            Self::Uuid128(_) => 16,
        }
    }

    /// Always false; present for symmetry with [`len`](Self::len)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Little-endian encoding in the UUID's own width
    #[must_use]
    pub fn to_bytes(&self) -> heapless::Vec<u8, 16> {
        let mut out = heapless::Vec::new();
        // 16 bytes always fit
        let _ = match self {
            Self::Uuid16(uuid) => out.extend_from_slice(&uuid.to_le_bytes()),
            Self::Uuid128(uuid) => out.extend_from_slice(uuid),
        };
        out
    }

    pub(crate) fn write(&self, w: &mut Writer<'_>) -> Result<(), Error> {
        w.put_slice(&self.to_bytes())
    }
}

impl PartialEq for Uuid {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Uuid16(a), Self::Uuid16(b)) => a == b,
            _ => self.to_u128_bytes() == other.to_u128_bytes(),
        }
    }
}

impl From<u16> for Uuid {
    fn from(uuid: u16) -> Self {
        Self::Uuid16(uuid)
    }
}

impl From<[u8; 16]> for Uuid {
    fn from(uuid: [u8; 16]) -> Self {
        Self::Uuid128(uuid)
    }
}

/// One decoded ATT PDU
///
/// List responses keep their entries as raw bytes; the client walks them
/// with the element length the response announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttPdu<'a> {
    /// Error Response
    ErrorRsp {
        /// Opcode of the failed request
        request: u8,
        /// Handle that caused the error
        handle: u16,
        /// Reason
        code: AttErrorCode,
    },
    /// Exchange MTU Request
    ExchangeMtuReq {
        /// Client receive MTU
        mtu: u16,
    },
    /// Exchange MTU Response
    ExchangeMtuRsp {
        /// Server receive MTU
        mtu: u16,
    },
    /// Find Information Request
    FindInformationReq {
        /// First handle
        start: u16,
        /// Last handle
        end: u16,
    },
    /// Find Information Response
    FindInformationRsp {
        /// 0x01 for 16-bit UUIDs, 0x02 for 128-bit UUIDs
        format: u8,
        /// Handle/UUID pairs
        data: &'a [u8],
    },
    /// Find By Type Value Request
    FindByTypeValueReq {
        /// First handle
        start: u16,
        /// Last handle
        end: u16,
        /// 16-bit attribute type
        att_type: u16,
        /// Value to match
        value: &'a [u8],
    },
    /// Find By Type Value Response
    FindByTypeValueRsp {
        /// Found handle / group end pairs
        data: &'a [u8],
    },
    /// Read By Type Request
    ReadByTypeReq {
        /// First handle
        start: u16,
        /// Last handle
        end: u16,
        /// Attribute type
        att_type: Uuid,
    },
    /// Read By Type Response
    ReadByTypeRsp {
        /// Length of each handle/value pair
        len: u8,
        /// Handle/value pairs
        data: &'a [u8],
    },
    /// Read Request
    ReadReq {
        /// Attribute handle
        handle: u16,
    },
    /// Read Response
    ReadRsp {
        /// Value, possibly truncated to the MTU
        value: &'a [u8],
    },
    /// Read Blob Request
    ReadBlobReq {
        /// Attribute handle
        handle: u16,
        /// Offset into the value
        offset: u16,
    },
    /// Read Blob Response
    ReadBlobRsp {
        /// Part of the value starting at the requested offset
        value: &'a [u8],
    },
    /// Read By Group Type Request
    ReadByGroupTypeReq {
        /// First handle
        start: u16,
        /// Last handle
        end: u16,
        /// Grouping attribute type
        group_type: Uuid,
    },
    /// Read By Group Type Response
    ReadByGroupTypeRsp {
        /// Length of each handle/end/value entry
        len: u8,
        /// Entries
        data: &'a [u8],
    },
    /// Write Request
    WriteReq {
        /// Attribute handle
        handle: u16,
        /// Value
        value: &'a [u8],
    },
    /// Write Response
    WriteRsp,
    /// Write Command
    WriteCmd {
        /// Attribute handle
        handle: u16,
        /// Value
        value: &'a [u8],
    },
    /// Prepare Write Request
    PrepareWriteReq {
        /// Attribute handle
        handle: u16,
        /// Offset of this part
        offset: u16,
        /// Part of the value
        value: &'a [u8],
    },
    /// Prepare Write Response, echoing the request
    PrepareWriteRsp {
        /// Attribute handle
        handle: u16,
        /// Offset of this part
        offset: u16,
        /// Part of the value
        value: &'a [u8],
    },
    /// Execute Write Request
    ExecuteWriteReq {
        /// [`EXECUTE_CANCEL`] or [`EXECUTE_WRITE`]
        flags: u8,
    },
    /// Execute Write Response
    ExecuteWriteRsp,
    /// Handle Value Notification
    Notification {
        /// Value handle
        handle: u16,
        /// Value
        value: &'a [u8],
    },
    /// Handle Value Indication
    Indication {
        /// Value handle
        handle: u16,
        /// Value
        value: &'a [u8],
    },
    /// Handle Value Confirmation
    Confirmation,
    /// Any opcode this stack does not implement
    Unknown {
        /// Opcode
        opcode: u8,
    },
}

impl<'a> AttPdu<'a> {
    /// Decode a PDU
    ///
    /// # Errors
    /// Returns [`Error::InvalidPacket`] if the PDU is empty, truncated, or
    /// carries trailing bytes a fixed-size PDU does not allow
    pub fn decode(pdu: &'a [u8]) -> Result<Self, Error> {
        let mut r = Reader::new(pdu);
        let op = r.u8()?;
        let decoded = match op {
            opcode::ERROR_RSP => Self::ErrorRsp {
                request: r.u8()?,
                handle: r.le16()?,
                code: AttErrorCode::from_u8(r.u8()?),
            },
            opcode::EXCHANGE_MTU_REQ => Self::ExchangeMtuReq { mtu: r.le16()? },
            opcode::EXCHANGE_MTU_RSP => Self::ExchangeMtuRsp { mtu: r.le16()? },
            opcode::FIND_INFORMATION_REQ => Self::FindInformationReq {
                start: r.le16()?,
                end: r.le16()?,
            },
            opcode::FIND_INFORMATION_RSP => {
                let format = r.u8()?;
                let data = r.rest();
                let entry = match format {
                    0x01 => 4,
                    0x02 => 18,
                    _ => return Err(Error::InvalidPacket),
                };
                if data.len() % entry != 0 {
                    return Err(Error::InvalidPacket);
                }
                Self::FindInformationRsp { format, data }
            }
            opcode::FIND_BY_TYPE_VALUE_REQ => Self::FindByTypeValueReq {
                start: r.le16()?,
                end: r.le16()?,
                att_type: r.le16()?,
                value: r.rest(),
            },
            opcode::FIND_BY_TYPE_VALUE_RSP => {
                let data = r.rest();
                if data.len() % 4 != 0 {
                    return Err(Error::InvalidPacket);
                }
                Self::FindByTypeValueRsp { data }
            }
            opcode::READ_BY_TYPE_REQ => Self::ReadByTypeReq {
                start: r.le16()?,
                end: r.le16()?,
                att_type: Uuid::from_bytes(r.rest())?,
            },
            opcode::READ_BY_TYPE_RSP => {
                let (len, data) = Self::list(&mut r, 2)?;
                Self::ReadByTypeRsp { len, data }
            }
            opcode::READ_REQ => Self::ReadReq { handle: r.le16()? },
            opcode::READ_RSP => Self::ReadRsp { value: r.rest() },
            opcode::READ_BLOB_REQ => Self::ReadBlobReq {
                handle: r.le16()?,
                offset: r.le16()?,
            },
            opcode::READ_BLOB_RSP => Self::ReadBlobRsp { value: r.rest() },
            opcode::READ_BY_GROUP_TYPE_REQ => Self::ReadByGroupTypeReq {
                start: r.le16()?,
                end: r.le16()?,
                group_type: Uuid::from_bytes(r.rest())?,
            },
            opcode::READ_BY_GROUP_TYPE_RSP => {
                let (len, data) = Self::list(&mut r, 4)?;
                Self::ReadByGroupTypeRsp { len, data }
            }
            opcode::WRITE_REQ => Self::WriteReq {
                handle: r.le16()?,
                value: r.rest(),
            },
            opcode::WRITE_RSP => Self::WriteRsp,
            opcode::WRITE_CMD => Self::WriteCmd {
                handle: r.le16()?,
                value: r.rest(),
            },
            opcode::PREPARE_WRITE_REQ => Self::PrepareWriteReq {
                handle: r.le16()?,
                offset: r.le16()?,
                value: r.rest(),
            },
            opcode::PREPARE_WRITE_RSP => Self::PrepareWriteRsp {
                handle: r.le16()?,
                offset: r.le16()?,
                value: r.rest(),
            },
            opcode::EXECUTE_WRITE_REQ => Self::ExecuteWriteReq { flags: r.u8()? },
            opcode::EXECUTE_WRITE_RSP => Self::ExecuteWriteRsp,
            opcode::NOTIFICATION => Self::Notification {
                handle: r.le16()?,
                value: r.rest(),
            },
            opcode::INDICATION => Self::Indication {
                handle: r.le16()?,
                value: r.rest(),
            },
            opcode::CONFIRMATION => Self::Confirmation,
            other => return Ok(Self::Unknown { opcode: other }),
        };
        if !r.is_empty() {
            return Err(Error::InvalidPacket);
        }
        Ok(decoded)
    }

    // length-prefixed list of equally sized entries, each at least `min` bytes
    fn list(r: &mut Reader<'a>, min: u8) -> Result<(u8, &'a [u8]), Error> {
        let len = r.u8()?;
        let data = r.rest();
        if len < min || data.is_empty() || data.len() % usize::from(len) != 0 {
            return Err(Error::InvalidPacket);
        }
        Ok((len, data))
    }

    /// Opcode of this PDU
    #[must_use]
    pub fn opcode(&self) -> u8 {
        match self {
            Self::ErrorRsp { .. } => opcode::ERROR_RSP,
            Self::ExchangeMtuReq { .. } => opcode::EXCHANGE_MTU_REQ,
            Self::ExchangeMtuRsp { .. } => opcode::EXCHANGE_MTU_RSP,
            Self::FindInformationReq { .. } => opcode::FIND_INFORMATION_REQ,
            Self::FindInformationRsp { .. } => opcode::FIND_INFORMATION_RSP,
            Self::FindByTypeValueReq { .. } => opcode::FIND_BY_TYPE_VALUE_REQ,
            Self::FindByTypeValueRsp { .. } => opcode::FIND_BY_TYPE_VALUE_RSP,
            Self::ReadByTypeReq { .. } => opcode::READ_BY_TYPE_REQ,
            Self::ReadByTypeRsp { .. } => opcode::READ_BY_TYPE_RSP,
            Self::ReadReq { .. } => opcode::READ_REQ,
            Self::ReadRsp { .. } => opcode::READ_RSP,
            Self::ReadBlobReq { .. } => opcode::READ_BLOB_REQ,
            Self::ReadBlobRsp { .. } => opcode::READ_BLOB_RSP,
            Self::ReadByGroupTypeReq { .. } => opcode::READ_BY_GROUP_TYPE_REQ,
            Self::ReadByGroupTypeRsp { .. } => opcode::READ_BY_GROUP_TYPE_RSP,
            Self::WriteReq { .. } => opcode::WRITE_REQ,
            Self::WriteRsp => opcode::WRITE_RSP,
            Self::WriteCmd { .. } => opcode::WRITE_CMD,
            Self::PrepareWriteReq { .. } => opcode::PREPARE_WRITE_REQ,
            Self::PrepareWriteRsp { .. } => opcode::PREPARE_WRITE_RSP,
            Self::ExecuteWriteReq { .. } => opcode::EXECUTE_WRITE_REQ,
            Self::ExecuteWriteRsp => opcode::EXECUTE_WRITE_RSP,
            Self::Notification { .. } => opcode::NOTIFICATION,
            Self::Indication { .. } => opcode::INDICATION,
            Self::Confirmation => opcode::CONFIRMATION,
            Self::Unknown { opcode } => *opcode,
        }
    }

    /// True for PDUs a server must answer
    #[must_use]
    pub fn is_request(&self) -> bool {
        opcode::is_request(self.opcode())
    }

    /// True for responses to a client request, Error Response included
    #[must_use]
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Self::ErrorRsp { .. }
                | Self::ExchangeMtuRsp { .. }
                | Self::FindInformationRsp { .. }
                | Self::FindByTypeValueRsp { .. }
                | Self::ReadByTypeRsp { .. }
                | Self::ReadRsp { .. }
                | Self::ReadBlobRsp { .. }
                | Self::ReadByGroupTypeRsp { .. }
                | Self::WriteRsp
                | Self::PrepareWriteRsp { .. }
                | Self::ExecuteWriteRsp
        )
    }

    /// Encode the PDU
    ///
    /// # Errors
    /// Returns [`Error::MessageTooLong`] if it does not fit `w`
    pub(crate) fn encode(&self, w: &mut Writer<'_>) -> Result<(), Error> {
        w.u8(self.opcode())?;
        match *self {
            Self::ErrorRsp {
                request,
                handle,
                code,
            } => {
                w.u8(request)?;
                w.le16(handle)?;
                w.u8(code.to_u8())
            }
            Self::ExchangeMtuReq { mtu } | Self::ExchangeMtuRsp { mtu } => w.le16(mtu),
            Self::FindInformationReq { start, end } => {
                w.le16(start)?;
                w.le16(end)
            }
            Self::FindInformationRsp { format, data } => {
                w.u8(format)?;
                w.put_slice(data)
            }
            Self::FindByTypeValueReq {
                start,
                end,
                att_type,
                value,
            } => {
                w.le16(start)?;
                w.le16(end)?;
                w.le16(att_type)?;
                w.put_slice(value)
            }
            Self::FindByTypeValueRsp { data } => w.put_slice(data),
            Self::ReadByTypeReq {
                start,
                end,
                att_type: uuid,
            }
            | Self::ReadByGroupTypeReq {
                start,
                end,
                group_type: uuid,
            } => {
                w.le16(start)?;
                w.le16(end)?;
                uuid.write(w)
            }
            Self::ReadByTypeRsp { len, data } | Self::ReadByGroupTypeRsp { len, data } => {
                w.u8(len)?;
                w.put_slice(data)
            }
            Self::ReadReq { handle } => w.le16(handle),
            Self::ReadRsp { value } | Self::ReadBlobRsp { value } => w.put_slice(value),
            Self::ReadBlobReq { handle, offset } => {
                w.le16(handle)?;
                w.le16(offset)
            }
            Self::WriteReq { handle, value }
            | Self::WriteCmd { handle, value }
            | Self::Notification { handle, value }
            | Self::Indication { handle, value } => {
                w.le16(handle)?;
                w.put_slice(value)
            }
            Self::PrepareWriteReq {
                handle,
                offset,
                value,
            }
            | Self::PrepareWriteRsp {
                handle,
                offset,
                value,
            } => {
                w.le16(handle)?;
                w.le16(offset)?;
                w.put_slice(value)
            }
            Self::ExecuteWriteReq { flags } => w.u8(flags),
            Self::WriteRsp | Self::ExecuteWriteRsp | Self::Confirmation | Self::Unknown { .. } => {
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(pdu: &AttPdu<'_>) -> heapless::Vec<u8, 64> {
        let mut out = [0u8; 64];
        let mut w = Writer::new(&mut out);
        pdu.encode(&mut w).unwrap();
        heapless::Vec::from_slice(w.written()).unwrap()
    }

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(AttErrorCode::from_u8(0x0A), AttErrorCode::AttributeNotFound);
        assert_eq!(AttErrorCode::from_u8(0x80), AttErrorCode::Other(0x80));
        assert_eq!(AttErrorCode::PrepareQueueFull.to_u8(), 0x09);
        assert_eq!(
            Error::from(AttErrorCode::InvalidHandle),
            Error::Att(AttErrorCode::InvalidHandle)
        );
    }

    #[test]
    fn test_uuid_base_comparison() {
        let long = Uuid::Uuid16(0x2902).to_u128_bytes();
        assert_eq!(long[12..14], [0x02, 0x29]);
        assert_eq!(Uuid::Uuid128(long).as_short(), Some(0x2902));
        assert_eq!(Uuid::from_bytes(&long), Ok(Uuid::CLIENT_CHARACTERISTIC_CONFIGURATION));

        let vendor = Uuid::Uuid128([0x11; 16]);
        assert_eq!(vendor.as_short(), None);
        assert_ne!(vendor, Uuid::Uuid16(0x1111));
        assert_eq!(Uuid::from_bytes(&[1, 2, 3]), Err(Error::InvalidPacket));
    }

    #[test]
    fn test_decode_requests() {
        assert_eq!(
            AttPdu::decode(&[0x10, 0x01, 0x00, 0xFF, 0xFF, 0x00, 0x28]),
            Ok(AttPdu::ReadByGroupTypeReq {
                start: 0x0001,
                end: 0xFFFF,
                group_type: Uuid::PRIMARY_SERVICE,
            })
        );
        assert_eq!(
            AttPdu::decode(&[0x16, 0x03, 0x00, 0x14, 0x00, 0xAA]),
            Ok(AttPdu::PrepareWriteReq {
                handle: 3,
                offset: 20,
                value: &[0xAA],
            })
        );
        let pdu = AttPdu::decode(&[0x52, 0x05, 0x00, 1, 2]).unwrap();
        assert_eq!(pdu.opcode() & opcode::COMMAND_FLAG, opcode::COMMAND_FLAG);
        assert!(!pdu.is_request());
    }

    #[test]
    fn test_decode_rejects_malformed() {
        // truncated handle
        assert_eq!(AttPdu::decode(&[0x0A, 0x01]), Err(Error::InvalidPacket));
        // trailing byte after a fixed-size request
        assert_eq!(
            AttPdu::decode(&[0x02, 0x17, 0x00, 0x00]),
            Err(Error::InvalidPacket)
        );
        // list length not a multiple of the entry length
        assert_eq!(
            AttPdu::decode(&[0x11, 0x06, 1, 0, 5, 0, 0x0D, 0x18, 6]),
            Err(Error::InvalidPacket)
        );
        // 3 byte UUID
        assert_eq!(
            AttPdu::decode(&[0x08, 1, 0, 0xFF, 0xFF, 1, 2, 3]),
            Err(Error::InvalidPacket)
        );
        assert_eq!(AttPdu::decode(&[]), Err(Error::InvalidPacket));
        assert_eq!(AttPdu::decode(&[0x0E, 1, 0]), Ok(AttPdu::Unknown { opcode: 0x0E }));
    }

    #[test]
    fn test_encode_layouts() {
        assert_eq!(
            &encode(&AttPdu::ErrorRsp {
                request: opcode::READ_REQ,
                handle: 0x0021,
                code: AttErrorCode::ReadNotPermitted,
            })[..],
            &[0x01, 0x0A, 0x21, 0x00, 0x02]
        );
        assert_eq!(
            &encode(&AttPdu::FindByTypeValueReq {
                start: 1,
                end: 0xFFFF,
                att_type: 0x2800,
                value: &[0x0F, 0x18],
            })[..],
            &[0x06, 0x01, 0x00, 0xFF, 0xFF, 0x00, 0x28, 0x0F, 0x18]
        );
        assert_eq!(&encode(&AttPdu::Confirmation)[..], &[0x1E]);
    }

    #[test]
    fn test_encode_overflow() {
        let mut out = [0u8; 4];
        let mut w = Writer::new(&mut out);
        let pdu = AttPdu::WriteReq {
            handle: 1,
            value: &[1, 2],
        };
        assert_eq!(pdu.encode(&mut w), Err(Error::MessageTooLong));
    }
}
