//! L2CAP Signaling Protocol
//!
//! Codec for the LE signaling commands the stack handles: command reject,
//! disconnection, connection parameter update, LE credit based connection
//! and flow control credits. Each command travels in a signaling PDU:
//!
//! ```text
//! code (1) | identifier (1) | length (2, LE) | data
//! ```

use heapless::Vec;

use super::packet::{ChannelId, L2capError, ProtocolServiceMultiplexer};
use crate::ConnParams;

/// Largest encoded signaling PDU this stack emits
pub const MAX_SIGNALING_PDU: usize = SignalingHeader::SIZE + LeCreditConnRequest::SIZE;

/// L2CAP Signaling Command Codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SignalingCode {
    /// Command Reject
    CommandReject = 0x01,
    /// Disconnection Request
    DisconnectionRequest = 0x06,
    /// Disconnection Response
    DisconnectionResponse = 0x07,
    /// Connection Parameter Update Request
    ConnParamUpdateRequest = 0x12,
    /// Connection Parameter Update Response
    ConnParamUpdateResponse = 0x13,
    /// LE Credit Based Connection Request
    LeCreditConnRequest = 0x14,
    /// LE Credit Based Connection Response
    LeCreditConnResponse = 0x15,
    /// Flow Control Credit
    FlowControlCredit = 0x16,
}

impl SignalingCode {
    /// Convert from raw byte value
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::CommandReject),
            0x06 => Some(Self::DisconnectionRequest),
            0x07 => Some(Self::DisconnectionResponse),
            0x12 => Some(Self::ConnParamUpdateRequest),
            0x13 => Some(Self::ConnParamUpdateResponse),
            0x14 => Some(Self::LeCreditConnRequest),
            0x15 => Some(Self::LeCreditConnResponse),
            0x16 => Some(Self::FlowControlCredit),
            _ => None,
        }
    }
}

/// L2CAP Signaling Command Header
///
/// The code is kept raw so that unknown commands can still be answered
/// with a reject carrying their identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SignalingHeader {
    /// Command code
    pub code: u8,
    /// Command identifier (for matching requests/responses)
    pub identifier: u8,
    /// Length of command data
    pub length: u16,
}

impl SignalingHeader {
    /// Size of signaling header in bytes
    pub const SIZE: usize = 4;

    /// Parse signaling header from bytes
    ///
    /// # Errors
    /// Returns `L2capError::InsufficientData` if fewer than 4 bytes are given
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, L2capError> {
        let [code, identifier, l0, l1, ..] = *bytes else {
            return Err(L2capError::InsufficientData);
        };
        Ok(Self {
            code,
            identifier,
            length: u16::from_le_bytes([l0, l1]),
        })
    }

    /// Convert header to bytes
    #[must_use]
    pub fn to_bytes(self) -> [u8; 4] {
        let [l0, l1] = self.length.to_le_bytes();
        [self.code, self.identifier, l0, l1]
    }
}

/// Command reject reasons
pub mod reject {
    /// Command not understood
    pub const NOT_UNDERSTOOD: u16 = 0x0000;
    /// Signaling MTU exceeded
    pub const MTU_EXCEEDED: u16 = 0x0001;
    /// Invalid CID in request
    pub const INVALID_CID: u16 = 0x0002;
}

/// Connection parameter update results
pub mod conn_param {
    /// Parameters accepted
    pub const ACCEPTED: u16 = 0x0000;
    /// Parameters rejected
    pub const REJECTED: u16 = 0x0001;
}

/// Result of an LE credit based connection request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum LeConnResult {
    /// Connection successful
    Success = 0x0000,
    /// Refused - PSM not supported
    PsmNotSupported = 0x0002,
    /// Refused - no resources available
    NoResources = 0x0004,
    /// Refused - insufficient authentication
    InsufficientAuthentication = 0x0005,
    /// Refused - insufficient authorization
    InsufficientAuthorization = 0x0006,
    /// Refused - insufficient encryption key size
    InsufficientEncryptionKeySize = 0x0007,
    /// Refused - insufficient encryption
    InsufficientEncryption = 0x0008,
    /// Refused - invalid source CID
    InvalidSourceCid = 0x0009,
    /// Refused - source CID already allocated
    SourceCidAlreadyAllocated = 0x000A,
    /// Refused - unacceptable parameters
    UnacceptableParameters = 0x000B,
}

impl LeConnResult {
    /// Convert from raw u16 value
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0000 => Some(Self::Success),
            0x0002 => Some(Self::PsmNotSupported),
            0x0004 => Some(Self::NoResources),
            0x0005 => Some(Self::InsufficientAuthentication),
            0x0006 => Some(Self::InsufficientAuthorization),
            0x0007 => Some(Self::InsufficientEncryptionKeySize),
            0x0008 => Some(Self::InsufficientEncryption),
            0x0009 => Some(Self::InvalidSourceCid),
            0x000A => Some(Self::SourceCidAlreadyAllocated),
            0x000B => Some(Self::UnacceptableParameters),
            _ => None,
        }
    }
}

/// L2CAP Command Reject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandReject {
    /// Reason code
    pub reason: u16,
    /// Local and remote CID for an invalid CID reject
    pub cids: Option<(ChannelId, ChannelId)>,
}

impl CommandReject {
    fn from_bytes(bytes: &[u8]) -> Result<Self, L2capError> {
        let [r0, r1, rest @ ..] = bytes else {
            return Err(L2capError::InsufficientData);
        };
        let cids = match *rest {
            [a0, a1, b0, b1] => Some((u16::from_le_bytes([a0, a1]), u16::from_le_bytes([b0, b1]))),
            _ => None,
        };
        Ok(Self {
            reason: u16::from_le_bytes([*r0, *r1]),
            cids,
        })
    }
}

/// L2CAP Disconnection Request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DisconnectionRequest {
    /// Channel on the receiver's side
    pub destination_cid: ChannelId,
    /// Channel on the sender's side
    pub source_cid: ChannelId,
}

impl DisconnectionRequest {
    /// Size in bytes
    pub const SIZE: usize = 4;

    fn from_bytes(bytes: &[u8]) -> Result<Self, L2capError> {
        let [d0, d1, s0, s1, ..] = *bytes else {
            return Err(L2capError::InsufficientData);
        };
        Ok(Self {
            destination_cid: u16::from_le_bytes([d0, d1]),
            source_cid: u16::from_le_bytes([s0, s1]),
        })
    }

    /// Convert to bytes
    #[must_use]
    pub fn to_bytes(self) -> [u8; 4] {
        let [d0, d1] = self.destination_cid.to_le_bytes();
        let [s0, s1] = self.source_cid.to_le_bytes();
        [d0, d1, s0, s1]
    }
}

/// L2CAP Disconnection Response, same layout as the request
pub type DisconnectionResponse = DisconnectionRequest;

/// LE Credit Based Connection Request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LeCreditConnRequest {
    /// Service to connect to
    pub psm: ProtocolServiceMultiplexer,
    /// Channel on the requester's side
    pub source_cid: ChannelId,
    /// Largest SDU the requester accepts
    pub mtu: u16,
    /// Largest PDU payload the requester accepts
    pub mps: u16,
    /// Credits granted to the responder
    pub initial_credits: u16,
}

impl LeCreditConnRequest {
    /// Size in bytes
    pub const SIZE: usize = 10;

    fn from_bytes(bytes: &[u8]) -> Result<Self, L2capError> {
        let [p0, p1, s0, s1, m0, m1, s2, s3, c0, c1, ..] = *bytes else {
            return Err(L2capError::InsufficientData);
        };
        Ok(Self {
            psm: u16::from_le_bytes([p0, p1]),
            source_cid: u16::from_le_bytes([s0, s1]),
            mtu: u16::from_le_bytes([m0, m1]),
            mps: u16::from_le_bytes([s2, s3]),
            initial_credits: u16::from_le_bytes([c0, c1]),
        })
    }

    /// Convert to bytes
    #[must_use]
    pub fn to_bytes(self) -> [u8; 10] {
        le16_array([
            self.psm,
            self.source_cid,
            self.mtu,
            self.mps,
            self.initial_credits,
        ])
    }
}

/// LE Credit Based Connection Response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LeCreditConnResponse {
    /// Channel on the responder's side
    pub destination_cid: ChannelId,
    /// Largest SDU the responder accepts
    pub mtu: u16,
    /// Largest PDU payload the responder accepts
    pub mps: u16,
    /// Credits granted to the requester
    pub initial_credits: u16,
    /// Raw result code, see [`LeConnResult`]
    pub result: u16,
}

impl LeCreditConnResponse {
    /// Size in bytes
    pub const SIZE: usize = 10;

    /// Refusal carrying only a result code
    #[must_use]
    pub fn refuse(result: LeConnResult) -> Self {
        Self {
            destination_cid: 0,
            mtu: 0,
            mps: 0,
            initial_credits: 0,
            result: result as u16,
        }
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, L2capError> {
        let [d0, d1, m0, m1, s0, s1, c0, c1, r0, r1, ..] = *bytes else {
            return Err(L2capError::InsufficientData);
        };
        Ok(Self {
            destination_cid: u16::from_le_bytes([d0, d1]),
            mtu: u16::from_le_bytes([m0, m1]),
            mps: u16::from_le_bytes([s0, s1]),
            initial_credits: u16::from_le_bytes([c0, c1]),
            result: u16::from_le_bytes([r0, r1]),
        })
    }

    /// Convert to bytes
    #[must_use]
    pub fn to_bytes(self) -> [u8; 10] {
        le16_array([
            self.destination_cid,
            self.mtu,
            self.mps,
            self.initial_credits,
            self.result,
        ])
    }
}

/// Flow Control Credit indication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlowControlCredit {
    /// Channel on the sender's side
    pub cid: ChannelId,
    /// Credits granted
    pub credits: u16,
}

impl FlowControlCredit {
    fn from_bytes(bytes: &[u8]) -> Result<Self, L2capError> {
        let [i0, i1, c0, c1, ..] = *bytes else {
            return Err(L2capError::InsufficientData);
        };
        Ok(Self {
            cid: u16::from_le_bytes([i0, i1]),
            credits: u16::from_le_bytes([c0, c1]),
        })
    }
}

fn le16_array<const W: usize, const B: usize>(words: [u16; W]) -> [u8; B] {
    let mut out = [0u8; B];
    for (chunk, word) in out.chunks_exact_mut(2).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    out
}

fn conn_params_from_bytes(bytes: &[u8]) -> Result<ConnParams, L2capError> {
    let [a0, a1, b0, b1, c0, c1, d0, d1, ..] = *bytes else {
        return Err(L2capError::InsufficientData);
    };
    Ok(ConnParams {
        interval_min: u16::from_le_bytes([a0, a1]),
        interval_max: u16::from_le_bytes([b0, b1]),
        latency: u16::from_le_bytes([c0, c1]),
        timeout: u16::from_le_bytes([d0, d1]),
    })
}

/// A decoded signaling command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SignalingCommand {
    /// Command Reject
    CommandReject(CommandReject),
    /// Disconnection Request
    DisconnectionRequest(DisconnectionRequest),
    /// Disconnection Response
    DisconnectionResponse(DisconnectionResponse),
    /// Connection Parameter Update Request
    ConnParamUpdateRequest(ConnParams),
    /// Connection Parameter Update Response
    ConnParamUpdateResponse {
        /// Result, see [`conn_param`]
        result: u16,
    },
    /// LE Credit Based Connection Request
    LeCreditConnRequest(LeCreditConnRequest),
    /// LE Credit Based Connection Response
    LeCreditConnResponse(LeCreditConnResponse),
    /// Flow Control Credit
    FlowControlCredit(FlowControlCredit),
}

impl SignalingCommand {
    /// Command code
    #[must_use]
    pub fn code(&self) -> SignalingCode {
        match self {
            Self::CommandReject(_) => SignalingCode::CommandReject,
            Self::DisconnectionRequest(_) => SignalingCode::DisconnectionRequest,
            Self::DisconnectionResponse(_) => SignalingCode::DisconnectionResponse,
            Self::ConnParamUpdateRequest(_) => SignalingCode::ConnParamUpdateRequest,
            Self::ConnParamUpdateResponse { .. } => SignalingCode::ConnParamUpdateResponse,
            Self::LeCreditConnRequest(_) => SignalingCode::LeCreditConnRequest,
            Self::LeCreditConnResponse(_) => SignalingCode::LeCreditConnResponse,
            Self::FlowControlCredit(_) => SignalingCode::FlowControlCredit,
        }
    }

    /// Decode the data of a command whose header was already parsed
    ///
    /// # Errors
    /// Returns `L2capError::UnknownCode` for codes this stack does not
    /// handle and `L2capError::InsufficientData` if the data is too short
    pub fn parse(header: &SignalingHeader, data: &[u8]) -> Result<Self, L2capError> {
        let code = SignalingCode::from_u8(header.code).ok_or(L2capError::UnknownCode(header.code))?;
        Ok(match code {
            SignalingCode::CommandReject => Self::CommandReject(CommandReject::from_bytes(data)?),
            SignalingCode::DisconnectionRequest => {
                Self::DisconnectionRequest(DisconnectionRequest::from_bytes(data)?)
            }
            SignalingCode::DisconnectionResponse => {
                Self::DisconnectionResponse(DisconnectionResponse::from_bytes(data)?)
            }
            SignalingCode::ConnParamUpdateRequest => {
                Self::ConnParamUpdateRequest(conn_params_from_bytes(data)?)
            }
            SignalingCode::ConnParamUpdateResponse => {
                let [r0, r1, ..] = *data else {
                    return Err(L2capError::InsufficientData);
                };
                Self::ConnParamUpdateResponse {
                    result: u16::from_le_bytes([r0, r1]),
                }
            }
            SignalingCode::LeCreditConnRequest => {
                Self::LeCreditConnRequest(LeCreditConnRequest::from_bytes(data)?)
            }
            SignalingCode::LeCreditConnResponse => {
                Self::LeCreditConnResponse(LeCreditConnResponse::from_bytes(data)?)
            }
            SignalingCode::FlowControlCredit => {
                Self::FlowControlCredit(FlowControlCredit::from_bytes(data)?)
            }
        })
    }

    /// Encode as a complete signaling PDU with `identifier`
    #[must_use]
    pub fn encode(&self, identifier: u8) -> Vec<u8, MAX_SIGNALING_PDU> {
        let mut data: Vec<u8, { LeCreditConnRequest::SIZE }> = Vec::new();
        // every payload below fits the largest command
        let _ = match self {
            Self::CommandReject(rej) => data
                .extend_from_slice(&rej.reason.to_le_bytes())
                .and_then(|()| match rej.cids {
                    Some((a, b)) => data.extend_from_slice(&le16_array::<2, 4>([a, b])),
                    None => Ok(()),
                }),
            Self::DisconnectionRequest(req) | Self::DisconnectionResponse(req) => {
                data.extend_from_slice(&req.to_bytes())
            }
            Self::ConnParamUpdateRequest(p) => data.extend_from_slice(&le16_array::<4, 8>([
                p.interval_min,
                p.interval_max,
                p.latency,
                p.timeout,
            ])),
            Self::ConnParamUpdateResponse { result } => {
                data.extend_from_slice(&result.to_le_bytes())
            }
            Self::LeCreditConnRequest(req) => data.extend_from_slice(&req.to_bytes()),
            Self::LeCreditConnResponse(rsp) => data.extend_from_slice(&rsp.to_bytes()),
            Self::FlowControlCredit(fc) => {
                data.extend_from_slice(&le16_array::<2, 4>([fc.cid, fc.credits]))
            }
        };

        #[allow(clippy::cast_possible_truncation)]
        let header = SignalingHeader {
            code: self.code() as u8,
            identifier,
            length: data.len() as u16,
        };
        let mut pdu = Vec::new();
        let _ = pdu.extend_from_slice(&header.to_bytes());
        let _ = pdu.extend_from_slice(&data);
        pdu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(pdu: &[u8]) -> Result<(SignalingHeader, SignalingCommand), L2capError> {
        let header = SignalingHeader::from_bytes(pdu)?;
        let command = SignalingCommand::parse(&header, &pdu[SignalingHeader::SIZE..])?;
        Ok((header, command))
    }

    #[test]
    fn test_le_credit_conn_request_layout() {
        let req = SignalingCommand::LeCreditConnRequest(LeCreditConnRequest {
            psm: 0x0080,
            source_cid: 0x0040,
            mtu: 256,
            mps: 247,
            initial_credits: 8,
        });
        let pdu = req.encode(3);
        assert_eq!(
            pdu.as_slice(),
            &[
                0x14, 0x03, 0x0A, 0x00, 0x80, 0x00, 0x40, 0x00, 0x00, 0x01, 0xF7, 0x00, 0x08,
                0x00
            ]
        );
        let (header, decoded) = decode(&pdu).unwrap();
        assert_eq!(header.identifier, 3);
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_conn_param_request_decode() {
        let pdu = [
            0x12, 0x01, 0x08, 0x00, 0x18, 0x00, 0x28, 0x00, 0x00, 0x00, 0x2A, 0x00,
        ];
        let (_, command) = decode(&pdu).unwrap();
        assert_eq!(
            command,
            SignalingCommand::ConnParamUpdateRequest(ConnParams {
                interval_min: 0x18,
                interval_max: 0x28,
                latency: 0,
                timeout: 0x2A,
            })
        );
    }

    #[test]
    fn test_invalid_cid_reject_carries_cids() {
        let reject = SignalingCommand::CommandReject(CommandReject {
            reason: reject::INVALID_CID,
            cids: Some((0x0040, 0x0041)),
        });
        let pdu = reject.encode(9);
        assert_eq!(
            pdu.as_slice(),
            &[0x01, 0x09, 0x06, 0x00, 0x02, 0x00, 0x40, 0x00, 0x41, 0x00]
        );
    }

    #[test]
    fn test_unknown_and_short_commands() {
        let header = SignalingHeader::from_bytes(&[0x0A, 0x01, 0x02, 0x00]).unwrap();
        assert_eq!(
            SignalingCommand::parse(&header, &[0x01, 0x00]),
            Err(L2capError::UnknownCode(0x0A))
        );

        let header = SignalingHeader::from_bytes(&[0x16, 0x01, 0x02, 0x00]).unwrap();
        assert_eq!(
            SignalingCommand::parse(&header, &[0x40, 0x00]),
            Err(L2capError::InsufficientData)
        );
    }

    #[test]
    fn test_conn_result_codes() {
        assert_eq!(LeConnResult::from_u16(0x0002), Some(LeConnResult::PsmNotSupported));
        assert_eq!(LeConnResult::from_u16(0x000B), Some(LeConnResult::UnacceptableParameters));
        assert_eq!(LeConnResult::from_u16(0x0003), None);
    }
}
