//! Bootloader request/response schema.
//!
//! Structured messages travel as the payload of one serial frame. Every
//! request carries a `sequence_id` that the response mirrors, so the
//! client can correlate replies. The data path carries a CRC-32 over the
//! raw payload as a second integrity layer on top of the frame CRC16.
//!
//! Field tags (fixed, clients depend on them):
//!
//! ```text
//! Request      1=sequence_id 2=handshake 3=flash_prepare 4=data 5=flash_verify
//! Handshake    1=capabilities 2=max_packet_size
//! Prepare      1=total_data_length 2=verify_after_program
//! Data         1=offset 2=data 3=data_crc32 (fixed32)
//! Verify       1=verify_after_program
//! Response     1=sequence_id 2=result 3=handshake_ack 4=ack 5=flash_result
//! HandshakeAck 1=bootloader_version 2=supported_capabilities
//!              3=flash_page_size 4=target_flash_address
//! Ack          1=success 2=message
//! FlashResult  1=bytes_programmed 2=actual_data_length 3=verification_hash
//! ```

use heapless::{String, Vec};

use super::wire::{self, Field, Reader, Writer};

/// Maximum data bytes in one `Data` request.
pub const MAX_DATA: usize = 1024;
/// Capacity for capability and version strings.
pub const MAX_TEXT: usize = 64;

/// Scratch space for one encoded sub-message.
const SCRATCH: usize = MAX_DATA + 64;

/// CRC-32 (IEEE, reflected, init/xorout `0xFFFFFFFF`) over `data`.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CodecError {
    /// Wire-level failure (truncation, bad type, overflow).
    Malformed,
    /// A required field is absent.
    MissingField,
    /// A field exceeds its bounded capacity.
    TooLong,
    /// Output buffer exhausted.
    BufferFull,
}

impl From<wire::Error> for CodecError {
    fn from(err: wire::Error) -> Self {
        match err {
            wire::Error::BufferFull => CodecError::BufferFull,
            _ => CodecError::Malformed,
        }
    }
}

/// Result code mirrored into every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ResultCode {
    Success = 0,
    ErrorInvalidRequest = 1,
    ErrorDataCorruption = 2,
    ErrorFlashOperation = 3,
    ErrorCommunication = 4,
}

impl ResultCode {
    fn from_u64(value: u64) -> Option<Self> {
        Some(match value {
            0 => Self::Success,
            1 => Self::ErrorInvalidRequest,
            2 => Self::ErrorDataCorruption,
            3 => Self::ErrorFlashOperation,
            4 => Self::ErrorCommunication,
            _ => return None,
        })
    }
}

// - MARK: Requests

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub capabilities: String<MAX_TEXT>,
    pub max_packet_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prepare {
    pub total_data_length: u32,
    pub verify_after_program: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub offset: u32,
    pub data: Vec<u8, MAX_DATA>,
    pub data_crc32: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verify {
    pub verify_after_program: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Handshake(Handshake),
    Prepare(Prepare),
    Data(DataPacket),
    Verify(Verify),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub sequence_id: u32,
    pub kind: RequestKind,
}

impl Request {
    pub fn handshake(sequence_id: u32, capabilities: &str, max_packet_size: u32) -> Self {
        Self {
            sequence_id,
            kind: RequestKind::Handshake(Handshake {
                capabilities: String::try_from(capabilities).unwrap_or_default(),
                max_packet_size,
            }),
        }
    }

    pub fn prepare(sequence_id: u32, total_data_length: u32) -> Self {
        Self {
            sequence_id,
            kind: RequestKind::Prepare(Prepare {
                total_data_length,
                verify_after_program: false,
            }),
        }
    }

    pub fn data(sequence_id: u32, offset: u32, data: &[u8]) -> Self {
        Self {
            sequence_id,
            kind: RequestKind::Data(DataPacket {
                offset,
                data: Vec::from_slice(data).unwrap_or_default(),
                data_crc32: crc32(data),
            }),
        }
    }

    pub fn verify(sequence_id: u32) -> Self {
        Self {
            sequence_id,
            kind: RequestKind::Verify(Verify {
                verify_after_program: true,
            }),
        }
    }

    pub fn encode(&self, out: &mut [u8]) -> Result<usize, CodecError> {
        let mut scratch = [0u8; SCRATCH];
        let mut inner = Writer::new(&mut scratch);
        let tag = match &self.kind {
            RequestKind::Handshake(h) => {
                inner.string(1, &h.capabilities)?;
                inner.varint(2, h.max_packet_size as u64)?;
                2
            }
            RequestKind::Prepare(p) => {
                inner.varint(1, p.total_data_length as u64)?;
                inner.boolean(2, p.verify_after_program)?;
                3
            }
            RequestKind::Data(d) => {
                inner.varint(1, d.offset as u64)?;
                inner.bytes(2, &d.data)?;
                inner.fixed32(3, d.data_crc32)?;
                4
            }
            RequestKind::Verify(v) => {
                inner.boolean(1, v.verify_after_program)?;
                5
            }
        };
        let inner_len = inner.len();

        let mut w = Writer::new(out);
        w.varint(1, self.sequence_id as u64)?;
        w.bytes(tag, &scratch[..inner_len])?;
        Ok(w.len())
    }

    /// Decode a request.
    ///
    /// On failure the error carries the `sequence_id` when it was parsed
    /// far enough, so the engine can still address a reply.
    pub fn decode(payload: &[u8]) -> Result<Self, (Option<u32>, CodecError)> {
        let mut sequence_id = None;
        let mut kind = None;

        let mut reader = Reader::new(payload);
        loop {
            match reader.next() {
                Ok(Some((tag, field))) => match (tag, field) {
                    (1, Field::Varint(v)) => sequence_id = Some(v as u32),
                    (2, Field::Bytes(b)) => {
                        let h = decode_handshake(b).map_err(|e| (sequence_id, e))?;
                        kind = Some(RequestKind::Handshake(h));
                    }
                    (3, Field::Bytes(b)) => {
                        let p = decode_prepare(b).map_err(|e| (sequence_id, e))?;
                        kind = Some(RequestKind::Prepare(p));
                    }
                    (4, Field::Bytes(b)) => {
                        let d = decode_data(b).map_err(|e| (sequence_id, e))?;
                        kind = Some(RequestKind::Data(d));
                    }
                    (5, Field::Bytes(b)) => {
                        let v = decode_verify(b).map_err(|e| (sequence_id, e))?;
                        kind = Some(RequestKind::Verify(v));
                    }
                    _ => {}
                },
                Ok(None) => break,
                Err(e) => return Err((sequence_id, e.into())),
            }
        }

        let sequence_id = sequence_id.ok_or((None, CodecError::MissingField))?;
        let kind = kind.ok_or((Some(sequence_id), CodecError::MissingField))?;
        Ok(Self { sequence_id, kind })
    }
}

fn decode_handshake(bytes: &[u8]) -> Result<Handshake, CodecError> {
    let mut capabilities = String::new();
    let mut max_packet_size = None;
    let mut reader = Reader::new(bytes);
    while let Some((tag, field)) = reader.next()? {
        match (tag, field) {
            (1, Field::Bytes(b)) => {
                let text = core::str::from_utf8(b).map_err(|_| CodecError::Malformed)?;
                capabilities = String::try_from(text).map_err(|_| CodecError::TooLong)?;
            }
            (2, Field::Varint(v)) => max_packet_size = Some(v as u32),
            _ => {}
        }
    }
    Ok(Handshake {
        capabilities,
        max_packet_size: max_packet_size.ok_or(CodecError::MissingField)?,
    })
}

fn decode_prepare(bytes: &[u8]) -> Result<Prepare, CodecError> {
    let mut total = None;
    let mut verify_after = false;
    let mut reader = Reader::new(bytes);
    while let Some((tag, field)) = reader.next()? {
        match (tag, field) {
            (1, Field::Varint(v)) => total = Some(v as u32),
            (2, Field::Varint(v)) => verify_after = v != 0,
            _ => {}
        }
    }
    Ok(Prepare {
        total_data_length: total.ok_or(CodecError::MissingField)?,
        verify_after_program: verify_after,
    })
}

fn decode_data(bytes: &[u8]) -> Result<DataPacket, CodecError> {
    let mut offset = None;
    let mut data = None;
    let mut data_crc32 = None;
    let mut reader = Reader::new(bytes);
    while let Some((tag, field)) = reader.next()? {
        match (tag, field) {
            (1, Field::Varint(v)) => offset = Some(v as u32),
            (2, Field::Bytes(b)) => {
                data = Some(Vec::from_slice(b).map_err(|_| CodecError::TooLong)?);
            }
            (3, Field::Fixed32(v)) => data_crc32 = Some(v),
            _ => {}
        }
    }
    Ok(DataPacket {
        offset: offset.ok_or(CodecError::MissingField)?,
        data: data.ok_or(CodecError::MissingField)?,
        data_crc32: data_crc32.ok_or(CodecError::MissingField)?,
    })
}

fn decode_verify(bytes: &[u8]) -> Result<Verify, CodecError> {
    let mut verify_after = true;
    let mut reader = Reader::new(bytes);
    while let Some((tag, field)) = reader.next()? {
        if let (1, Field::Varint(v)) = (tag, field) {
            verify_after = v != 0;
        }
    }
    Ok(Verify {
        verify_after_program: verify_after,
    })
}

// - MARK: Responses

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeAck {
    pub bootloader_version: String<MAX_TEXT>,
    pub supported_capabilities: String<MAX_TEXT>,
    pub flash_page_size: u32,
    pub target_flash_address: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub success: bool,
    pub message: String<MAX_TEXT>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashResult {
    pub bytes_programmed: u32,
    pub actual_data_length: u32,
    /// CRC-32 of the programmed region, big-endian bytes.
    pub verification_hash: [u8; 4],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    HandshakeAck(HandshakeAck),
    Ack(Ack),
    FlashResult(FlashResult),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub sequence_id: u32,
    pub result: ResultCode,
    pub kind: ResponseKind,
}

impl Response {
    pub fn ack(sequence_id: u32, result: ResultCode, success: bool, message: &str) -> Self {
        Self {
            sequence_id,
            result,
            kind: ResponseKind::Ack(Ack {
                success,
                message: String::try_from(message).unwrap_or_default(),
            }),
        }
    }

    /// Reply for a request that decoded far enough to yield a sequence
    /// id but no valid body.
    pub fn invalid_request(sequence_id: u32) -> Self {
        Self::ack(
            sequence_id,
            ResultCode::ErrorInvalidRequest,
            false,
            "malformed request",
        )
    }

    pub fn encode(&self, out: &mut [u8]) -> Result<usize, CodecError> {
        let mut scratch = [0u8; SCRATCH];
        let mut inner = Writer::new(&mut scratch);
        let tag = match &self.kind {
            ResponseKind::HandshakeAck(h) => {
                inner.string(1, &h.bootloader_version)?;
                inner.string(2, &h.supported_capabilities)?;
                inner.varint(3, h.flash_page_size as u64)?;
                inner.varint(4, h.target_flash_address as u64)?;
                3
            }
            ResponseKind::Ack(a) => {
                inner.boolean(1, a.success)?;
                inner.string(2, &a.message)?;
                4
            }
            ResponseKind::FlashResult(f) => {
                inner.varint(1, f.bytes_programmed as u64)?;
                inner.varint(2, f.actual_data_length as u64)?;
                inner.bytes(3, &f.verification_hash)?;
                5
            }
        };
        let inner_len = inner.len();

        let mut w = Writer::new(out);
        w.varint(1, self.sequence_id as u64)?;
        w.varint(2, self.result as u64)?;
        w.bytes(tag, &scratch[..inner_len])?;
        Ok(w.len())
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut sequence_id = None;
        let mut result = None;
        let mut kind = None;

        let mut reader = Reader::new(payload);
        while let Some((tag, field)) = reader.next()? {
            match (tag, field) {
                (1, Field::Varint(v)) => sequence_id = Some(v as u32),
                (2, Field::Varint(v)) => {
                    result = Some(ResultCode::from_u64(v).ok_or(CodecError::Malformed)?);
                }
                (3, Field::Bytes(b)) => {
                    kind = Some(ResponseKind::HandshakeAck(decode_handshake_ack(b)?));
                }
                (4, Field::Bytes(b)) => kind = Some(ResponseKind::Ack(decode_ack(b)?)),
                (5, Field::Bytes(b)) => {
                    kind = Some(ResponseKind::FlashResult(decode_flash_result(b)?));
                }
                _ => {}
            }
        }

        Ok(Self {
            sequence_id: sequence_id.ok_or(CodecError::MissingField)?,
            result: result.ok_or(CodecError::MissingField)?,
            kind: kind.ok_or(CodecError::MissingField)?,
        })
    }
}

fn decode_text(bytes: &[u8]) -> Result<String<MAX_TEXT>, CodecError> {
    let text = core::str::from_utf8(bytes).map_err(|_| CodecError::Malformed)?;
    String::try_from(text).map_err(|_| CodecError::TooLong)
}

fn decode_handshake_ack(bytes: &[u8]) -> Result<HandshakeAck, CodecError> {
    let mut ack = HandshakeAck {
        bootloader_version: String::new(),
        supported_capabilities: String::new(),
        flash_page_size: 0,
        target_flash_address: 0,
    };
    let mut reader = Reader::new(bytes);
    while let Some((tag, field)) = reader.next()? {
        match (tag, field) {
            (1, Field::Bytes(b)) => ack.bootloader_version = decode_text(b)?,
            (2, Field::Bytes(b)) => ack.supported_capabilities = decode_text(b)?,
            (3, Field::Varint(v)) => ack.flash_page_size = v as u32,
            (4, Field::Varint(v)) => ack.target_flash_address = v as u32,
            _ => {}
        }
    }
    Ok(ack)
}

fn decode_ack(bytes: &[u8]) -> Result<Ack, CodecError> {
    let mut success = false;
    let mut message = String::new();
    let mut reader = Reader::new(bytes);
    while let Some((tag, field)) = reader.next()? {
        match (tag, field) {
            (1, Field::Varint(v)) => success = v != 0,
            (2, Field::Bytes(b)) => message = decode_text(b)?,
            _ => {}
        }
    }
    Ok(Ack { success, message })
}

fn decode_flash_result(bytes: &[u8]) -> Result<FlashResult, CodecError> {
    let mut result = FlashResult {
        bytes_programmed: 0,
        actual_data_length: 0,
        verification_hash: [0; 4],
    };
    let mut reader = Reader::new(bytes);
    while let Some((tag, field)) = reader.next()? {
        match (tag, field) {
            (1, Field::Varint(v)) => result.bytes_programmed = v as u32,
            (2, Field::Varint(v)) => result.actual_data_length = v as u32,
            (3, Field::Bytes(b)) => {
                if b.len() != 4 {
                    return Err(CodecError::Malformed);
                }
                result.verification_hash.copy_from_slice(b);
            }
            _ => {}
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_known_vector() {
        // CRC-32 (IEEE) check value
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(&[]), 0x0000_0000);
    }

    #[test]
    fn request_round_trips() {
        let requests = [
            Request::handshake(1, "flash_program", 256),
            Request::prepare(2, 16),
            Request::data(3, 0, &[0xAA, 0xBB, 0xCC]),
            Request::verify(4),
        ];
        for request in &requests {
            let mut buf = [0u8; 2048];
            let n = request.encode(&mut buf).unwrap();
            let decoded = Request::decode(&buf[..n]).unwrap();
            assert_eq!(&decoded, request);
        }
    }

    #[test]
    fn response_round_trips() {
        let responses = [
            Response {
                sequence_id: 1,
                result: ResultCode::Success,
                kind: ResponseKind::HandshakeAck(HandshakeAck {
                    bootloader_version: String::try_from("4.7.0").unwrap(),
                    supported_capabilities: String::try_from("flash_program").unwrap(),
                    flash_page_size: 2048,
                    target_flash_address: 0x0801_0000,
                }),
            },
            Response::ack(2, ResultCode::Success, true, ""),
            Response {
                sequence_id: 3,
                result: ResultCode::Success,
                kind: ResponseKind::FlashResult(FlashResult {
                    bytes_programmed: 16,
                    actual_data_length: 13,
                    verification_hash: [0xDE, 0xAD, 0xBE, 0xEF],
                }),
            },
        ];
        for response in &responses {
            let mut buf = [0u8; 512];
            let n = response.encode(&mut buf).unwrap();
            let decoded = Response::decode(&buf[..n]).unwrap();
            assert_eq!(&decoded, response);
        }
    }

    #[test]
    fn decode_recovers_sequence_id_from_bad_body() {
        // sequence_id followed by an unparseable handshake body.
        let mut buf = [0u8; 64];
        let mut w = Writer::new(&mut buf);
        w.varint(1, 7).unwrap();
        w.bytes(2, &[0xFF, 0xFF]).unwrap();
        let n = w.len();

        let err = Request::decode(&buf[..n]).unwrap_err();
        assert_eq!(err.0, Some(7));
    }

    #[test]
    fn decode_without_body_is_missing_field() {
        let mut buf = [0u8; 16];
        let mut w = Writer::new(&mut buf);
        w.varint(1, 9).unwrap();
        let n = w.len();
        assert_eq!(
            Request::decode(&buf[..n]),
            Err((Some(9), CodecError::MissingField))
        );

        assert_eq!(Request::decode(&[]), Err((None, CodecError::MissingField)));
    }

    #[test]
    fn unknown_fields_are_skipped() {
        let mut buf = [0u8; 64];
        let mut w = Writer::new(&mut buf);
        w.varint(1, 5).unwrap();
        w.string(9, "future").unwrap();
        let mut inner = [0u8; 16];
        let mut iw = Writer::new(&mut inner);
        iw.boolean(1, true).unwrap();
        let inner_len = iw.len();
        w.bytes(5, &inner[..inner_len]).unwrap();
        let n = w.len();

        let decoded = Request::decode(&buf[..n]).unwrap();
        assert_eq!(decoded.sequence_id, 5);
        assert!(matches!(decoded.kind, RequestKind::Verify(_)));
    }
}
