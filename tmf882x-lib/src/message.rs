//! Framed output messages.
//!
//! Every message the driver hands to a reader is length-prefixed:
//!
//! ```text
//! +--------+--------+------------------------+
//! | id u16 | len u16| payload (len - 4 bytes)|
//! +--------+--------+------------------------+
//! ```
//!
//! Both header fields are little endian and `len` counts the header itself, so a
//! reader can size its buffer from the first four bytes alone.

use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::constants::{MAX_MEAS_RESULTS, MAX_MSG_SIZE, MSG_HEADER_SIZE};
use crate::error::{Result, TofError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u16)]
pub enum MessageId {
    MeasResults = 0x0001,
    Error = 0x0002,

    #[num_enum(catch_all)]
    Unknown(u16),
}

/// Error codes carried by [`Message::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u32)]
pub enum ErrorCode {
    /// The output queue overflowed and was cleared; earlier messages were lost.
    BufOverflow = 1,
    /// The device reported a measurement error through its status register.
    Measurement = 2,

    #[num_enum(catch_all)]
    Unknown(u32),
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct MessageHeaderRaw {
    pub id: U16,
    pub len: U16,
}

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub id: MessageId,
    /// Total message size including the header
    pub length: u16,
}

/// Peek the header at the front of `bytes` without consuming anything.
///
/// Only the header is validated; the caller decides whether `length` bytes are
/// actually available.
pub fn decode_header(bytes: &[u8]) -> Result<MessageHeader> {
    let (raw, _) = MessageHeaderRaw::read_from_prefix(bytes).map_err(|_| {
        TofError::Format(format!(
            "header needs {} bytes, got {}",
            MSG_HEADER_SIZE,
            bytes.len()
        ))
    })?;
    let length = raw.len.get();
    if (length as usize) < MSG_HEADER_SIZE || length as usize > MAX_MSG_SIZE {
        return Err(TofError::Format(format!("message length {} out of range", length)));
    }
    Ok(MessageHeader {
        id: MessageId::from_primitive(raw.id.get()),
        length,
    })
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct MeasResultsRaw {
    pub result_num: u8,
    pub temperature: i8,
    pub num_results: u8,
    pub reserved: u8,
    pub ambient_light: U32,
    pub photon_count: U32,
    pub ref_photon_count: U32,
    pub sys_tick: U32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct MeasResultRaw {
    pub channel: u8,
    pub sub_capture: u8,
    pub confidence: u8,
    pub reserved: u8,
    pub distance_mm: U16,
}

const MEAS_RESULTS_SIZE: usize = size_of::<MeasResultsRaw>();
const MEAS_RESULT_SIZE: usize = size_of::<MeasResultRaw>();

/// One target detected on one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeasResult {
    pub channel: u8,
    /// Sub-capture index, non-zero only in time-multiplexed 8x8 operation
    pub sub_capture: u8,
    pub confidence: u8,
    pub distance_mm: u16,
}

/// A complete measurement cycle.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MeasResults {
    pub result_num: u8,
    pub temperature_c: i8,
    pub ambient_light: u32,
    pub photon_count: u32,
    pub ref_photon_count: u32,
    pub sys_tick: u32,
    pub results: Vec<MeasResult>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    MeasResults(MeasResults),
    Error(ErrorCode),
    /// A correctly framed message of a kind this crate does not interpret
    Unknown { id: u16, payload: Bytes },
}

impl Message {
    /// The record enqueued in front of new data after the queue overflowed.
    pub fn overflow() -> Self {
        Message::Error(ErrorCode::BufOverflow)
    }

    pub fn id(&self) -> MessageId {
        match self {
            Message::MeasResults(_) => MessageId::MeasResults,
            Message::Error(_) => MessageId::Error,
            Message::Unknown { id, .. } => MessageId::from_primitive(*id),
        }
    }

    /// Serialize header and payload.
    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::new();
        match self {
            Message::MeasResults(meas) => {
                let count = meas.results.len().min(MAX_MEAS_RESULTS);
                let head = MeasResultsRaw {
                    result_num: meas.result_num,
                    temperature: meas.temperature_c,
                    num_results: count as u8,
                    reserved: 0,
                    ambient_light: U32::new(meas.ambient_light),
                    photon_count: U32::new(meas.photon_count),
                    ref_photon_count: U32::new(meas.ref_photon_count),
                    sys_tick: U32::new(meas.sys_tick),
                };
                payload.extend_from_slice(head.as_bytes());
                for r in &meas.results[..count] {
                    let raw = MeasResultRaw {
                        channel: r.channel,
                        sub_capture: r.sub_capture,
                        confidence: r.confidence,
                        reserved: 0,
                        distance_mm: U16::new(r.distance_mm),
                    };
                    payload.extend_from_slice(raw.as_bytes());
                }
            }
            Message::Error(code) => payload.put_u32_le((*code).into()),
            Message::Unknown { payload: body, .. } => payload.extend_from_slice(body),
        }

        let header = MessageHeaderRaw {
            id: U16::new(self.id().into()),
            len: U16::new((MSG_HEADER_SIZE + payload.len()) as u16),
        };
        let mut out = BytesMut::with_capacity(MSG_HEADER_SIZE + payload.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&payload);
        out.freeze()
    }

    /// Parse exactly one message; `bytes` must hold the whole frame and nothing more.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = decode_header(bytes)?;
        if bytes.len() != header.length as usize {
            return Err(TofError::Format(format!(
                "frame claims {} bytes, got {}",
                header.length,
                bytes.len()
            )));
        }
        let payload = &bytes[MSG_HEADER_SIZE..];

        match header.id {
            MessageId::MeasResults => {
                let (head, rest) = MeasResultsRaw::read_from_prefix(payload)
                    .map_err(|_| TofError::Format("truncated measurement header".to_string()))?;
                let count = head.num_results as usize;
                if count > MAX_MEAS_RESULTS || rest.len() != count * MEAS_RESULT_SIZE {
                    return Err(TofError::Format(format!(
                        "measurement message with {} results has {} result bytes",
                        count,
                        rest.len()
                    )));
                }
                let results = rest
                    .chunks_exact(MEAS_RESULT_SIZE)
                    .filter_map(|chunk| MeasResultRaw::read_from_bytes(chunk).ok())
                    .map(|raw| MeasResult {
                        channel: raw.channel,
                        sub_capture: raw.sub_capture,
                        confidence: raw.confidence,
                        distance_mm: raw.distance_mm.get(),
                    })
                    .collect();
                Ok(Message::MeasResults(MeasResults {
                    result_num: head.result_num,
                    temperature_c: head.temperature,
                    ambient_light: head.ambient_light.get(),
                    photon_count: head.photon_count.get(),
                    ref_photon_count: head.ref_photon_count.get(),
                    sys_tick: head.sys_tick.get(),
                    results,
                }))
            }
            MessageId::Error => {
                let raw: [u8; 4] = payload
                    .try_into()
                    .map_err(|_| TofError::Format(format!("error record payload of {} bytes", payload.len())))?;
                Ok(Message::Error(ErrorCode::from_primitive(u32::from_le_bytes(raw))))
            }
            MessageId::Unknown(id) => Ok(Message::Unknown {
                id,
                payload: Bytes::copy_from_slice(payload),
            }),
        }
    }
}

/// Size of an encoded measurement message carrying `results` entries.
pub fn meas_results_size(results: usize) -> usize {
    MSG_HEADER_SIZE + MEAS_RESULTS_SIZE + results * MEAS_RESULT_SIZE
}
