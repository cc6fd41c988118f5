//! RAM-patch images.
//!
//! Patches ship as Intel HEX text. Anything that does not start with a record
//! mark is treated as a raw binary loaded at RAM address 0.

use crate::error::{Result, TofError};

const RECORD_DATA: u8 = 0x00;
const RECORD_EOF: u8 = 0x01;
const RECORD_EXT_SEGMENT: u8 = 0x02;
const RECORD_START_SEGMENT: u8 = 0x03;
const RECORD_EXT_LINEAR: u8 = 0x04;
const RECORD_START_LINEAR: u8 = 0x05;

/// Contiguous bytes destined for one RAM address range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub address: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FirmwareImage {
    segments: Vec<Segment>,
}

impl FirmwareImage {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        match bytes.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b':') => {
                let text = std::str::from_utf8(bytes)
                    .map_err(|_| TofError::Format("Intel HEX image is not ASCII".to_string()))?;
                Self::from_ihex(text)
            }
            Some(_) => Ok(Self::from_binary(bytes, 0)),
            None => Err(TofError::Format("empty firmware image".to_string())),
        }
    }

    pub fn from_binary(data: &[u8], address: u32) -> Self {
        Self {
            segments: vec![Segment {
                address,
                data: data.to_vec(),
            }],
        }
    }

    pub fn from_ihex(text: &str) -> Result<Self> {
        let mut image = FirmwareImage::default();
        let mut base: u32 = 0;

        for (lineno, line) in text.lines().enumerate().map(|(i, l)| (i + 1, l.trim())) {
            if line.is_empty() {
                continue;
            }
            let body = line
                .strip_prefix(':')
                .ok_or_else(|| TofError::Format(format!("line {}: missing record mark", lineno)))?;
            let record =
                hex::decode(body).map_err(|e| TofError::Format(format!("line {}: {}", lineno, e)))?;
            if record.len() < 5 || record.len() != record[0] as usize + 5 {
                return Err(TofError::Format(format!("line {}: bad record length", lineno)));
            }
            if record.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)) != 0 {
                return Err(TofError::Format(format!("line {}: checksum mismatch", lineno)));
            }

            let offset = u16::from_be_bytes([record[1], record[2]]) as u32;
            let data = &record[4..record.len() - 1];
            match record[3] {
                RECORD_DATA => image.append(base.wrapping_add(offset), data),
                RECORD_EOF => return Ok(image),
                RECORD_EXT_SEGMENT | RECORD_EXT_LINEAR if data.len() == 2 => {
                    let value = u16::from_be_bytes([data[0], data[1]]) as u32;
                    base = if record[3] == RECORD_EXT_SEGMENT { value << 4 } else { value << 16 };
                }
                RECORD_START_SEGMENT | RECORD_START_LINEAR => {}
                other => {
                    return Err(TofError::Format(format!(
                        "line {}: unsupported record type {:#04x}",
                        lineno, other
                    )));
                }
            }
        }
        Err(TofError::Format("missing end-of-file record".to_string()))
    }

    fn append(&mut self, address: u32, data: &[u8]) {
        if let Some(last) = self.segments.last_mut() {
            if last.address.wrapping_add(last.data.len() as u32) == address {
                last.data.extend_from_slice(data);
                return;
            }
        }
        self.segments.push(Segment {
            address,
            data: data.to_vec(),
        });
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Total payload bytes over all segments.
    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.data.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
