//! Wire format of the fast gather server
//!
//! Every response is a frame: a big-endian `u32` length (counting the code
//! byte), a one-byte code, then the payload.

use crate::error::PmacError;
use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use log::debug;
use std::io::{Read, Write};

pub const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

/// Commands understood by the server, each sent as one line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Types,
    Data,
    All,
    Servo,
    Phase,
}

impl Request {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Request::Types => b"types\n",
            Request::Data => b"data\n",
            Request::All => b"all\n",
            Request::Servo => b"servo\n",
            Request::Phase => b"phase\n",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCode {
    Types,
    Data,
    Ack,
    Error,
}

impl FrameCode {
    pub fn byte(&self) -> u8 {
        match self {
            FrameCode::Types => b'T',
            FrameCode::Data => b'D',
            FrameCode::Ack => b'K',
            FrameCode::Error => b'E',
        }
    }
}

pub fn write_request(writer: &mut dyn Write, request: Request) -> Result<(), PmacError> {
    debug!("fast gather -> {:?}", request);
    writer
        .write_all(request.as_bytes())
        .and_then(|_| writer.flush())
        .map_err(|source| PmacError::Io {
            source,
            context: format!("Sending {request:?} request"),
        })
}

/// Read one frame and return its payload
///
/// An `E` frame becomes `PmacError::Gather` carrying the server's code. Any
/// code other than `expected` is a protocol violation.
pub fn read_frame(reader: &mut dyn Read, expected: FrameCode) -> Result<Vec<u8>, PmacError> {
    let length = reader
        .read_u32::<BigEndian>()
        .map_err(|source| PmacError::Io {
            source,
            context: "Reading frame length".to_string(),
        })? as usize;

    if length == 0 {
        return Err(PmacError::Protocol("Empty frame".to_string()));
    }
    if length > MAX_FRAME_SIZE {
        return Err(PmacError::Protocol(format!(
            "Frame size {} exceeds maximum {}",
            length, MAX_FRAME_SIZE
        )));
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).map_err(|source| PmacError::Io {
        source,
        context: format!("Reading {length} byte frame"),
    })?;

    let code = body[0];
    let payload = body.split_off(1);
    debug!("fast gather <- {:?} ({} bytes)", code as char, payload.len());

    if code == FrameCode::Error.byte() {
        if payload.len() < 4 {
            return Err(PmacError::Protocol("Truncated error frame".to_string()));
        }
        return Err(PmacError::Gather {
            code: BigEndian::read_u32(&payload[..4]),
        });
    }

    if code != expected.byte() {
        return Err(PmacError::Protocol(format!(
            "Unexpected code {:?} (expected {:?})",
            code as char,
            expected.byte() as char
        )));
    }

    Ok(payload)
}

/// `T` payload: item count, then one big-endian `u16` type code per item
pub fn parse_types(payload: &[u8]) -> Result<Vec<u16>, PmacError> {
    let (&count, codes) = payload
        .split_first()
        .ok_or_else(|| PmacError::Protocol("Empty types frame".to_string()))?;
    let count = count as usize;

    if codes.len() < count * 2 {
        return Err(PmacError::Protocol(format!(
            "Types frame lists {} items but carries {} bytes",
            count,
            codes.len()
        )));
    }

    Ok(codes
        .chunks_exact(2)
        .take(count)
        .map(BigEndian::read_u16)
        .collect())
}

/// `D` payload: sample count, then the packed sample bytes
pub fn parse_data(payload: &[u8]) -> Result<(u32, &[u8]), PmacError> {
    if payload.len() < 4 {
        return Err(PmacError::Protocol("Truncated data frame".to_string()));
    }
    Ok((BigEndian::read_u32(&payload[..4]), &payload[4..]))
}
