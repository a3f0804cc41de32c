//! Sample type codes reported by the gather server

use byteorder::{BigEndian, ByteOrder};
use ndarray::Array2;

pub const START_MASK: u16 = 0xF800;
pub const BIT_MASK: u16 = 0x07FF;

/// How one gathered address is stored in a sample line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatherType {
    Uint32,
    Int32,
    /// Stored in a 4-byte word, low 24 bits significant
    Uint24,
    /// Stored in a 4-byte word, sign-extended from bit 23
    Int24,
    Float,
    Double,
    Ubits,
    Sbits,
    /// Bit field of a 32-bit word, described by an undocumented type code
    Bits { start: u32, count: u32 },
}

impl GatherType {
    pub fn from_code(code: u16) -> Self {
        match code {
            0 => GatherType::Uint32,
            1 => GatherType::Int32,
            2 => GatherType::Uint24,
            3 => GatherType::Int24,
            4 => GatherType::Float,
            5 => GatherType::Double,
            6 => GatherType::Ubits,
            7 => GatherType::Sbits,
            _ => GatherType::Bits {
                start: ((code & START_MASK) >> 11) as u32,
                count: 32 - ((code & BIT_MASK) >> 6) as u32,
            },
        }
    }

    pub fn size(&self) -> usize {
        match self {
            GatherType::Double => 8,
            _ => 4,
        }
    }

    /// Decode one value; `bytes` must hold at least [`GatherType::size`] bytes
    pub fn decode(&self, bytes: &[u8]) -> f64 {
        match self {
            GatherType::Uint32 | GatherType::Ubits | GatherType::Sbits => {
                BigEndian::read_u32(bytes) as f64
            }
            GatherType::Int32 => BigEndian::read_i32(bytes) as f64,
            GatherType::Uint24 => (BigEndian::read_u32(bytes) & 0x00FF_FFFF) as f64,
            GatherType::Int24 => {
                let extension = if bytes[1] & 0x80 != 0 { 0xFF } else { 0x00 };
                BigEndian::read_i32(&[extension, bytes[1], bytes[2], bytes[3]]) as f64
            }
            GatherType::Float => BigEndian::read_f32(bytes) as f64,
            GatherType::Double => BigEndian::read_f64(bytes),
            GatherType::Bits { start, count } => {
                let word = BigEndian::read_u32(bytes) as u64;
                let mask = (1u64 << count) - 1;
                ((word >> start) & mask) as f64
            }
        }
    }
}

/// De-interleave packed sample lines into one row per address
///
/// The result has shape `(types.len(), lines)`. Trailing bytes that do not
/// make up a whole line are ignored.
pub fn decode_columns(types: &[GatherType], raw: &[u8]) -> Array2<f64> {
    let line_size: usize = types.iter().map(GatherType::size).sum();
    if line_size == 0 {
        return Array2::zeros((types.len(), 0));
    }

    let lines = raw.len() / line_size;
    let mut columns = Array2::zeros((types.len(), lines));

    for (line, chunk) in raw.chunks_exact(line_size).enumerate() {
        let mut offset = 0;
        for (item, ty) in types.iter().enumerate() {
            columns[[item, line]] = ty.decode(&chunk[offset..offset + ty.size()]);
            offset += ty.size();
        }
    }

    columns
}
