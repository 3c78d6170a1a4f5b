//! Byte-level helpers shared by the model types and the segment wire record:
//! big-endian scalars, packed gap id arrays, and a 32-bit Gorilla XOR codec.

use crate::error::CoreError;

use std::io::Read;

pub fn write_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_be_bytes());
}
pub fn write_f32(buf: &mut Vec<u8>, v: f32) {
    buf.extend_from_slice(&v.to_be_bytes());
}
pub fn write_f64(buf: &mut Vec<u8>, v: f64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub fn read_f32<R: Read>(r: &mut R) -> Result<f32, CoreError> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(f32::from_be_bytes(b))
}
pub fn read_f64<R: Read>(r: &mut R) -> Result<f64, CoreError> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(f64::from_be_bytes(b))
}

/// Packs ids as consecutive big-endian `i32`s. An empty slice packs to an empty array.
pub fn ints_to_bytes(ints: &[i32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ints.len() * 4);
    for &i in ints {
        write_i32(&mut buf, i);
    }
    buf
}

/// Inverse of [`ints_to_bytes`].
pub fn bytes_to_ints(bytes: &[u8]) -> Result<Vec<i32>, CoreError> {
    if bytes.len() % 4 != 0 {
        return Err(CoreError::Serialization(format!(
            "Packed id array has length {} which is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| i32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// True if `v` survives a round trip through `f32` unchanged.
#[inline]
pub fn fits_in_f32(v: f64) -> bool {
    (v as f32) as f64 == v
}

struct BitWriter<'a> {
    out: &'a mut Vec<u8>,
    cur: u8,
    used: u8,
}

impl<'a> BitWriter<'a> {
    fn new(out: &'a mut Vec<u8>) -> Self {
        Self {
            out,
            cur: 0,
            used: 0,
        }
    }

    fn push_bit(&mut self, bit: bool) {
        let b = if bit { 1u8 } else { 0u8 };
        self.cur |= b << (7 - self.used);
        self.used += 1;
        if self.used == 8 {
            self.out.push(self.cur);
            self.cur = 0;
            self.used = 0;
        }
    }

    fn push_bits(&mut self, mut v: u32, count: u8) {
        if count == 0 {
            return;
        }
        if count < 32 {
            v &= (1u32 << count) - 1;
        }
        for i in (0..count).rev() {
            self.push_bit(((v >> i) & 1) == 1);
        }
    }

    fn finish(self) {
        if self.used > 0 {
            self.out.push(self.cur);
        }
    }
}

struct BitReader<'a, R: Read> {
    r: &'a mut R,
    cur: u8,
    left: u8,
}

impl<'a, R: Read> BitReader<'a, R> {
    fn new(r: &'a mut R) -> Self {
        Self { r, cur: 0, left: 0 }
    }

    fn read_bit(&mut self) -> Result<bool, CoreError> {
        if self.left == 0 {
            let mut b = [0u8; 1];
            self.r.read_exact(&mut b)?;
            self.cur = b[0];
            self.left = 8;
        }
        let bit = (self.cur & (1u8 << (self.left - 1))) != 0;
        self.left -= 1;
        Ok(bit)
    }

    fn read_bits(&mut self, count: u8) -> Result<u32, CoreError> {
        let mut out = 0u32;
        for _ in 0..count {
            out <<= 1;
            out |= if self.read_bit()? { 1 } else { 0 };
        }
        Ok(out)
    }
}

/// Gorilla-style XOR encoding of 32-bit float patterns.
///
/// Layout: first value verbatim (4 bytes, big-endian), then per value a `0` bit when it
/// equals its predecessor, `10` + significant bits when the previous leading/trailing
/// window still fits, or `11` + 5 bits leading zeros + 5 bits (significant bits - 1) +
/// significant bits.
pub fn encode_gorilla_xor_u32(values: &[u32], out: &mut Vec<u8>) -> Result<(), CoreError> {
    if values.is_empty() {
        return Err(CoreError::Internal(
            "Cannot Gorilla-encode empty values".to_string(),
        ));
    }
    out.extend_from_slice(&values[0].to_be_bytes());
    let mut bw = BitWriter::new(out);

    let mut prev = values[0];
    let mut prev_leading: u8 = 0;
    let mut prev_trailing: u8 = 0;
    let mut prev_sigbits: u8 = 0;

    for &cur in &values[1..] {
        let x = prev ^ cur;
        if x == 0 {
            bw.push_bit(false);
        } else {
            bw.push_bit(true);
            let leading = x.leading_zeros() as u8;
            let trailing = x.trailing_zeros() as u8;
            let sigbits = 32u8 - leading - trailing;

            if prev_sigbits != 0 && leading >= prev_leading && trailing >= prev_trailing {
                bw.push_bit(false);
                bw.push_bits(x >> prev_trailing, prev_sigbits);
            } else {
                bw.push_bit(true);
                bw.push_bits(leading as u32, 5);
                bw.push_bits((sigbits - 1) as u32, 5);
                bw.push_bits(x >> trailing, sigbits);
                prev_leading = leading;
                prev_trailing = trailing;
                prev_sigbits = sigbits;
            }
        }
        prev = cur;
    }
    bw.finish();
    Ok(())
}

pub fn decode_gorilla_xor_u32<R: Read>(r: &mut R, count: usize) -> Result<Vec<u32>, CoreError> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let mut first = [0u8; 4];
    r.read_exact(&mut first)?;
    let first = u32::from_be_bytes(first);
    let mut out = Vec::with_capacity(count);
    out.push(first);
    let mut br = BitReader::new(r);

    let mut prev = first;
    let mut prev_trailing: u8 = 0;
    let mut prev_sigbits: u8 = 0;

    for _ in 1..count {
        if !br.read_bit()? {
            out.push(prev);
            continue;
        }
        let (sigbits, trailing) = if !br.read_bit()? {
            if prev_sigbits == 0 {
                return Err(CoreError::Serialization(
                    "Gorilla reuse window before initialization".to_string(),
                ));
            }
            (prev_sigbits, prev_trailing)
        } else {
            let leading = br.read_bits(5)? as u8;
            let sigbits = br.read_bits(5)? as u8 + 1;
            if leading as u32 + sigbits as u32 > 32 {
                return Err(CoreError::Serialization(
                    "Invalid Gorilla bit widths".to_string(),
                ));
            }
            let trailing = 32 - leading - sigbits;
            prev_trailing = trailing;
            prev_sigbits = sigbits;
            (sigbits, trailing)
        };

        let cur = prev ^ (br.read_bits(sigbits)? << trailing);
        out.push(cur);
        prev = cur;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gap_ids_pack_big_endian() {
        let bytes = ints_to_bytes(&[1, 256, -3]);
        assert_eq!(&bytes[0..4], &[0, 0, 0, 1]);
        assert_eq!(&bytes[4..8], &[0, 0, 1, 0]);
        assert_eq!(bytes_to_ints(&bytes).unwrap(), vec![1, 256, -3]);
        assert!(ints_to_bytes(&[]).is_empty());
    }

    #[test]
    fn truncated_id_array_is_rejected() {
        assert!(matches!(
            bytes_to_ints(&[0, 0, 1]),
            Err(CoreError::Serialization(_))
        ));
    }

    #[test]
    fn gorilla_is_bit_exact() {
        let values: Vec<u32> = [1.0f32, 5.0, 5.0, -0.0, f32::MIN_POSITIVE, 3.25, 1.0e30, 1.0]
            .iter()
            .map(|v| v.to_bits())
            .collect();
        let mut buf = Vec::new();
        encode_gorilla_xor_u32(&values, &mut buf).unwrap();
        let decoded = decode_gorilla_xor_u32(&mut std::io::Cursor::new(&buf), values.len()).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn repeated_values_cost_one_bit_each() {
        let values = vec![1.0f32.to_bits(); 9];
        let mut buf = Vec::new();
        encode_gorilla_xor_u32(&values, &mut buf).unwrap();
        // 4 bytes for the first value and 8 zero bits for the repeats.
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn f32_fit_uses_exact_equality() {
        assert!(fits_in_f32(0.5));
        assert!(!fits_in_f32(0.1));
    }
}
