use crate::error::{ErrorType, NetworkError, NetworkResult};
use crate::wire::{SizedRead, SizedWrite};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

/// Longest short string on the wire; longer inputs are truncated.
pub const STRING8_MAX_SIZE: usize = 255;

/// Commands whose total length would not fit the single length octet switch
/// to the extended form: the 0xFF sentinel followed by a u16.
pub const CMD_LEN_SENTINEL: u8 = 0xFF;

/// Total wire length of a command with `data_len` octets of payload after
/// the id and the length field. The framing grows from 2 to 4 octets once
/// the single-octet length can no longer hold the total.
#[inline]
pub fn cmd_total_len(data_len: usize) -> usize {
    if 1 + 1 + data_len < usize::from(CMD_LEN_SENTINEL) {
        1 + 1 + data_len
    } else {
        1 + 3 + data_len
    }
}

/// Packs a command length, choosing the short or extended encoding.
/// Returns the number of octets written.
pub fn pack_cmd_len<W: SizedWrite>(stream: &mut W, total: usize) -> NetworkResult<usize> {
    if total < usize::from(CMD_LEN_SENTINEL) {
        if stream.free_capacity() < 1 {
            return Err(NetworkError::Wait);
        }
        stream.write_u8(total as u8)?;
        Ok(1)
    } else {
        if total > u16::max_value() as usize {
            return Err(NetworkError::Fatal(ErrorType::CommandTooLarge));
        }
        if stream.free_capacity() < 3 {
            return Err(NetworkError::Wait);
        }
        stream.write_u8(CMD_LEN_SENTINEL)?;
        stream.write_u16::<BigEndian>(total as u16)?;
        Ok(3)
    }
}

/// Unpacks a command length. Returns (total command length, octets consumed
/// by the length field itself).
pub fn unpack_cmd_len<R: SizedRead>(stream: &mut R) -> NetworkResult<(usize, usize)> {
    if stream.remaining_data() < 1 {
        return Err(NetworkError::Fatal(ErrorType::BufferTooSmall));
    }

    let first = stream.read_u8()?;

    if first != CMD_LEN_SENTINEL {
        return Ok((usize::from(first), 1));
    }

    if stream.remaining_data() < 2 {
        return Err(NetworkError::Fatal(ErrorType::BufferTooSmall));
    }

    Ok((usize::from(stream.read_u16::<BigEndian>()?), 3))
}

/// Packs a short string: u8 length followed by the octets, no terminator on
/// the wire. Returns the number of octets written.
pub fn pack_string8<W: SizedWrite>(stream: &mut W, value: &str) -> NetworkResult<usize> {
    let len = value.len().min(STRING8_MAX_SIZE);

    if stream.free_capacity() < 1 + len {
        return Err(NetworkError::Wait);
    }

    stream.write_u8(len as u8)?;
    stream.write_all(&value.as_bytes()[..len])?;

    Ok(1 + len)
}

/// Unpacks a short string, validating the announced length against the
/// remaining buffer before indexing.
pub fn unpack_string8<R: SizedRead>(stream: &mut R) -> NetworkResult<String> {
    if stream.remaining_data() < 1 {
        return Err(NetworkError::Fatal(ErrorType::BufferTooSmall));
    }

    let len = usize::from(stream.read_u8()?);

    if stream.remaining_data() < len {
        return Err(NetworkError::Fatal(ErrorType::BadLength));
    }

    let mut octets = vec![0u8; len];
    stream.read_exact(&mut octets)?;

    Ok(String::from_utf8_lossy(&octets).into_owned())
}

/// Wire size of a short string.
#[inline]
pub fn string8_len(value: &str) -> usize {
    1 + value.len().min(STRING8_MAX_SIZE)
}

/// Packs a half-precision float as its 16-bit big-endian representation.
pub fn pack_f16<W: SizedWrite>(stream: &mut W, value: f32) -> NetworkResult<usize> {
    if stream.free_capacity() < 2 {
        return Err(NetworkError::Wait);
    }

    stream.write_u16::<BigEndian>(f32_to_f16_bits(value))?;
    Ok(2)
}

/// Unpacks a half-precision float.
pub fn unpack_f16<R: SizedRead>(stream: &mut R) -> NetworkResult<f32> {
    if stream.remaining_data() < 2 {
        return Err(NetworkError::Fatal(ErrorType::BufferTooSmall));
    }

    Ok(f16_bits_to_f32(stream.read_u16::<BigEndian>()?))
}

/// f32 → binary16 with round-to-nearest; overflow saturates to infinity,
/// NaN keeps a non-zero payload.
pub fn f32_to_f16_bits(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xFF) as i32;
    let man = bits & 0x007F_FFFF;

    if exp == 0xFF {
        let payload = ((man >> 13) & 0x03FF) as u16;
        let payload = if man != 0 && payload == 0 { 1 } else { payload };
        return sign | 0x7C00 | payload;
    }

    let unbiased = exp - 127;

    if unbiased > 15 {
        return sign | 0x7C00;
    }

    if unbiased >= -14 {
        let exp16 = (unbiased + 15) as u16;
        let man16 = (man >> 13) as u16;
        let round = ((man >> 12) & 1) as u16;
        // A mantissa carry overflows into the exponent, which is the
        // correct rounded result.
        return (sign | (exp16 << 10) | man16) + round;
    }

    if unbiased >= -24 {
        let full = 0x0080_0000 | man;
        let shift = (-1 - unbiased) as u32;
        let man16 = (full >> shift) as u16;
        let round = ((full >> (shift - 1)) & 1) as u16;
        return sign | (man16 + round);
    }

    sign
}

/// binary16 → f32, exact.
pub fn f16_bits_to_f32(bits: u16) -> f32 {
    let sign = u32::from(bits & 0x8000) << 16;
    let exp = (bits >> 10) & 0x1F;
    let man = u32::from(bits & 0x03FF);

    let bits32 = match (exp, man) {
        (0, 0) => sign,
        (0, _) => {
            let mut exp32 = 127 - 15 + 1;
            let mut man32 = man;
            while man32 & 0x0400 == 0 {
                man32 <<= 1;
                exp32 -= 1;
            }
            sign | ((exp32 as u32) << 23) | ((man32 & 0x03FF) << 13)
        }
        (0x1F, 0) => sign | 0x7F80_0000,
        (0x1F, _) => sign | 0x7F80_0000 | (man << 13),
        (_, _) => sign | ((u32::from(exp) + 127 - 15) << 23) | (man << 13),
    };

    f32::from_bits(bits32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_integer_roundtrip() {
        let mut buffer = [0u8; 64];
        {
            let mut stream = Cursor::new(&mut buffer[..]);
            stream.write_u8(23).unwrap();
            stream.write_u16::<BigEndian>(0xCAFE).unwrap();
            stream.write_u32::<BigEndian>(0xDEAD_BEEF).unwrap();
            stream.write_u64::<BigEndian>(0x0123_4567_89AB_CDEF).unwrap();
        }

        let mut stream = Cursor::new(&buffer[..]);
        assert_eq!(stream.read_u8().unwrap(), 23);
        assert_eq!(stream.read_u16::<BigEndian>().unwrap(), 0xCAFE);
        assert_eq!(stream.read_u32::<BigEndian>().unwrap(), 0xDEAD_BEEF);
        assert_eq!(stream.read_u64::<BigEndian>().unwrap(), 0x0123_4567_89AB_CDEF);
    }

    #[test]
    fn test_real64_vectors() {
        // Byte-exact IEEE representations on the wire.
        let vectors: [(f64, u64); 5] = [
            (0.0, 0x0000_0000_0000_0000),
            (1.0, 0x3FF0_0000_0000_0000),
            (2.0, 0x4000_0000_0000_0000),
            (-2.0, 0xC000_0000_0000_0000),
            (1.0 / 3.0, 0x3FD5_5555_5555_5555),
        ];

        for &(value, expected) in &vectors {
            let mut buffer = [0u8; 8];
            {
                let mut stream = Cursor::new(&mut buffer[..]);
                stream.write_f64::<BigEndian>(value).unwrap();
            }

            let mut stream = Cursor::new(&buffer[..]);
            assert_eq!(stream.read_u64::<BigEndian>().unwrap(), expected);

            let mut stream = Cursor::new(&buffer[..]);
            assert_eq!(stream.read_f64::<BigEndian>().unwrap(), value);
        }
    }

    #[test]
    fn test_real32_roundtrip() {
        for &value in &[0.0f32, 1.0, -1.5, 0.333_333_34, 65504.0] {
            let mut buffer = [0u8; 4];
            {
                let mut stream = Cursor::new(&mut buffer[..]);
                stream.write_f32::<BigEndian>(value).unwrap();
            }
            let mut stream = Cursor::new(&buffer[..]);
            assert_eq!(stream.read_f32::<BigEndian>().unwrap(), value);
        }
    }

    #[test]
    fn test_real16_roundtrip_representable() {
        for &value in &[0.0f32, 0.5, 1.0, -2.5, 1024.0, 65504.0, -0.125] {
            let mut buffer = [0u8; 2];
            {
                let mut stream = Cursor::new(&mut buffer[..]);
                pack_f16(&mut stream, value).unwrap();
            }
            let mut stream = Cursor::new(&buffer[..]);
            assert_eq!(unpack_f16(&mut stream).unwrap(), value);
        }
    }

    #[test]
    fn test_real16_overflow_saturates() {
        assert_eq!(f32_to_f16_bits(1.0e9), 0x7C00);
        assert_eq!(f32_to_f16_bits(-1.0e9), 0xFC00);
        assert!(f16_bits_to_f32(0x7C00).is_infinite());
    }

    #[test]
    fn test_real16_subnormal() {
        // 2^-24 is the smallest positive half value.
        let tiny = (2.0f32).powi(-24);
        assert_eq!(f32_to_f16_bits(tiny), 0x0001);
        assert_eq!(f16_bits_to_f32(0x0001), tiny);
    }

    #[test]
    fn test_string8_roundtrip() {
        let mut buffer = [0u8; 300];
        let written;
        {
            let mut stream = Cursor::new(&mut buffer[..]);
            written = pack_string8(&mut stream, "quite a verse").unwrap();
        }

        assert_eq!(written, 1 + 13);

        let mut stream = Cursor::new(&buffer[..]);
        assert_eq!(unpack_string8(&mut stream).unwrap(), "quite a verse");
    }

    #[test]
    fn test_string8_roundtrip_max_len() {
        let long: String = std::iter::repeat('x').take(255).collect();

        let mut buffer = [0u8; 300];
        {
            let mut stream = Cursor::new(&mut buffer[..]);
            pack_string8(&mut stream, &long).unwrap();
        }

        let mut stream = Cursor::new(&buffer[..]);
        assert_eq!(unpack_string8(&mut stream).unwrap(), long);
    }

    #[test]
    fn test_string8_truncates_over_255() {
        let over: String = std::iter::repeat('y').take(300).collect();

        let mut buffer = [0u8; 300];
        let written;
        {
            let mut stream = Cursor::new(&mut buffer[..]);
            written = pack_string8(&mut stream, &over).unwrap();
        }

        assert_eq!(written, 256);
        assert_eq!(buffer[0], 255);
    }

    #[test]
    fn test_string8_bad_length_rejected() {
        let buffer = [10u8, b'a', b'b'];
        let mut stream = Cursor::new(&buffer[..]);

        assert_eq!(
            unpack_string8(&mut stream).unwrap_err(),
            NetworkError::Fatal(ErrorType::BadLength)
        );
    }

    #[test]
    fn test_cmd_len_boundary() {
        // Total 254 stays on the single octet; 255 and 256 take the
        // extended form.
        for &(total, framing) in &[(254usize, 1usize), (255, 3), (256, 3)] {
            let mut buffer = [0u8; 8];
            let written;
            {
                let mut stream = Cursor::new(&mut buffer[..]);
                written = pack_cmd_len(&mut stream, total).unwrap();
            }
            assert_eq!(written, framing);

            let mut stream = Cursor::new(&buffer[..]);
            assert_eq!(unpack_cmd_len(&mut stream).unwrap(), (total, framing));
        }
    }

    #[test]
    fn test_cmd_total_len() {
        assert_eq!(cmd_total_len(0), 2);
        assert_eq!(cmd_total_len(252), 254);
        assert_eq!(cmd_total_len(253), 257);
    }
}
