//! Big-endian integer helpers for the on-disk formats.

use byteorder::{BigEndian, ByteOrder};

pub fn get_u16(data: &[u8]) -> u16 {
    BigEndian::read_u16(data)
}

pub fn get_u32(data: &[u8]) -> u32 {
    BigEndian::read_u32(data)
}

pub fn get_u64(data: &[u8]) -> u64 {
    BigEndian::read_u64(data)
}

pub fn put_u16(data: &mut [u8], value: u16) {
    BigEndian::write_u16(data, value);
}

pub fn put_u32(data: &mut [u8], value: u32) {
    BigEndian::write_u32(data, value);
}

pub fn put_u64(data: &mut [u8], value: u64) {
    BigEndian::write_u64(data, value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let mut buf = [0u8; 8];
        put_u16(&mut buf, 0xBEEF);
        assert_eq!(get_u16(&buf), 0xBEEF);
        put_u32(&mut buf, 0xDEAD_BEEF);
        assert_eq!(get_u32(&buf), 0xDEAD_BEEF);
        put_u64(&mut buf, u64::MAX - 7);
        assert_eq!(get_u64(&buf), u64::MAX - 7);
    }
}
