//! CRC-16/XMODEM, as computed by the bootloader for VERIFY

/// CRC-16/XMODEM (poly 0x1021, init 0x0000, no reflection, no final xor)
pub fn crc16(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0x0000;
    for &b in bytes {
        crc ^= (b as u16) << 8;
        for _ in 0..8 {
            if (crc & 0x8000) != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}
