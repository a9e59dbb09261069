//! littlefs 使用的 CRC-32
//!
//! 多项式 0xEDB88320（反射），初值由调用者给出，没有最终异或，
//! 因此`crc(data ++ crc(data).to_le_bytes()) == 0`。

const TABLE: [u32; 256] = generate_table();

const fn generate_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// 提交开始时的初值
pub const INIT: u32 = 0xffff_ffff;

pub fn crc32(mut crc: u32, data: &[u8]) -> u32 {
    for &byte in data {
        crc = (crc >> 8) ^ TABLE[((crc ^ byte as u32) & 0xff) as usize];
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_value() {
        assert_eq!(0x340B_C6D9, crc32(INIT, b"123456789"));
    }

    #[test]
    fn incremental() {
        let whole = crc32(INIT, b"littlefs metadata");
        let split = crc32(crc32(INIT, b"littlefs "), b"metadata");
        assert_eq!(whole, split);
    }

    #[test]
    fn residue_is_zero() {
        let data = b"rev+tags";
        let crc = crc32(INIT, data);
        assert_eq!(0, crc32(crc, &crc.to_le_bytes()));
    }
}
