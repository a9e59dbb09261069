pub const fn align_up(n: usize, align: usize) -> usize {
    n.div_ceil(align) * align
}

/// 序列号意义下`a`比`b`新，可以正确处理回绕
pub const fn seq_newer(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revisions_wrap() {
        assert!(seq_newer(2, 1));
        assert!(!seq_newer(1, 2));
        assert!(!seq_newer(5, 5));
        assert!(seq_newer(0, u32::MAX));
        assert!(seq_newer(3, 0xffff_fff0));
    }

    #[test]
    fn align() {
        assert_eq!(32, align_up(17, 16));
        assert_eq!(16, align_up(16, 16));
    }
}
