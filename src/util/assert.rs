/// Test if `ptr` is aligned to a multiple of `align`
pub fn aligned_to<T>(ptr: *const T, align: usize) -> bool {
    ptr as usize % align == 0
}

#[cfg(test)]
mod tests {
    use super::aligned_to;

    #[test]
    fn aligned_to_checks_address_multiples() {
        assert!(aligned_to(16 as *const u64, 8));
        assert!(!aligned_to(12 as *const u64, 8));
        assert!(aligned_to(12 as *const u8, 1));
    }
}
