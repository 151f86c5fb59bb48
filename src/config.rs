/// The version of this library, reported alongside every crash so dumps
/// can be interpreted with the matching symbols.
#[inline]
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// The source revision this build was produced from, baked in at compile
/// time. All zeros when the build didn't happen inside a git checkout.
#[inline]
pub fn checksum() -> &'static str {
    env!("CRASH_CAPTURE_CHECKSUM")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn version_is_semverish() {
        let mut parts = version().split('.');
        for _ in 0..3 {
            parts.next().unwrap().parse::<u32>().unwrap();
        }
    }

    #[test]
    fn checksum_is_full_revision() {
        let sum = checksum();
        assert_eq!(sum.len(), 40);
        assert!(sum.bytes().all(|b| b.is_ascii_hexdigit()));
    }
}
