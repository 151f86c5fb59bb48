use std::{ffi::CStr, fmt};

/// A string with inline, fixed capacity. Formatting into one of these never
/// touches the heap, which is the whole point: paths and `/proc` lines are
/// assembled in the fault handler where allocation is off limits.
#[cfg_attr(test, derive(PartialEq))]
pub struct FixedStr<const N: usize> {
    bytes: [u8; N],
    len: usize,
}

impl<const N: usize> FixedStr<N> {
    #[inline]
    pub const fn new() -> Self {
        Self {
            bytes: [0u8; N],
            len: 0,
        }
    }

    /// Fails if the slice doesn't fit or isn't UTF-8.
    pub fn from_slice(buf: &[u8]) -> Option<Self> {
        if buf.len() > N || std::str::from_utf8(buf).is_err() {
            return None;
        }

        let mut bytes = [0u8; N];
        bytes[..buf.len()].copy_from_slice(buf);

        Some(Self {
            bytes,
            len: buf.len(),
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    #[inline]
    pub fn clear(&mut self) {
        self.len = 0;
        // Only strictly needed for the CStr flavor, but cheap
        self.bytes.fill(0);
    }
}

impl<const N: usize> Default for FixedStr<N> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Clone for FixedStr<N> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            bytes: self.bytes,
            len: self.len,
        }
    }
}

#[cfg(test)]
impl<const N: usize> fmt::Debug for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(self.as_bytes()) {
            Ok(s) => write!(f, "'{}'", s),
            Err(_) => f.write_str("non utf-8 string"),
        }
    }
}

impl<const N: usize> AsRef<str> for FixedStr<N> {
    #[inline]
    fn as_ref(&self) -> &str {
        // Both `write_str` and `from_slice` only admit valid UTF-8
        unsafe { std::str::from_utf8_unchecked(self.as_bytes()) }
    }
}

impl<const N: usize> fmt::Write for FixedStr<N> {
    fn write_str(&mut self, s: &str) -> Result<(), fmt::Error> {
        if self.len + s.len() > N {
            return Err(fmt::Error);
        }

        self.bytes[self.len..self.len + s.len()].copy_from_slice(s.as_bytes());
        self.len += s.len();
        Ok(())
    }
}

/// [`FixedStr`], but always nul terminated so it can be handed to raw
/// syscalls. Capacity `N` includes the terminator.
#[cfg_attr(test, derive(PartialEq))]
pub struct FixedCStr<const N: usize> {
    inner: FixedStr<N>,
}

impl<const N: usize> FixedCStr<N> {
    #[inline]
    pub const fn new() -> Self {
        Self {
            inner: FixedStr::new(),
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        self.inner.as_ref()
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.inner.as_bytes()
    }
}

impl<const N: usize> Default for FixedCStr<N> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Clone for FixedCStr<N> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[cfg(test)]
impl<const N: usize> fmt::Debug for FixedCStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl<const N: usize> AsRef<CStr> for FixedCStr<N> {
    #[inline]
    fn as_ref(&self) -> &CStr {
        unsafe { CStr::from_bytes_with_nul_unchecked(&self.inner.bytes[..self.inner.len + 1]) }
    }
}

impl<const N: usize> fmt::Write for FixedCStr<N> {
    fn write_str(&mut self, s: &str) -> Result<(), fmt::Error> {
        // Interior nuls would silently truncate the C view of the string
        if s.as_bytes().contains(&0) {
            return Err(fmt::Error);
        }

        if self.inner.len + s.len() + 1 > N {
            return Err(fmt::Error);
        }

        self.inner.write_str(s)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fmt::Write;

    #[test]
    fn formats_paths() {
        let mut fstr = FixedStr::<32>::new();
        write!(&mut fstr, "/proc/{}/maps", 9182).unwrap();
        assert_eq!(fstr.as_ref(), "/proc/9182/maps");
        assert_eq!(fstr.len(), 15);

        let mut fcstr = FixedCStr::<32>::new();
        write!(&mut fcstr, "/proc/{}/maps", 9182).unwrap();
        assert_eq!(
            fcstr.as_ref(),
            CStr::from_bytes_with_nul(b"/proc/9182/maps\0").unwrap()
        );
    }

    #[test]
    fn rejects_overflow() {
        let mut fstr = FixedStr::<10>::new();
        assert!(write!(&mut fstr, "/proc/{}/maps", 9182).is_err());
        // The write is applied piecewise, pieces that fit stay
        assert_eq!(fstr.as_ref(), "/proc/9182");

        let mut fcstr = FixedCStr::<8>::new();
        assert!(write!(&mut fcstr, "01234567").is_err());
        assert_eq!(fcstr.as_str(), "");
    }

    #[test]
    fn rejects_interior_nul() {
        let mut fcstr = FixedCStr::<16>::new();
        assert!(fcstr.write_str("a\0b").is_err());
    }

    #[test]
    fn from_slice_bounds() {
        assert!(FixedStr::<4>::from_slice(b"abcde").is_none());
        let s = FixedStr::<4>::from_slice(b"abcd").unwrap();
        assert_eq!(s.as_ref(), "abcd");
    }
}
