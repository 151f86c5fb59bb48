use super::FixedStr;
use std::io::Read;

/// Iterates the lines of a reader through a fixed inline buffer, for walking
/// `/proc` text files without allocating. Lines longer than `N` are skipped,
/// the ones after them still come out; a read error ends the iteration.
pub struct LineReader<R, const N: usize> {
    inner: R,
    buf: [u8; N],
    /// Read location
    cursor: usize,
    /// Filled end
    filled: usize,
    eof: bool,
}

impl<R: Read, const N: usize> LineReader<R, N> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: reader,
            buf: [0u8; N],
            cursor: 0,
            filled: 0,
            eof: false,
        }
    }
}

impl<R: Read, const N: usize> Iterator for LineReader<R, N> {
    type Item = FixedStr<N>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            // Complete line already buffered?
            if let Some(nl) = self.buf[self.cursor..self.filled]
                .iter()
                .position(|&c| c == b'\n')
            {
                let line = FixedStr::from_slice(&self.buf[self.cursor..self.cursor + nl]);
                self.cursor += nl + 1;
                return line;
            }

            if self.eof {
                // Unterminated tail
                if self.cursor < self.filled {
                    let line = FixedStr::from_slice(&self.buf[self.cursor..self.filled]);
                    self.cursor = self.filled;
                    return line;
                }
                return None;
            }

            // Shift the partial line to the front and refill
            if self.cursor > 0 {
                self.buf.copy_within(self.cursor..self.filled, 0);
                self.filled -= self.cursor;
                self.cursor = 0;
            } else if self.filled == N {
                // A single line doesn't fit the buffer. Drop what's
                // buffered and skim ahead to its terminating newline so
                // the lines after it still come out.
                self.filled = 0;
                loop {
                    match self.inner.read(&mut self.buf) {
                        Ok(0) => {
                            self.eof = true;
                            break;
                        }
                        Ok(read) => {
                            if let Some(nl) =
                                self.buf[..read].iter().position(|&c| c == b'\n')
                            {
                                self.buf.copy_within(nl + 1..read, 0);
                                self.filled = read - nl - 1;
                                break;
                            }
                        }
                        Err(_) => return None,
                    }
                }
                continue;
            }

            match self.inner.read(&mut self.buf[self.filled..]) {
                Ok(0) => self.eof = true,
                Ok(read) => self.filled += read,
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    fn collect<const N: usize>(input: &[u8]) -> Vec<String> {
        LineReader::<_, N>::new(std::io::Cursor::new(input))
            .map(|l| l.as_ref().to_owned())
            .collect()
    }

    #[rstest]
    #[case::empty(b"", &[])]
    #[case::one_terminated(b"line\n", &["line"])]
    #[case::one_eof(b"line", &["line"])]
    #[case::two_terminated(b"one\ntwo\n", &["one", "two"])]
    #[case::two_eof(b"one\ntwo", &["one", "two"])]
    #[case::blank_lines(b"\n\nx\n", &["", "", "x"])]
    fn splits_lines(#[case] input: &[u8], #[case] expected: &[&str]) {
        assert_eq!(collect::<512>(input), expected);
    }

    #[test]
    fn refills_across_reads() {
        // Lines straddle the 16-byte buffer boundary
        let input = b"0123456789\nabcdefghij\nklm\n";
        assert_eq!(collect::<16>(input), ["0123456789", "abcdefghij", "klm"]);
    }

    #[test]
    fn oversized_line_skipped() {
        // An unterminated over-long line yields nothing
        let long = [b'x'; 32];
        assert!(collect::<16>(&long).is_empty());

        // Terminated, with well-sized neighbors on both sides: only the
        // oversized line goes missing
        let mut input = b"before\n".to_vec();
        input.extend_from_slice(&[b'x'; 40]);
        input.extend_from_slice(b"\nafter\nlast\n");
        assert_eq!(collect::<16>(&input), ["before", "after", "last"]);
    }

    #[test]
    fn exact_fit_line() {
        let mut max = [b'1'; 16];
        max[15] = b'\n';
        assert_eq!(collect::<16>(&max), [std::str::from_utf8(&max[..15]).unwrap()]);
    }
}
