//! Repair of control characters that XML 1.0 forbids.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

/// UTF-8 encoding of U+FFFD.
const REPLACEMENT: [u8; 3] = [0xEF, 0xBF, 0xBD];

static WARNED: AtomicBool = AtomicBool::new(false);

fn is_forbidden(byte: u8) -> bool {
    byte < 0x20 && !matches!(byte, b'\t' | b'\n' | b'\r')
}

/// Reader adapter that replaces forbidden control characters with U+FFFD.
///
/// Servers occasionally emit such characters inside tag values. Replacing
/// them keeps the rest of the document parseable. The first occurrence in
/// the process is logged; later ones are silent.
pub struct InvalidXmlCharFilter<R> {
    inner: R,
    /// Filtered bytes not yet handed out.
    pending: Vec<u8>,
    /// Raw read buffer, kept across calls.
    scratch: Vec<u8>,
    replaced: u64,
}

impl<R: Read> InvalidXmlCharFilter<R> {
    /// Wraps a reader.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            scratch: Vec::new(),
            replaced: 0,
        }
    }

    /// Number of characters replaced so far by this filter.
    pub fn replaced(&self) -> u64 {
        self.replaced
    }

    /// Unwraps the inner reader.
    pub fn into_inner(self) -> R {
        self.inner
    }

    fn note_replacement(&mut self, byte: u8) {
        self.replaced += 1;
        if !WARNED.swap(true, Ordering::Relaxed) {
            warn!(
                code = byte,
                "invalid xml control character in input, replaced with U+FFFD"
            );
        }
    }
}

impl<R: Read> Read for InvalidXmlCharFilter<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pending.is_empty() {
            let mut raw = std::mem::take(&mut self.scratch);
            raw.resize(buf.len(), 0);
            let result = self.inner.read(&mut raw);
            if let Ok(read) = &result {
                for &byte in &raw[..*read] {
                    if is_forbidden(byte) {
                        self.note_replacement(byte);
                        self.pending.extend_from_slice(&REPLACEMENT);
                    } else {
                        self.pending.push(byte);
                    }
                }
            }
            self.scratch = raw;
            result?;
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter_all(input: &[u8]) -> Vec<u8> {
        let mut filter = InvalidXmlCharFilter::new(input);
        let mut out = Vec::new();
        filter.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn reuses_its_read_buffer() {
        let input = b"<tag v=\"a\x01b\"/>".repeat(64);
        let mut filter = InvalidXmlCharFilter::new(&input[..]);
        let mut buf = [0u8; 32];
        assert_eq!(filter.read(&mut buf).unwrap(), 32);
        let scratch = filter.scratch.as_ptr();
        let mut out = buf.to_vec();
        loop {
            let n = filter.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
            assert_eq!(filter.scratch.as_ptr(), scratch);
        }
        assert_eq!(filter.replaced(), 64);
        assert_eq!(out, filter_all(&input));
    }

    #[test]
    fn passes_clean_input() {
        let input = b"<osm version=\"0.6\">\n\t<node/>\r\n</osm>";
        assert_eq!(filter_all(input), input.to_vec());
    }

    #[test]
    fn replaces_control_characters() {
        let out = filter_all(b"a\x01b\x1fc");
        assert_eq!(String::from_utf8(out).unwrap(), "a\u{FFFD}b\u{FFFD}c");
    }

    #[test]
    fn small_buffers_keep_replacements_intact() {
        let mut filter = InvalidXmlCharFilter::new(&b"x\x02\x03y"[..]);
        let mut out = Vec::new();
        let mut chunk = [0u8; 2];
        loop {
            let n = filter.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(String::from_utf8(out).unwrap(), "x\u{FFFD}\u{FFFD}y");
        assert_eq!(filter.replaced(), 2);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn output_never_contains_forbidden_bytes(
                input in proptest::collection::vec(any::<u8>(), 0..256),
                chunk in 1usize..16,
            ) {
                let mut filter = InvalidXmlCharFilter::new(&input[..]);
                let mut out = Vec::new();
                let mut buf = vec![0u8; chunk];
                loop {
                    let n = filter.read(&mut buf).unwrap();
                    if n == 0 {
                        break;
                    }
                    out.extend_from_slice(&buf[..n]);
                }
                let forbidden = input.iter().filter(|b| is_forbidden(**b)).count();
                prop_assert!(!out.iter().any(|b| is_forbidden(*b)));
                prop_assert_eq!(filter.replaced(), forbidden as u64);
                prop_assert_eq!(out.len(), input.len() + 2 * forbidden);
            }
        }
    }
}
