use std::collections::VecDeque;

const MAX_ERROR_LENGTH: usize = 2_000;

/// Keeps only the last `cap` bytes written to it, so a chatty or looping
/// check cannot grow memory without bound.
#[derive(Debug, Clone)]
pub struct TailBuffer {
    cap: usize,
    buf: VecDeque<u8>,
    dropped: usize,
}

impl TailBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            buf: VecDeque::with_capacity(cap.min(64 * 1024)),
            dropped: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        if self.cap == 0 {
            self.dropped += bytes.len();
            return;
        }
        // Only the tail of an oversized chunk can survive.
        let bytes = if bytes.len() > self.cap {
            self.dropped += bytes.len() - self.cap;
            &bytes[bytes.len() - self.cap..]
        } else {
            bytes
        };
        let overflow = (self.buf.len() + bytes.len()).saturating_sub(self.cap);
        if overflow > 0 {
            self.buf.drain(..overflow);
            self.dropped += overflow;
        }
        self.buf.extend(bytes);
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Render as lossy UTF-8, prefixed with a marker when bytes were discarded.
    pub fn into_string(self) -> String {
        let (front, back) = self.buf.as_slices();
        let mut bytes = Vec::with_capacity(front.len() + back.len());
        bytes.extend_from_slice(front);
        bytes.extend_from_slice(back);
        let text = String::from_utf8_lossy(&bytes).into_owned();
        if self.dropped > 0 {
            format!("... [truncated {} bytes] ...\n{}", self.dropped, text)
        } else {
            text
        }
    }
}

pub fn truncate_error(error: &str) -> String {
    if error.len() <= MAX_ERROR_LENGTH {
        error.to_string()
    } else {
        let mut end = MAX_ERROR_LENGTH;
        while !error.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &error[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_buffer_under_cap() {
        let mut tail = TailBuffer::new(16);
        tail.push(b"hello ");
        tail.push(b"world");
        assert_eq!(tail.dropped(), 0);
        assert_eq!(tail.into_string(), "hello world");
    }

    #[test]
    fn test_tail_buffer_keeps_last_bytes() {
        let mut tail = TailBuffer::new(4);
        tail.push(b"abc");
        tail.push(b"defg");
        assert_eq!(tail.dropped(), 3);
        assert_eq!(tail.into_string(), "... [truncated 3 bytes] ...\ndefg");
    }

    #[test]
    fn test_tail_buffer_oversized_chunk() {
        let mut tail = TailBuffer::new(3);
        tail.push(b"0123456789");
        assert_eq!(tail.dropped(), 7);
        assert!(tail.into_string().ends_with("789"));
    }

    #[test]
    fn test_truncate_error_respects_char_boundary() {
        let long = "é".repeat(MAX_ERROR_LENGTH);
        let truncated = truncate_error(&long);
        assert!(truncated.ends_with("..."));
        assert!(truncated.len() <= MAX_ERROR_LENGTH + 3);
    }

    #[test]
    fn test_truncate_error_short_passthrough() {
        assert_eq!(truncate_error("patch does not apply"), "patch does not apply");
    }
}
