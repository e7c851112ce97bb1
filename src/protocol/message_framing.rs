/// Reassembles discrete JSON messages from a byte stream.
///
/// Messages are top-level JSON objects. Boundaries are found by matching
/// braces outside string literals, so `}\n{`, `}{` and whitespace between
/// objects all separate messages, and a message split across reads is held
/// back until its closing brace arrives. Bytes outside any object are
/// delivered up to the next newline or `{` so the receiver can reject them.
///
/// The framer never enforces a size limit itself; callers check
/// [`MessageFraming::buffered_len`] after each push.
#[derive(Debug, Default, Clone)]
pub struct MessageFraming {
    buffer: Vec<u8>,
    scan: ScanState,
}

#[derive(Debug, Default, Clone, Copy)]
struct ScanState {
    /// Offset into the buffer up to which bytes were already scanned
    position: usize,
    /// Start of the current message, if one has begun
    start: Option<usize>,
    depth: usize,
    in_string: bool,
    escaped: bool,
    /// Current message consists of stray bytes rather than an object
    junk: bool,
}

impl MessageFraming {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `data` and return every message completed by it, in order
    pub fn push_data(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(data);
        let mut messages = Vec::new();
        let mut consumed = 0;
        let mut scan = self.scan;

        while scan.position < self.buffer.len() {
            let index = scan.position;
            let byte = self.buffer[index];
            scan.position += 1;

            let Some(start) = scan.start else {
                match byte {
                    b'{' => {
                        scan.start = Some(index);
                        scan.depth = 1;
                    }
                    b if b.is_ascii_whitespace() => consumed = scan.position,
                    _ => {
                        scan.start = Some(index);
                        scan.junk = true;
                    }
                }
                continue;
            };

            if scan.junk {
                match byte {
                    b'\n' => {
                        messages.push(self.buffer[start..index].to_vec());
                        consumed = scan.position;
                        scan = ScanState { position: scan.position, ..ScanState::default() };
                    }
                    b'{' => {
                        messages.push(self.buffer[start..index].to_vec());
                        consumed = index;
                        scan = ScanState {
                            position: scan.position,
                            start: Some(index),
                            depth: 1,
                            ..ScanState::default()
                        };
                    }
                    _ => {}
                }
                continue;
            }

            if scan.in_string {
                if scan.escaped {
                    scan.escaped = false;
                } else if byte == b'\\' {
                    scan.escaped = true;
                } else if byte == b'"' {
                    scan.in_string = false;
                }
                continue;
            }

            match byte {
                b'"' => scan.in_string = true,
                b'{' => scan.depth += 1,
                b'}' => {
                    scan.depth -= 1;
                    if scan.depth == 0 {
                        messages.push(self.buffer[start..scan.position].to_vec());
                        consumed = scan.position;
                        scan = ScanState { position: scan.position, ..ScanState::default() };
                    }
                }
                _ => {}
            }
        }

        if consumed > 0 {
            self.buffer.drain(..consumed);
            scan.position -= consumed;
            scan.start = scan.start.map(|s| s - consumed);
        }
        self.scan = scan;
        messages
    }

    /// Bytes held back waiting for the rest of a message
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.scan = ScanState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_on_newline_boundary() {
        let mut framing = MessageFraming::new();
        let messages = framing.push_data(b"{\"id\":1}\n{\"id\":2}\n");
        assert_eq!(messages, vec![b"{\"id\":1}".to_vec(), b"{\"id\":2}".to_vec()]);
        assert_eq!(framing.buffered_len(), 0);
    }

    #[test]
    fn test_partial_message_is_retained() {
        let mut framing = MessageFraming::new();
        assert!(framing.push_data(b"{\"id\":1,\"params\":{\"a\"").is_empty());
        assert!(framing.buffered_len() > 0);
        let messages = framing.push_data(b":\"}\"}}{\"id\"");
        assert_eq!(messages, vec![b"{\"id\":1,\"params\":{\"a\":\"}\"}}".to_vec()]);
        assert_eq!(framing.buffered_len(), b"{\"id\"".len());
    }

    #[test]
    fn test_escaped_quotes_in_strings() {
        let mut framing = MessageFraming::new();
        let messages = framing.push_data(br#"{"s":"a\"}{"}{"t":1}"#);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], br#"{"s":"a\"}{"}"#.to_vec());
    }

    #[test]
    fn test_junk_is_delivered_for_rejection() {
        let mut framing = MessageFraming::new();
        let messages = framing.push_data(b"hello\n{\"id\":1}");
        assert_eq!(messages, vec![b"hello".to_vec(), b"{\"id\":1}".to_vec()]);

        let messages = framing.push_data(b"oops{\"id\":2}");
        assert_eq!(messages, vec![b"oops".to_vec(), b"{\"id\":2}".to_vec()]);
    }

    #[test]
    fn test_byte_by_byte_feed() {
        let stream = b"{\"id\":1,\"method\":\"A.b\"}{\"id\":2,\"params\":{\"x\":[{}]}}\n{\"id\":3}";
        let mut framing = MessageFraming::new();
        let mut messages = Vec::new();
        for byte in stream.iter() {
            messages.extend(framing.push_data(std::slice::from_ref(byte)));
        }
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1], b"{\"id\":2,\"params\":{\"x\":[{}]}}".to_vec());
        assert_eq!(framing.buffered_len(), 0);
    }
}
