/// Incremental SSE event-block assembly over raw byte chunks.
///
/// Network chunks can split events (and UTF-8 sequences) anywhere, so bytes
/// are buffered until a blank-line boundary and only complete blocks are
/// decoded.
pub struct SseBuffer {
    buffer: Vec<u8>,
}

impl SseBuffer {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete event block (without its terminating blank line), or
    /// `None` until more bytes arrive.
    pub fn next_event_block(&mut self) -> Option<String> {
        let boundary = find_block_boundary(&self.buffer)?;
        let rest = self.buffer.split_off(boundary.end);
        let mut block_bytes = std::mem::replace(&mut self.buffer, rest);
        block_bytes.truncate(boundary.start);
        Some(String::from_utf8_lossy(&block_bytes).into_owned())
    }
}

struct Boundary {
    start: usize,
    end: usize,
}

fn find_block_boundary(buffer: &[u8]) -> Option<Boundary> {
    let mut i = 0;
    while i < buffer.len() {
        if buffer[i] == b'\n' {
            // \n\n
            if buffer.get(i + 1) == Some(&b'\n') {
                return Some(Boundary {
                    start: i,
                    end: i + 2,
                });
            }
            // \n\r\n
            if buffer.get(i + 1) == Some(&b'\r') && buffer.get(i + 2) == Some(&b'\n') {
                return Some(Boundary {
                    start: i,
                    end: i + 3,
                });
            }
        }
        i += 1;
    }
    None
}

/// `data:` payloads of an event block, with the `[DONE]` sentinel dropped.
pub fn parse_data_lines(block: &str) -> Vec<&str> {
    block
        .lines()
        .filter_map(|line| {
            let rest = line.strip_prefix("data:")?;
            let data = rest.strip_prefix(' ').unwrap_or(rest).trim_end_matches('\r');
            if data.is_empty() || data == "[DONE]" {
                None
            } else {
                Some(data)
            }
        })
        .collect()
}

/// The `event:` field of a block, if present.
pub fn event_type(block: &str) -> Option<&str> {
    block.lines().find_map(|line| {
        let rest = line.strip_prefix("event:")?;
        Some(rest.strip_prefix(' ').unwrap_or(rest).trim_end_matches('\r'))
    })
}
