use tracing::warn;

const LENGTH_PREFIX_LEN: usize = 4;

/// Incremental decoder for the `track-devices` stream: repeated
/// `{4 ASCII hex digits}{payload}` frames.
///
/// Bytes may arrive split at any boundary; frames come out identical to
/// decoding the whole stream at once.
#[derive(Debug, Default)]
pub struct TrackDevicesFrameDecoder {
    buffer: Vec<u8>,
}

impl TrackDevicesFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns every payload that is now complete.
    /// A zero-length frame yields an empty payload.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            if self.buffer.len() < LENGTH_PREFIX_LEN {
                break;
            }
            let header = &self.buffer[..LENGTH_PREFIX_LEN];
            let Some(length) = parse_hex_length(header) else {
                warn!(
                    header = %String::from_utf8_lossy(header),
                    "invalid track-devices length prefix; skipping"
                );
                self.buffer.drain(..LENGTH_PREFIX_LEN);
                continue;
            };
            let total = LENGTH_PREFIX_LEN + length;
            if self.buffer.len() < total {
                break;
            }
            let payload = String::from_utf8_lossy(&self.buffer[LENGTH_PREFIX_LEN..total]).to_string();
            self.buffer.drain(..total);
            frames.push(payload);
        }
        frames
    }

    /// Bytes of an incomplete frame still waiting for the rest of its data.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

fn parse_hex_length(header: &[u8]) -> Option<usize> {
    if !header.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    let text = std::str::from_utf8(header).ok()?;
    usize::from_str_radix(text, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &str) -> Vec<u8> {
        let mut bytes = format!("{:04x}", payload.len()).into_bytes();
        bytes.extend_from_slice(payload.as_bytes());
        bytes
    }

    fn sample_stream() -> Vec<u8> {
        let mut stream = Vec::new();
        stream.extend(frame("0123456789ABCDEF\tdevice\n"));
        stream.extend(frame(""));
        stream.extend(frame("A\tdevice\nB\toffline\n"));
        stream.extend(frame("abcd"));
        stream
    }

    #[test]
    fn decodes_whole_stream() {
        let mut decoder = TrackDevicesFrameDecoder::new();
        let frames = decoder.push(&sample_stream());
        assert_eq!(
            frames,
            vec!["0123456789ABCDEF\tdevice\n", "", "A\tdevice\nB\toffline\n", "abcd"]
        );
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn chunk_boundaries_do_not_change_frames() {
        let stream = sample_stream();
        let expected = TrackDevicesFrameDecoder::new().push(&stream);
        for chunk_size in 1..=stream.len() {
            let mut decoder = TrackDevicesFrameDecoder::new();
            let mut frames = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                frames.extend(decoder.push(chunk));
            }
            assert_eq!(frames, expected, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn every_split_point_of_two_pieces_matches() {
        let stream = sample_stream();
        let expected = TrackDevicesFrameDecoder::new().push(&stream);
        for split in 0..=stream.len() {
            let mut decoder = TrackDevicesFrameDecoder::new();
            let mut frames = decoder.push(&stream[..split]);
            frames.extend(decoder.push(&stream[split..]));
            assert_eq!(frames, expected, "split at {split}");
        }
    }

    #[test]
    fn zero_length_frame_is_empty_payload() {
        let mut decoder = TrackDevicesFrameDecoder::new();
        assert_eq!(decoder.push(b"0000"), vec![String::new()]);
    }

    #[test]
    fn partial_payload_waits_for_more() {
        let mut decoder = TrackDevicesFrameDecoder::new();
        assert!(decoder.push(b"0010A\tdev").is_empty());
        assert_eq!(decoder.pending_len(), 9);
    }

    #[test]
    fn non_hex_prefix_is_skipped() {
        let mut decoder = TrackDevicesFrameDecoder::new();
        let mut stream = b"zz!!".to_vec();
        stream.extend(frame("A\tdevice\n"));
        assert_eq!(decoder.push(&stream), vec!["A\tdevice\n"]);
    }
}
