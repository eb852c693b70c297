use prost::encoding::decode_varint;
use prost::Message;
use tracing::warn;

/// Longest encoding of a u64 varint.
const MAX_VARINT_LEN: usize = 10;

/// Frames larger than this are treated as stream corruption.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// `{uvarint length}{message bytes}`
pub fn encode_frame<M: Message>(message: &M) -> Vec<u8> {
    message.encode_length_delimited_to_vec()
}

/// Reassembles length-prefixed message bodies from arbitrary read chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Body bytes of an oversized frame still to be discarded.
    skip_remaining: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns every complete message body.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let chunk = self.discard_skipped(chunk);
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while !self.buffer.is_empty() {
            let mut head = self.buffer.as_slice();
            let length = match decode_varint(&mut head) {
                Ok(length) => length,
                // Not enough bytes for the prefix yet.
                Err(_) if self.buffer.len() < MAX_VARINT_LEN => break,
                Err(err) => {
                    warn!(error = %err, buffered = self.buffer.len(), "malformed frame header; dropping buffer");
                    self.buffer.clear();
                    break;
                }
            };
            let header_size = self.buffer.len() - head.len();
            let length = match usize::try_from(length) {
                Ok(length) if length <= MAX_FRAME_LEN => length,
                _ => {
                    warn!(length, "frame length exceeds limit; skipping body");
                    self.buffer.drain(..header_size);
                    let body = usize::try_from(length).unwrap_or(usize::MAX);
                    let buffered = body.min(self.buffer.len());
                    self.buffer.drain(..buffered);
                    self.skip_remaining = body - buffered;
                    continue;
                }
            };
            let total = header_size + length;
            if self.buffer.len() < total {
                break;
            }
            frames.push(self.buffer[header_size..total].to_vec());
            self.buffer.drain(..total);
        }
        frames
    }

    fn discard_skipped<'c>(&mut self, chunk: &'c [u8]) -> &'c [u8] {
        let skipped = self.skip_remaining.min(chunk.len());
        self.skip_remaining -= skipped;
        &chunk[skipped..]
    }

    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}
