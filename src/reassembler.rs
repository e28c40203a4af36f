use crate::protocol::{verify_frame, ParsedFrame};

const START_BYTE: u8 = b'~';

/// Default ceiling for the working buffer. The longest legal frame is just
/// over 4 KiB of characters, so anything beyond that without a terminator is
/// line noise.
pub const DEFAULT_MAX_BUFFER: usize = 4352;

/// Reassembles discrete frames out of an arbitrarily chunked character
/// stream.
///
/// The transport delivers bytes with no framing guarantees: a frame may be
/// split anywhere, several frames may arrive in one chunk, and corruption may
/// appear between frames. [`feed`](Self::feed) appends a chunk,
/// [`next_frame`](Self::next_frame) pulls verified frames out one at a time.
/// Invalid candidates are dropped and scanning resumes at the next start
/// marker, so the reassembler always recovers on subsequent bytes.
#[derive(Debug)]
pub struct FrameReassembler {
    buf: Vec<u8>,
    max_buffer: usize,
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReassembler {
    pub fn new() -> Self {
        Self::with_max_buffer(DEFAULT_MAX_BUFFER)
    }

    pub fn with_max_buffer(max_buffer: usize) -> Self {
        Self {
            buf: Vec::with_capacity(256),
            max_buffer,
        }
    }

    /// Appends a chunk of received bytes.
    ///
    /// If the buffer would grow past the ceiling without ever producing a
    /// terminator, the whole buffer is discarded and scanning restarts. That
    /// loses whatever the buffer held, which is the intended resync policy
    /// for a link stuck mid-frame.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
        if self.buf.len() > self.max_buffer {
            log::warn!(
                "reassembly buffer exceeded {} bytes without a terminator, discarding",
                self.max_buffer
            );
            self.buf.clear();
        }
    }

    /// Number of bytes currently waiting for a terminator.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Drops any buffered bytes. Clients call this before a new request so a
    /// stale partial tail cannot swallow the upcoming response.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Extracts the next raw candidate between a start marker and a CR/LF
    /// terminator, consuming it (and any noise before it) from the buffer.
    pub fn next_candidate(&mut self) -> Option<String> {
        let start = self.buf.iter().position(|&b| b == START_BYTE)?;
        if start > 0 {
            log::trace!("dropping {start} noise bytes before start marker");
            self.buf.drain(..start);
        }
        let end = self.buf.iter().position(|&b| b == b'\r' || b == b'\n')?;
        let candidate = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.buf.drain(..=end);
        Some(candidate)
    }

    /// Pulls the next verified frame out of the buffer, silently dropping
    /// candidates that fail verification. Returns `None` once the remaining
    /// bytes hold no complete candidate.
    pub fn next_frame(&mut self) -> Option<ParsedFrame> {
        while let Some(candidate) = self.next_candidate() {
            match verify_frame(&candidate) {
                Ok(frame) => return Some(frame),
                Err(err) => {
                    log::debug!("dropping invalid frame candidate ({err}): {candidate:?}");
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::build_frame;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn frames() -> Vec<String> {
        vec![
            build_frame(0x01, 0x42, &[0x01]).unwrap(),
            build_frame(0x02, 0x44, &[0x02, 0xAA, 0xBB]).unwrap(),
            build_frame(0x01, 0x45, &[0x01, 0x0F]).unwrap(),
        ]
    }

    fn drain(r: &mut FrameReassembler) -> Vec<ParsedFrame> {
        let mut out = Vec::new();
        while let Some(frame) = r.next_frame() {
            out.push(frame);
        }
        out
    }

    fn collect_from_chunks(stream: &[u8], chunks: &[usize]) -> Vec<ParsedFrame> {
        let mut r = FrameReassembler::new();
        let mut out = Vec::new();
        let mut pos = 0;
        for &n in chunks {
            r.feed(&stream[pos..pos + n]);
            pos += n;
            out.extend(drain(&mut r));
        }
        r.feed(&stream[pos..]);
        out.extend(drain(&mut r));
        out
    }

    #[test]
    fn single_chunk_yields_all_frames() {
        let stream: String = frames().concat();
        let mut r = FrameReassembler::new();
        r.feed(stream.as_bytes());
        let decoded = drain(&mut r);
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0].service, 0x42);
        assert_eq!(decoded[1].payload, vec![0x02, 0xAA, 0xBB]);
        assert_eq!(decoded[2].service, 0x45);
    }

    #[test]
    fn chunk_boundary_invariance() {
        let stream: String = frames().concat();
        let bytes = stream.as_bytes();
        let whole = collect_from_chunks(bytes, &[bytes.len()]);
        assert_eq!(whole.len(), 3);

        // Split at every possible boundary.
        for split in 0..=bytes.len() {
            let parts = collect_from_chunks(bytes, &[split]);
            assert_eq!(parts, whole, "split at {split}");
        }

        // Byte-at-a-time delivery.
        let single: Vec<usize> = vec![1; bytes.len()];
        assert_eq!(collect_from_chunks(bytes, &single), whole);

        // Seeded random chunk sizes.
        let mut rng = StdRng::seed_from_u64(0x4A22);
        for _ in 0..50 {
            let mut chunks = Vec::new();
            let mut remaining = bytes.len();
            while remaining > 0 {
                let n = rng.gen_range(1..=remaining);
                chunks.push(n);
                remaining -= n;
            }
            assert_eq!(collect_from_chunks(bytes, &chunks), whole, "chunks {chunks:?}");
        }
    }

    #[test]
    fn terminator_split_across_chunks() {
        let frame = build_frame(0x01, 0x42, &[0x01]).unwrap();
        let (head, tail) = frame.split_at(frame.len() - 1);
        let mut r = FrameReassembler::new();
        r.feed(head.as_bytes());
        assert!(r.next_frame().is_none());
        r.feed(tail.as_bytes());
        assert_eq!(drain(&mut r).len(), 1);
    }

    #[test]
    fn corrupted_frame_resyncs_to_next() {
        let good = build_frame(0x01, 0x42, &[0x01]).unwrap();
        let mut corrupted = good.clone();
        corrupted.replace_range(10..11, "0");
        if corrupted == good {
            corrupted.replace_range(10..11, "1");
        }
        let stream = format!("{corrupted}{good}");
        let mut r = FrameReassembler::new();
        r.feed(stream.as_bytes());
        let decoded = drain(&mut r);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].address, 0x01);
    }

    #[test]
    fn noise_and_bare_terminators_are_discarded() {
        let good = build_frame(0x01, 0x42, &[0x01]).unwrap();
        let mut r = FrameReassembler::new();
        r.feed(b"\r\n\r\n");
        assert!(r.next_frame().is_none());
        r.feed(b"garbage without marker\n");
        assert!(r.next_frame().is_none());
        r.feed(good.as_bytes());
        assert_eq!(drain(&mut r).len(), 1);
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn buffer_ceiling_discards_and_recovers() {
        let mut r = FrameReassembler::with_max_buffer(64);
        // A marker followed by far more than 64 bytes and never a terminator.
        r.feed(b"~");
        r.feed(&[b'A'; 100]);
        assert!(r.next_frame().is_none());
        assert_eq!(r.pending(), 0);

        let good = build_frame(0x01, 0x42, &[0x01]).unwrap();
        r.feed(good.as_bytes());
        assert_eq!(drain(&mut r).len(), 1);
    }

    #[test]
    fn two_frames_in_one_chunk_with_noise_between() {
        let a = build_frame(0x01, 0x42, &[0x01]).unwrap();
        let b = build_frame(0x02, 0x44, &[0x02]).unwrap();
        let stream = format!("xx{a}..junk..{b}zz");
        let mut r = FrameReassembler::new();
        r.feed(stream.as_bytes());
        let decoded = drain(&mut r);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].address, 0x01);
        assert_eq!(decoded[1].address, 0x02);
    }
}
