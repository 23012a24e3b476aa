//! Incremental decoder for length-prefixed frames.
//!
//! Every unit on the wire is `length (u24, little-endian) || payload (length bytes)`.
//! The parser consumes raw chunks of any size and yields complete payloads, retaining
//! partial state across chunks. It never reads ahead of a declared frame length and
//! never allocates for a frame larger than its configured bound.

use crate::Error;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// Number of bytes in the length prefix.
pub const PREFIX_LEN: usize = 3;

/// Largest length representable by the prefix.
pub const MAX_FRAME_LEN: usize = (1 << 24) - 1;

/// Multiplier value after all three prefix bytes have been consumed.
const LENGTH_COMPLETE: u32 = 1 << 24;

/// Encode a frame length into its wire prefix.
///
/// Callers must have bounds-checked `len` against [`MAX_FRAME_LEN`].
pub(crate) fn encode_len(len: usize) -> [u8; PREFIX_LEN] {
    let bytes = (len as u32).to_le_bytes();
    [bytes[0], bytes[1], bytes[2]]
}

enum State {
    /// Accumulating the length prefix one byte at a time.
    Length { accum: u32, multiplier: u32 },
    /// Collecting `len` payload bytes. `buf` exists only once the payload
    /// spans more than one chunk; a payload contained in a single chunk is
    /// yielded as a view of that chunk without copying.
    Body { len: usize, buf: Option<BytesMut> },
}

impl State {
    fn length() -> Self {
        Self::Length {
            accum: 0,
            multiplier: 1,
        }
    }
}

/// Incremental frame parser.
pub struct Parser {
    max_len: usize,
    state: State,
}

impl Parser {
    /// Create a parser that rejects frames longer than `max_len` before
    /// allocating anything for them.
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len: max_len.min(MAX_FRAME_LEN),
            state: State::length(),
        }
    }

    /// Consume one raw chunk, appending every completed payload to `frames`.
    ///
    /// When a frame's length becomes known and its body extends beyond the
    /// current chunk, `hint` is called once with the number of bytes still
    /// outstanding, so transports that can presize their receive path get the
    /// chance to. Fails with [`Error::RecvTooLarge`] if a declared length
    /// exceeds the configured bound.
    pub fn push<H>(
        &mut self,
        chunk: Bytes,
        frames: &mut VecDeque<Bytes>,
        mut hint: H,
    ) -> Result<(), Error>
    where
        H: FnMut(usize),
    {
        let mut offset = 0;
        while offset < chunk.len() {
            match &mut self.state {
                State::Length { accum, multiplier } => {
                    *accum += u32::from(chunk[offset]) * *multiplier;
                    *multiplier *= 256;
                    offset += 1;
                    if *multiplier < LENGTH_COMPLETE {
                        continue;
                    }
                    let len = *accum as usize;
                    if len > self.max_len {
                        return Err(Error::RecvTooLarge(len));
                    }
                    if len == 0 {
                        frames.push_back(Bytes::new());
                        self.state = State::length();
                        continue;
                    }
                    let available = chunk.len() - offset;
                    if available < len {
                        hint(len - available);
                    }
                    self.state = State::Body { len, buf: None };
                }
                State::Body { len, buf } => {
                    let len = *len;
                    let available = chunk.len() - offset;
                    if buf.is_none() && available >= len {
                        // Whole body already in hand: yield a view of the chunk.
                        frames.push_back(chunk.slice(offset..offset + len));
                        offset += len;
                        self.state = State::length();
                        continue;
                    }
                    let body = buf.get_or_insert_with(|| BytesMut::with_capacity(len));
                    let taking = (len - body.len()).min(available);
                    body.extend_from_slice(&chunk[offset..offset + taking]);
                    offset += taking;
                    if body.len() == len {
                        let body = body.split().freeze();
                        frames.push_back(body);
                        self.state = State::length();
                    }
                }
            }
        }
        Ok(())
    }

    /// The bound declared lengths are checked against.
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Replace the frame-length bound. Takes effect at the next length
    /// prefix; a body already being collected was admitted under the bound
    /// in force when its prefix completed.
    pub fn set_max_len(&mut self, max_len: usize) {
        self.max_len = max_len.min(MAX_FRAME_LEN);
    }

    /// Whether the parser is between frames (no partially-consumed prefix or body).
    pub fn is_idle(&self) -> bool {
        matches!(
            self.state,
            State::Length {
                accum: 0,
                multiplier: 1
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = encode_len(payload.len()).to_vec();
        out.extend_from_slice(payload);
        out
    }

    fn collect(parser: &mut Parser, input: &[u8], chunk_size: usize) -> Vec<Bytes> {
        let mut frames = VecDeque::new();
        for chunk in input.chunks(chunk_size) {
            parser
                .push(Bytes::copy_from_slice(chunk), &mut frames, |_| {})
                .unwrap();
        }
        frames.into_iter().collect()
    }

    #[test]
    fn test_single_frame_single_chunk() {
        let mut parser = Parser::new(MAX_FRAME_LEN);
        let frames = collect(&mut parser, &frame(b"hello world"), usize::MAX);
        assert_eq!(frames, vec![Bytes::from_static(b"hello world")]);
        assert!(parser.is_idle());
    }

    #[test]
    fn test_multiple_frames_single_chunk() {
        let mut input = frame(b"one");
        input.extend(frame(b"two"));
        input.extend(frame(b"three"));
        let mut parser = Parser::new(MAX_FRAME_LEN);
        let frames = collect(&mut parser, &input, usize::MAX);
        assert_eq!(frames, vec![&b"one"[..], &b"two"[..], &b"three"[..]]);
    }

    #[test_case(1; "one byte at a time")]
    #[test_case(2; "two bytes")]
    #[test_case(3; "three bytes")]
    #[test_case(5; "five bytes")]
    #[test_case(7; "seven bytes")]
    fn test_fragmentation_invariance(chunk_size: usize) {
        let mut input = frame(b"alpha");
        input.extend(frame(b""));
        input.extend(frame(&[0xAB; 300]));
        input.extend(frame(b"omega"));

        let mut parser = Parser::new(MAX_FRAME_LEN);
        let frames = collect(&mut parser, &input, chunk_size);
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0], &b"alpha"[..]);
        assert_eq!(frames[1], Bytes::new());
        assert_eq!(frames[2], Bytes::from(vec![0xAB; 300]));
        assert_eq!(frames[3], &b"omega"[..]);
        assert!(parser.is_idle());
    }

    #[test]
    fn test_empty_frame_yields_empty_payload() {
        let mut parser = Parser::new(MAX_FRAME_LEN);
        let frames = collect(&mut parser, &frame(b""), usize::MAX);
        assert_eq!(frames, vec![Bytes::new()]);
    }

    #[test]
    fn test_fast_path_is_a_view() {
        let chunk = Bytes::from(frame(b"zero copy"));
        let payload_range = chunk.as_ptr() as usize + PREFIX_LEN;

        let mut parser = Parser::new(MAX_FRAME_LEN);
        let mut frames = VecDeque::new();
        parser.push(chunk, &mut frames, |_| {}).unwrap();

        // The yielded payload points into the original chunk allocation.
        assert_eq!(frames[0].as_ptr() as usize, payload_range);
    }

    #[test]
    fn test_slow_path_allocates_once() {
        let input = frame(&[0x42; 64]);
        let mut parser = Parser::new(MAX_FRAME_LEN);
        let mut frames = VecDeque::new();
        for chunk in input.chunks(16) {
            parser
                .push(Bytes::copy_from_slice(chunk), &mut frames, |_| {})
                .unwrap();
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], Bytes::from(vec![0x42; 64]));
    }

    #[test]
    fn test_oversize_rejected_before_body() {
        let mut parser = Parser::new(16);
        let mut frames = VecDeque::new();
        let result = parser.push(Bytes::from(frame(&[0u8; 17])), &mut frames, |_| {});
        assert!(matches!(result, Err(Error::RecvTooLarge(17))));
        assert!(frames.is_empty());
    }

    #[test]
    fn test_tightened_bound_applies_to_next_frame() {
        let mut parser = Parser::new(64);
        let mut frames = VecDeque::new();
        parser
            .push(Bytes::from(frame(&[0u8; 48])), &mut frames, |_| {})
            .unwrap();
        assert_eq!(frames.len(), 1);

        parser.set_max_len(16);
        assert_eq!(parser.max_len(), 16);
        let result = parser.push(Bytes::from(frame(&[0u8; 48])), &mut frames, |_| {});
        assert!(matches!(result, Err(Error::RecvTooLarge(48))));
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_oversize_rejected_from_prefix_alone() {
        // Only the prefix arrives; the declared length alone must trigger the bound.
        let mut parser = Parser::new(1024);
        let mut frames = VecDeque::new();
        let result = parser.push(
            Bytes::copy_from_slice(&encode_len(1 << 20)),
            &mut frames,
            |_| {},
        );
        assert!(matches!(result, Err(Error::RecvTooLarge(len)) if len == 1 << 20));
    }

    #[test]
    fn test_hint_reports_outstanding_bytes() {
        let input = frame(&[9u8; 100]);
        let mut parser = Parser::new(MAX_FRAME_LEN);
        let mut frames = VecDeque::new();
        let mut hints = Vec::new();

        // Prefix plus the first 10 body bytes.
        parser
            .push(
                Bytes::copy_from_slice(&input[..PREFIX_LEN + 10]),
                &mut frames,
                |n| hints.push(n),
            )
            .unwrap();
        assert_eq!(hints, vec![90]);

        parser
            .push(
                Bytes::copy_from_slice(&input[PREFIX_LEN + 10..]),
                &mut frames,
                |n| hints.push(n),
            )
            .unwrap();
        assert_eq!(hints, vec![90]);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_no_hint_when_body_in_hand() {
        let mut parser = Parser::new(MAX_FRAME_LEN);
        let mut frames = VecDeque::new();
        let mut hints = Vec::new();
        parser
            .push(Bytes::from(frame(b"all here")), &mut frames, |n| {
                hints.push(n)
            })
            .unwrap();
        assert!(hints.is_empty());
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_prefix_split_across_chunks() {
        let input = frame(b"payload");
        let mut parser = Parser::new(MAX_FRAME_LEN);
        let mut frames = VecDeque::new();
        for byte in &input[..PREFIX_LEN] {
            parser
                .push(Bytes::copy_from_slice(&[*byte]), &mut frames, |_| {})
                .unwrap();
            assert!(frames.is_empty());
        }
        parser
            .push(
                Bytes::copy_from_slice(&input[PREFIX_LEN..]),
                &mut frames,
                |_| {},
            )
            .unwrap();
        assert_eq!(frames, VecDeque::from(vec![Bytes::from_static(b"payload")]));
    }

    #[test]
    fn test_encode_len_round_trip() {
        for len in [0usize, 1, 255, 256, 65535, 65536, MAX_FRAME_LEN] {
            let prefix = encode_len(len);
            let decoded =
                usize::from(prefix[0]) + usize::from(prefix[1]) * 256 + usize::from(prefix[2]) * 65536;
            assert_eq!(decoded, len);
        }
    }
}
