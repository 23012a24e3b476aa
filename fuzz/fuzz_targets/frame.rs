#![no_main]

use arbitrary::Arbitrary;
use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use std::collections::VecDeque;
use veilstream::{
    frame::{Parser, MAX_FRAME_LEN, PREFIX_LEN},
    Error,
};

const MAX_BODY_LEN: usize = 4096;
const MAX_BODIES: usize = 16;

#[derive(Arbitrary, Debug)]
struct Input {
    /// Payloads encoded onto the wire as complete frames.
    bodies: Vec<Vec<u8>>,
    /// Whether a deliberately truncated frame follows the complete ones.
    truncate: bool,
    /// Body bytes of the truncated frame (always fewer than it declares).
    tail: Vec<u8>,
    /// Sizes carving the wire into delivery chunks.
    splits: Vec<u16>,
    /// Selects a declared length beyond the parser bound.
    oversize: u32,
}

fn encode(wire: &mut Vec<u8>, declared: usize, body: &[u8]) {
    wire.extend_from_slice(&(declared as u32).to_le_bytes()[..PREFIX_LEN]);
    wire.extend_from_slice(body);
}

/// Every complete frame comes back out intact, regardless of how the wire
/// bytes are chunked, and a truncated frame never produces output.
fn reassembles(input: &Input) {
    let bodies: Vec<&[u8]> = input
        .bodies
        .iter()
        .take(MAX_BODIES)
        .map(|body| &body[..body.len().min(MAX_BODY_LEN)])
        .collect();

    let mut wire = Vec::new();
    for body in &bodies {
        encode(&mut wire, body.len(), body);
    }
    if input.truncate {
        let tail = &input.tail[..input.tail.len().min(MAX_BODY_LEN - 1)];
        encode(&mut wire, tail.len() + 1, tail);
    }

    let mut parser = Parser::new(MAX_BODY_LEN);
    let mut frames = VecDeque::new();
    let mut rest = Bytes::from(wire);
    let mut splits = input.splits.iter();
    while !rest.is_empty() {
        let take = splits
            .next()
            .map(|split| (*split as usize % rest.len()) + 1)
            .unwrap_or(rest.len());
        let chunk = rest.split_to(take);
        parser
            .push(chunk, &mut frames, |needed| {
                assert!(needed > 0 && needed <= MAX_BODY_LEN);
            })
            .expect("Parser rejected an in-bound frame!");
    }

    assert_eq!(frames.len(), bodies.len());
    for (frame, body) in frames.iter().zip(&bodies) {
        assert_eq!(frame.as_ref(), *body);
    }
    assert_eq!(parser.is_idle(), !input.truncate);
}

/// A declared length beyond the bound fails before any body byte arrives.
fn rejects_oversize(input: &Input) {
    let declared = MAX_BODY_LEN + 1 + input.oversize as usize % (MAX_FRAME_LEN - MAX_BODY_LEN);
    let mut wire = Vec::new();
    encode(&mut wire, declared, &[]);

    let mut parser = Parser::new(MAX_BODY_LEN);
    let mut frames = VecDeque::new();
    let result = parser.push(Bytes::from(wire), &mut frames, |_| {});
    assert!(matches!(result, Err(Error::RecvTooLarge(len)) if len == declared));
    assert!(frames.is_empty());
}

fuzz_target!(|input: Input| {
    reassembles(&input);
    rejects_oversize(&input);
});
