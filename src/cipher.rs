//! Streaming AEAD states for an established stream.
//!
//! Each direction of a stream owns one state, keyed by one of the directional keys the
//! handshake produced. The send direction generates a random 24-byte header which is
//! delivered to the peer exactly once (the first frame after the handshake); the header
//! doubles as the base nonce, and every sealed message uses the header value with a
//! monotonically incrementing 64-bit counter folded into its trailing bytes. Inside the
//! sealed region every message carries one leading kind byte ahead of the plaintext, so
//! a sealed message is `1 + plaintext + 16` bytes on the wire.

use crate::Error;
use bytes::{Bytes, BytesMut};
use chacha20poly1305::{
    aead::{generic_array::typenum::Unsigned, AeadCore, AeadInPlace, KeyInit},
    Tag, XChaCha20Poly1305, XNonce,
};
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Directional key length.
pub const KEY_LEN: usize = 32;

/// Header length. The header is also the base nonce for its direction.
pub const HEADER_LEN: usize = 24;

/// Poly1305 authentication tag length.
pub(crate) const TAG_LEN: usize = <XChaCha20Poly1305 as AeadCore>::TagSize::USIZE;

/// Bytes a sealed message adds on top of its plaintext: the leading kind byte
/// plus the authentication tag.
pub const OVERHEAD: usize = 1 + TAG_LEN;

/// Stream identifier length.
pub const STREAM_ID_LEN: usize = 32;

/// Kind byte carried ahead of the plaintext inside the sealed region. Opaque
/// to callers; reserved values distinguish message flavors on the wire.
const KIND_MESSAGE: u8 = 0;

/// Domain-separation prefix for stream-id derivation.
const STREAM_ID_PREFIX: &[u8] = b"veilstream/v1/stream-id";

/// A directional symmetric key. Wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl From<[u8; KEY_LEN]> for Key {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

/// The public header value a send direction announces once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header(pub [u8; HEADER_LEN]);

impl AsRef<[u8]> for Header {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Public identifier of a stream, derived from the handshake transcript hash.
/// Announced (and verified against a local recomputation) when session
/// resumption is in use.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId([u8; STREAM_ID_LEN]);

impl StreamId {
    pub fn from_bytes(bytes: [u8; STREAM_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; STREAM_ID_LEN] {
        &self.0
    }
}

impl AsRef<[u8]> for StreamId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StreamId(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// Derive the public stream id from a handshake transcript hash.
pub fn derive_stream_id(handshake_hash: &[u8; crate::handshake::HASH_LEN]) -> StreamId {
    let digest = Sha256::new()
        .chain_update(STREAM_ID_PREFIX)
        .chain_update(handshake_hash)
        .finalize();
    StreamId(digest.into())
}

/// Per-message nonce schedule: the header value with a 64-bit counter folded
/// into its trailing bytes.
struct Nonce {
    base: [u8; HEADER_LEN],
    counter: u64,
}

// We don't need to zeroize nonces.
impl ZeroizeOnDrop for Nonce {}

impl Nonce {
    fn new(header: &Header) -> Self {
        Self {
            base: header.0,
            counter: 0,
        }
    }

    /// Nonce value for the next message. Fails before the counter can wrap.
    fn next(&mut self) -> Result<XNonce, Error> {
        if self.counter == u64::MAX {
            return Err(Error::NonceOverflow);
        }
        let mut tail = [0u8; 8];
        tail.copy_from_slice(&self.base[HEADER_LEN - 8..]);
        let value = u64::from_le_bytes(tail).wrapping_add(self.counter);
        self.counter += 1;

        let mut out = self.base;
        out[HEADER_LEN - 8..].copy_from_slice(&value.to_le_bytes());
        Ok(XNonce::from(out))
    }
}

/// Send-direction state. Created from the handshake's tx key; hands back the
/// header the peer needs to mirror this state.
#[derive(ZeroizeOnDrop)]
pub struct Encrypter {
    cipher: XChaCha20Poly1305,
    nonce: Nonce,
}

impl Encrypter {
    /// Create the send state and its one-time header.
    pub fn new<R: RngCore + CryptoRng>(key: &Key, rng: &mut R) -> (Self, Header) {
        let mut header = [0u8; HEADER_LEN];
        rng.fill_bytes(&mut header);
        let header = Header(header);
        let encrypter = Self {
            cipher: XChaCha20Poly1305::new(&key.0.into()),
            nonce: Nonce::new(&header),
        };
        (encrypter, header)
    }

    /// Seal `body` in place and return the detached authentication tag.
    ///
    /// `body` is the kind byte slot followed by the plaintext; the slot is
    /// overwritten here. The caller appends the returned tag after the body
    /// on the wire.
    pub fn seal_in_place(&mut self, body: &mut [u8]) -> Result<[u8; TAG_LEN], Error> {
        debug_assert!(!body.is_empty());
        body[0] = KIND_MESSAGE;
        let nonce = self.nonce.next()?;
        let tag = self
            .cipher
            .encrypt_in_place_detached(&nonce, b"", body)
            .map_err(|_| Error::EncryptionFailed)?;
        Ok(tag.into())
    }
}

/// Receive-direction state before the peer's header has arrived. Holds the
/// keyed cipher but cannot open anything yet.
#[derive(ZeroizeOnDrop)]
pub struct PendingDecrypter {
    cipher: XChaCha20Poly1305,
}

impl PendingDecrypter {
    pub fn new(key: &Key) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(&key.0.into()),
        }
    }

    /// Consume the peer's header, producing a usable receive state.
    pub fn init(self, header: &Header) -> Decrypter {
        // Cloned rather than moved: the wiping Drop impl forbids moving fields out.
        Decrypter {
            nonce: Nonce::new(header),
            cipher: self.cipher.clone(),
        }
    }
}

/// Receive-direction state.
#[derive(ZeroizeOnDrop)]
pub struct Decrypter {
    cipher: XChaCha20Poly1305,
    nonce: Nonce,
}

impl Decrypter {
    /// Open one received ciphertext frame, yielding its plaintext.
    ///
    /// Rejects frames shorter than [`OVERHEAD`] before touching the cipher.
    /// Any authentication failure is terminal for the stream; the nonce is
    /// consumed either way.
    pub fn open(&mut self, frame: &[u8]) -> Result<Bytes, Error> {
        if frame.len() < OVERHEAD {
            return Err(Error::CiphertextTooShort(frame.len()));
        }
        let (body, tag) = frame.split_at(frame.len() - TAG_LEN);
        let nonce = self.nonce.next()?;
        let mut buf = BytesMut::from(body);
        self.cipher
            .decrypt_in_place_detached(&nonce, b"", &mut buf, Tag::from_slice(tag))
            .map_err(|_| Error::DecryptionFailed)?;
        // Strip the kind byte; callers only ever see plain payloads.
        Ok(buf.freeze().slice(1..))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn pair(key_byte: u8) -> (Encrypter, Decrypter) {
        let key = Key::from_bytes([key_byte; KEY_LEN]);
        let mut rng = StdRng::seed_from_u64(42);
        let (encrypter, header) = Encrypter::new(&key, &mut rng);
        let decrypter = PendingDecrypter::new(&key).init(&header);
        (encrypter, decrypter)
    }

    fn seal(encrypter: &mut Encrypter, plaintext: &[u8]) -> Vec<u8> {
        let mut body = vec![0u8; 1 + plaintext.len()];
        body[1..].copy_from_slice(plaintext);
        let tag = encrypter.seal_in_place(&mut body).unwrap();
        body.extend_from_slice(&tag);
        body
    }

    #[test]
    fn test_seal_open_round_trip() {
        let (mut encrypter, mut decrypter) = pair(7);
        let frame = seal(&mut encrypter, b"attack at dawn");
        assert_eq!(frame.len(), b"attack at dawn".len() + OVERHEAD);
        let plain = decrypter.open(&frame).unwrap();
        assert_eq!(plain, Bytes::from_static(b"attack at dawn"));
    }

    #[test]
    fn test_empty_plaintext_round_trip() {
        let (mut encrypter, mut decrypter) = pair(7);
        let frame = seal(&mut encrypter, b"");
        assert_eq!(frame.len(), OVERHEAD);
        let plain = decrypter.open(&frame).unwrap();
        assert!(plain.is_empty());
    }

    #[test]
    fn test_pending_state_initializes_after_delay() {
        let key = Key::from_bytes([6; KEY_LEN]);
        let mut rng = StdRng::seed_from_u64(3);
        let (mut encrypter, header) = Encrypter::new(&key, &mut rng);
        let pending = PendingDecrypter::new(&key);

        // Messages sealed before the header is consumed open fine afterwards.
        let first = seal(&mut encrypter, b"early");
        let second = seal(&mut encrypter, b"late");
        let mut decrypter = pending.init(&header);
        assert_eq!(decrypter.open(&first).unwrap(), Bytes::from_static(b"early"));
        assert_eq!(decrypter.open(&second).unwrap(), Bytes::from_static(b"late"));
    }

    #[test]
    fn test_sealed_frame_hides_plaintext() {
        let (mut encrypter, _) = pair(7);
        let frame = seal(&mut encrypter, b"supersecret");
        assert!(!frame
            .windows(b"supersecret".len())
            .any(|window| window == b"supersecret"));
    }

    #[test]
    fn test_messages_must_arrive_in_order() {
        let (mut encrypter, mut decrypter) = pair(7);
        let first = seal(&mut encrypter, b"first");
        let second = seal(&mut encrypter, b"second");

        // Delivering the second message first fails authentication.
        assert!(matches!(
            decrypter.open(&second),
            Err(Error::DecryptionFailed)
        ));
        // The nonce advanced on failure, so even the right message is now unreadable.
        assert!(matches!(
            decrypter.open(&first),
            Err(Error::DecryptionFailed)
        ));
    }

    #[test]
    fn test_ordered_sequence_round_trips() {
        let (mut encrypter, mut decrypter) = pair(9);
        for i in 0..20u8 {
            let message = vec![i; usize::from(i) + 1];
            let frame = seal(&mut encrypter, &message);
            assert_eq!(decrypter.open(&frame).unwrap(), Bytes::from(message));
        }
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let (mut encrypter, mut decrypter) = pair(7);
        let mut frame = seal(&mut encrypter, b"payload");
        frame[2] ^= 0x01;
        assert!(matches!(
            decrypter.open(&frame),
            Err(Error::DecryptionFailed)
        ));
    }

    #[test]
    fn test_short_frame_rejected() {
        let (_, mut decrypter) = pair(7);
        let result = decrypter.open(&[0u8; OVERHEAD - 1]);
        assert!(matches!(
            result,
            Err(Error::CiphertextTooShort(len)) if len == OVERHEAD - 1
        ));
    }

    #[test]
    fn test_wrong_key_fails() {
        let (mut encrypter, _) = pair(7);
        let (_, mut decrypter) = pair(8);
        let frame = seal(&mut encrypter, b"payload");
        assert!(matches!(
            decrypter.open(&frame),
            Err(Error::DecryptionFailed)
        ));
    }

    #[test]
    fn test_wrong_header_fails() {
        let key = Key::from_bytes([1; KEY_LEN]);
        let mut rng = StdRng::seed_from_u64(1);
        let (mut encrypter, _header) = Encrypter::new(&key, &mut rng);
        let mut decrypter = PendingDecrypter::new(&key).init(&Header([0xEE; HEADER_LEN]));
        let frame = seal(&mut encrypter, b"payload");
        assert!(matches!(
            decrypter.open(&frame),
            Err(Error::DecryptionFailed)
        ));
    }

    #[test]
    fn test_stream_id_is_deterministic_and_domain_separated() {
        let hash_a = [3u8; crate::handshake::HASH_LEN];
        let hash_b = [4u8; crate::handshake::HASH_LEN];
        assert_eq!(derive_stream_id(&hash_a), derive_stream_id(&hash_a));
        assert_ne!(derive_stream_id(&hash_a), derive_stream_id(&hash_b));
        // Not the bare hash of the transcript either.
        let bare: [u8; 32] = Sha256::digest(hash_a).into();
        assert_ne!(derive_stream_id(&hash_a).as_bytes(), &bare);
    }

    #[test]
    fn test_nonce_sequence_distinct() {
        let mut nonce = Nonce::new(&Header([0xFF; HEADER_LEN]));
        let first = nonce.next().unwrap();
        let second = nonce.next().unwrap();
        let third = nonce.next().unwrap();
        assert_ne!(first, second);
        assert_ne!(second, third);
        // Base prefix is stable; only the trailing counter bytes move.
        assert_eq!(first[..HEADER_LEN - 8], second[..HEADER_LEN - 8]);
    }

    #[test]
    fn test_nonce_overflow_detected() {
        let mut nonce = Nonce::new(&Header([0u8; HEADER_LEN]));
        nonce.counter = u64::MAX;
        assert!(matches!(nonce.next(), Err(Error::NonceOverflow)));
    }
}
