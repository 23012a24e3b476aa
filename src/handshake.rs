//! Noise XX handshake orchestration.
//!
//! Both peers run a 3-message XX exchange (`Noise_XX_25519_ChaChaPoly_BLAKE2b`, empty
//! payloads) that mutually authenticates the static x25519 keys and derives one
//! symmetric key per direction plus the 64-byte transcript hash. The coordinator is a
//! consuming state machine: each `send`/`recv` takes it by value and returns either the
//! next state (with a framed message to write, when the pattern calls for one) or the
//! negotiated material. Completing or failing the exchange drops the underlying Noise
//! state, which wipes its secrets.

use crate::{cipher::Key, frame, Error};
use rand::{CryptoRng, RngCore};
use snow::{Builder, HandshakeState};
use x25519_dalek::StaticSecret;

/// Noise pattern every stream speaks.
const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2b";

/// Transcript hash length (BLAKE2b).
pub const HASH_LEN: usize = 64;

/// Static public key length (x25519).
pub const PUBLIC_KEY_LEN: usize = 32;

/// Payload sizes of the three XX messages in exchange order: `e`, then
/// `e, ee, s, es`, then `s, se` (empty handshake payloads).
const MESSAGE_LENS: [usize; 3] = [32, 96, 64];

/// Scratch large enough for any handshake message plus its length prefix.
const SLAB_LEN: usize = 128;

/// Which side of the exchange this peer drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Sends the opening message.
    Initiator,
    /// Speaks only in response.
    Responder,
}

impl Role {
    pub fn is_initiator(&self) -> bool {
        matches!(self, Self::Initiator)
    }
}

/// A static x25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// A static x25519 key pair. The secret half is wiped on drop.
#[derive(Clone)]
pub struct KeyPair {
    public: PublicKey,
    secret: StaticSecret,
}

impl KeyPair {
    /// Generate a fresh random key pair.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self::from_secret(StaticSecret::random_from_rng(rng))
    }

    /// Derive a key pair deterministically from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(seed))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey(x25519_dalek::PublicKey::from(&secret).to_bytes());
        Self { public, secret }
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }
}

/// Everything a completed handshake yields. Also the unit a caller stores to
/// resume a session later without re-running the exchange.
#[derive(Clone)]
pub struct HandshakeResult {
    /// Key for the local send direction.
    pub tx: Key,
    /// Key for the local receive direction.
    pub rx: Key,
    /// Transcript hash, identical on both peers.
    pub handshake_hash: [u8; HASH_LEN],
    /// Local static public key.
    pub public_key: PublicKey,
    /// Authenticated static public key of the peer.
    pub remote_public_key: PublicKey,
}

/// Outcome of driving the coordinator one message forward.
pub enum Step {
    /// More messages to come. `send`, when present, is a framed message that
    /// must be written to the peer now.
    Next {
        handshake: Handshake,
        send: Option<Vec<u8>>,
    },
    /// Exchange complete. `send`, when present, is the final framed message
    /// (the initiator closes while producing its result).
    Complete {
        send: Option<Vec<u8>>,
        result: HandshakeResult,
    },
}

/// In-progress XX exchange.
pub struct Handshake {
    state: HandshakeState,
    role: Role,
    public_key: PublicKey,
    // Index of the next message in exchange order, sent or received.
    step: usize,
}

impl Handshake {
    pub fn new(role: Role, key_pair: &KeyPair) -> Result<Self, Error> {
        let params = NOISE_PATTERN.parse().map_err(Error::Handshake)?;
        let builder = Builder::new(params).local_private_key(key_pair.secret.as_bytes());
        let state = match role {
            Role::Initiator => builder.build_initiator(),
            Role::Responder => builder.build_responder(),
        }
        .map_err(Error::Handshake)?;
        Ok(Self {
            state,
            role,
            public_key: key_pair.public,
            step: 0,
        })
    }

    /// Whether any pattern message has been produced or consumed yet.
    pub(crate) fn started(&self) -> bool {
        self.step > 0
    }

    /// Produce the next outbound message proactively. Only the initiator opens
    /// this way; a responder calling out of turn fails.
    pub fn send(self) -> Result<Step, Error> {
        self.advance(None)
    }

    /// Consume one received handshake frame payload, replying in the same step
    /// when the pattern calls for it.
    pub fn recv(self, payload: &[u8]) -> Result<Step, Error> {
        self.advance(Some(payload))
    }

    fn advance(mut self, input: Option<&[u8]>) -> Result<Step, Error> {
        if let Some(payload) = input {
            if payload.len() != MESSAGE_LENS[self.step] {
                return Err(Error::InvalidHandshakeMessage(payload.len()));
            }
            let mut scratch = [0u8; SLAB_LEN];
            self.state
                .read_message(payload, &mut scratch)
                .map_err(Error::Handshake)?;
            self.step += 1;
            if self.state.is_handshake_finished() {
                return self.finish(None);
            }
        }
        let send = self.write_next()?;
        if self.state.is_handshake_finished() {
            return self.finish(Some(send));
        }
        Ok(Step::Next {
            handshake: self,
            send: Some(send),
        })
    }

    // Writes the next pattern message into a scratch slab, length prefix
    // inline so the caller can put it on the wire without another copy.
    fn write_next(&mut self) -> Result<Vec<u8>, Error> {
        let mut slab = [0u8; SLAB_LEN];
        let len = self
            .state
            .write_message(&[], &mut slab[frame::PREFIX_LEN..])
            .map_err(Error::Handshake)?;
        self.step += 1;
        slab[..frame::PREFIX_LEN].copy_from_slice(&frame::encode_len(len));
        Ok(slab[..frame::PREFIX_LEN + len].to_vec())
    }

    fn finish(mut self, send: Option<Vec<u8>>) -> Result<Step, Error> {
        let handshake_hash: [u8; HASH_LEN] = self
            .state
            .get_handshake_hash()
            .try_into()
            .expect("Failed to convert transcript hash to array");
        let remote_public_key = self
            .state
            .get_remote_static()
            .and_then(|bytes| <[u8; PUBLIC_KEY_LEN]>::try_from(bytes).ok())
            .map(PublicKey)
            .expect("Failed to read the authenticated remote static key");

        // The raw split is role-independent (initiator-to-responder first);
        // swap so tx always keys the local send direction.
        let (initiator_to_responder, responder_to_initiator) =
            self.state.dangerously_get_raw_split();
        let (tx, rx) = match self.role {
            Role::Initiator => (initiator_to_responder, responder_to_initiator),
            Role::Responder => (responder_to_initiator, initiator_to_responder),
        };

        Ok(Step::Complete {
            send,
            result: HandshakeResult {
                tx: Key::from_bytes(tx),
                rx: Key::from_bytes(rx),
                handshake_hash,
                public_key: self.public_key,
                remote_public_key,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_pair(seed: u8) -> KeyPair {
        KeyPair::from_seed([seed; 32])
    }

    // Drives a full exchange in memory, returning both results.
    fn run_exchange(
        initiator_keys: &KeyPair,
        responder_keys: &KeyPair,
    ) -> (HandshakeResult, HandshakeResult) {
        let initiator = Handshake::new(Role::Initiator, initiator_keys).unwrap();
        let responder = Handshake::new(Role::Responder, responder_keys).unwrap();

        let (initiator, msg1) = match initiator.send().unwrap() {
            Step::Next { handshake, send } => (handshake, send.unwrap()),
            Step::Complete { .. } => panic!("finished after one message"),
        };
        assert_eq!(msg1.len(), frame::PREFIX_LEN + MESSAGE_LENS[0]);

        let (responder, msg2) = match responder.recv(&msg1[frame::PREFIX_LEN..]).unwrap() {
            Step::Next { handshake, send } => (handshake, send.unwrap()),
            Step::Complete { .. } => panic!("responder finished early"),
        };
        assert_eq!(msg2.len(), frame::PREFIX_LEN + MESSAGE_LENS[1]);

        let (initiator_result, msg3) = match initiator.recv(&msg2[frame::PREFIX_LEN..]).unwrap() {
            Step::Complete { send, result } => (result, send.unwrap()),
            Step::Next { .. } => panic!("initiator did not finish on message 2"),
        };
        assert_eq!(msg3.len(), frame::PREFIX_LEN + MESSAGE_LENS[2]);

        let responder_result = match responder.recv(&msg3[frame::PREFIX_LEN..]).unwrap() {
            Step::Complete { send, result } => {
                assert!(send.is_none());
                result
            }
            Step::Next { .. } => panic!("responder did not finish on message 3"),
        };

        (initiator_result, responder_result)
    }

    #[test]
    fn test_exchange_cross_authenticates() {
        let initiator_keys = key_pair(1);
        let responder_keys = key_pair(2);
        let (initiator, responder) = run_exchange(&initiator_keys, &responder_keys);

        assert_eq!(initiator.remote_public_key, *responder_keys.public());
        assert_eq!(responder.remote_public_key, *initiator_keys.public());
        assert_eq!(initiator.public_key, *initiator_keys.public());
        assert_eq!(initiator.handshake_hash, responder.handshake_hash);
    }

    #[test]
    fn test_directional_keys_mirror() {
        let (initiator, responder) = run_exchange(&key_pair(1), &key_pair(2));
        assert_eq!(initiator.tx.as_bytes(), responder.rx.as_bytes());
        assert_eq!(initiator.rx.as_bytes(), responder.tx.as_bytes());
        assert_ne!(initiator.tx.as_bytes(), initiator.rx.as_bytes());
    }

    #[test]
    fn test_responder_cannot_open() {
        let responder = Handshake::new(Role::Responder, &key_pair(2)).unwrap();
        assert!(matches!(responder.send(), Err(Error::Handshake(_))));
    }

    #[test]
    fn test_wrong_size_message_rejected() {
        let responder = Handshake::new(Role::Responder, &key_pair(2)).unwrap();
        assert!(matches!(
            responder.recv(&[0u8; 31]),
            Err(Error::InvalidHandshakeMessage(31))
        ));
    }

    #[test]
    fn test_tampered_message_rejected() {
        let initiator = Handshake::new(Role::Initiator, &key_pair(1)).unwrap();
        let responder = Handshake::new(Role::Responder, &key_pair(2)).unwrap();

        let (initiator, msg1) = match initiator.send().unwrap() {
            Step::Next { handshake, send } => (handshake, send.unwrap()),
            Step::Complete { .. } => unreachable!(),
        };
        let (responder, msg2) = match responder.recv(&msg1[frame::PREFIX_LEN..]).unwrap() {
            Step::Next { handshake, send } => (handshake, send.unwrap()),
            Step::Complete { .. } => unreachable!(),
        };
        let mut msg3 = match initiator.recv(&msg2[frame::PREFIX_LEN..]).unwrap() {
            Step::Complete { send, .. } => send.unwrap(),
            Step::Next { .. } => unreachable!(),
        };

        // Message 3 carries the encrypted initiator static key. Flipping any
        // bit must fail authentication on the responder.
        msg3[frame::PREFIX_LEN + 5] ^= 0x40;
        assert!(matches!(
            responder.recv(&msg3[frame::PREFIX_LEN..]),
            Err(Error::Handshake(_))
        ));
    }

    #[test]
    fn test_seeded_key_pairs_are_deterministic() {
        let a = KeyPair::from_seed([7; 32]);
        let b = KeyPair::from_seed([7; 32]);
        let c = KeyPair::from_seed([8; 32]);
        assert_eq!(a.public(), b.public());
        assert_ne!(a.public(), c.public());
    }
}
