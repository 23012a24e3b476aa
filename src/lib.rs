//! Encrypted, authenticated duplex streams over arbitrary transport.
//!
//! A [`SecretStream`] runs a Noise XX handshake over a pair of raw byte
//! channels, derives one cipher state per direction, and from then on carries
//! length-delimited, individually sealed messages. The raw channels can be
//! anything that moves ordered bytes ([`RawSink`]/[`RawStream`]): sockets,
//! pipes, the in-process [`bridge`], or another stream.
//!
//! Messages written before the handshake has produced keys are queued and
//! flushed in order the moment it completes, so callers never have to
//! sequence their writes against connection setup. Completed sessions can be
//! exported and later resumed without a new handshake, either by both sides
//! holding the result ([`Session::Resume`]) or by one side looking it up from
//! the announced stream id ([`Session::Accept`]).
//!
//! # Wire format
//!
//! Every unit on the wire is a frame: `length (u24 LE) || payload`. The
//! handshake exchanges three frames, after which each side announces a
//! one-time 24-byte cipher header (prefixed by the 32-byte stream id when
//! resuming). Data frames carry `kind byte || ciphertext || 16-byte tag`,
//! 17 bytes of overhead per message.
//!
//! # Security
//!
//! The handshake pattern is `Noise_XX_25519_ChaChaPoly_BLAKE2b`: both static
//! keys travel encrypted and are mutually authenticated, and the 64-byte
//! transcript hash binds the whole exchange. Transport frames are sealed
//! with per-direction XChaCha20-Poly1305 states under random 24-byte base
//! nonces and a 64-bit counter. Frame lengths and the header announcements
//! are not themselves authenticated ahead of the AEAD: an active attacker
//! can truncate a stream, and a clean end-of-stream is unauthenticated.
//!
//! # Example
//!
//! ```
//! use futures::{executor::block_on, join};
//! use veilstream::{Config, SecretStream};
//!
//! block_on(async {
//!     let (mut client, mut server) =
//!         SecretStream::pair(Config::default(), Config::default()).unwrap();
//!     let (client_up, server_up) = join!(client.connect(), server.connect());
//!     client_up.unwrap();
//!     server_up.unwrap();
//!
//!     client.send(b"hello over an encrypted stream").await.unwrap();
//!     let message = server.recv().await.unwrap().unwrap();
//!     assert_eq!(&message[..], b"hello over an encrypted stream");
//!
//!     // Each side authenticated the other's static key during the handshake.
//!     assert_eq!(client.remote_public_key(), server.public_key());
//! });
//! ```

use std::io;
use thiserror::Error;

pub mod bridge;
pub mod cipher;
pub mod frame;
pub mod handshake;
pub mod raw;
pub mod stream;

pub use cipher::{derive_stream_id, Key, StreamId};
pub use handshake::{Handshake, HandshakeResult, KeyPair, PublicKey, Role};
pub use raw::{RawSink, RawStream};
pub use stream::{Destroyer, Pending, Phase, Receiver, SecretStream, SendBuf, Sender};

/// Errors that can occur when interacting with a stream.
#[derive(Error, Debug)]
pub enum Error {
    // Handshake errors
    #[error("handshake failed: {0}")]
    Handshake(snow::Error),
    #[error("invalid handshake message: {0} bytes")]
    InvalidHandshakeMessage(usize),
    #[error("key pair resolution failed: {0}")]
    KeyPairResolution(io::Error),

    // Session errors
    #[error("invalid header message: {0} bytes")]
    InvalidHeader(usize),
    #[error("stream id mismatch")]
    StreamIdMismatch,
    #[error("unknown stream id")]
    UnknownStreamId,

    // Connection errors
    #[error("recv failed")]
    RecvFailed(io::Error),
    #[error("recv too large: {0} bytes")]
    RecvTooLarge(usize),
    #[error("send failed")]
    SendFailed(io::Error),
    #[error("send too large: {0} bytes")]
    SendTooLarge(usize),
    #[error("connection closed")]
    StreamClosed,
    #[error("stream destroyed")]
    StreamDestroyed,

    // Encryption errors
    #[error("nonce overflow")]
    NonceOverflow,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),
}

/// Default cap on plaintext message size, in either direction.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Configuration for a stream.
///
/// # Warning
///
/// Synchronize `max_message_size` across both peers. A peer sending within
/// its own larger bound still gets disconnected by the receiver's.
pub struct Config {
    /// Static key pair authenticated by the handshake. A fresh one is
    /// generated when absent. Ignored when a session is supplied.
    pub key_pair: Option<KeyPair>,

    /// Maximum plaintext message size (in bytes). Inbound frames beyond it
    /// (plus sealing overhead) are rejected before any allocation. Prevents
    /// memory exhaustion by a hostile peer.
    pub max_message_size: usize,

    /// Skip the handshake and run on an already-established session.
    pub session: Option<Session>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            key_pair: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            session: None,
        }
    }
}

/// Resolver mapping an announced stream id to a stored session result.
pub type SessionLookup = Box<dyn FnMut(&StreamId) -> Option<HandshakeResult> + Send>;

/// How a stream reuses an established session instead of handshaking.
pub enum Session {
    /// Run directly on a result both sides already hold. Nothing about the
    /// session is announced on the wire.
    Preset(HandshakeResult),

    /// Resume a previous session, announcing its public [`StreamId`] ahead
    /// of the cipher header. A peer that resumed a different session is
    /// rejected fatally before any decryption is attempted.
    Resume(HandshakeResult),

    /// Accept whichever session the peer announces, resolving the id
    /// through a lookup. Unknown ids, and results whose transcript does not
    /// match the announced id, are fatal.
    Accept(SessionLookup),
}
