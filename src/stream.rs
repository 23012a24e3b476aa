//! Stream orchestration: drives the handshake, exchanges cipher headers, and
//! carries encrypted application frames over any [`RawSink`]/[`RawStream`]
//! pair.
//!
//! A [`SecretStream`] moves through three live phases. It starts handshaking
//! (or, with a resumed session, skips straight past it), then waits for the
//! peer's header announcement, and is established once both directions have
//! keys. Writes are accepted in every phase: anything sent before the send
//! key exists is buffered and flushed, in order, the moment keys become
//! available. Reads drive whatever setup is still outstanding before
//! returning application data.
//!
//! Destruction is the one cancellation primitive. Dropping an individual
//! operation future leaves the stream consistent and re-drivable, while
//! [`SecretStream::destroy`] (or a [`Destroyer`]) resolves every blocked
//! operation with [`Error::StreamDestroyed`] and wipes key material.

use crate::{
    bridge,
    cipher::{self, derive_stream_id, Decrypter, Encrypter, Header, PendingDecrypter, StreamId},
    frame::{self, Parser},
    handshake::{Handshake, HandshakeResult, KeyPair, PublicKey, Role, Step, HASH_LEN},
    raw::{RawSink, RawStream},
    Config, Error, Session, SessionLookup,
};
use bytes::{Bytes, BytesMut};
use futures::{
    channel::oneshot,
    future::{self, Either, Shared},
    pin_mut, FutureExt,
};
use rand::rngs::OsRng;
use std::{
    collections::VecDeque,
    future::Future,
    io, mem,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use tracing::debug;
use zeroize::Zeroize;

/// Chunk buffer of the in-process [`SecretStream::pair`] bridge.
const PAIR_CAPACITY: usize = 32;

/// Setup frames never exceed the second handshake message (96 bytes), so the
/// parser bound is kept at least this large until setup completes. Once the
/// stream is established the bound drops to the configured message cap.
const SETUP_FRAME_CAP: usize = 96;

// Frames must stay below the u24 length ceiling with sealing overhead included.
fn effective_max(max_message_size: usize) -> usize {
    max_message_size.min(frame::MAX_FRAME_LEN - cipher::OVERHEAD)
}

/// Lifecycle phase of a stream. Phases only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Exchanging handshake messages (or, when accepting a resumed session,
    /// waiting for the peer to announce which session it holds).
    Handshaking,
    /// Keys exist and the send direction is live; the peer's cipher header
    /// has not arrived yet.
    AwaitingHeader,
    /// Both directions are live.
    Established,
    /// Torn down. Every operation fails with [`Error::StreamDestroyed`].
    Destroyed,
}

// One-shot teardown signal shared by the stream, its halves, and destroyers.
// Firing is idempotent and observable both synchronously and as a future.
#[derive(Clone)]
struct Shutdown {
    fired: Arc<AtomicBool>,
    trigger: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    signal: Shared<oneshot::Receiver<()>>,
}

impl Shutdown {
    fn new() -> Self {
        let (trigger, signal) = oneshot::channel();
        Self {
            fired: Arc::new(AtomicBool::new(false)),
            trigger: Arc::new(Mutex::new(Some(trigger))),
            signal: signal.shared(),
        }
    }

    fn fire(&self) {
        self.fired.store(true, Ordering::SeqCst);
        if let Some(trigger) = self.trigger.lock().unwrap().take() {
            let _ = trigger.send(());
        }
    }

    fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        let _ = self.signal.clone().await;
    }
}

// Run an operation until it completes or the stream is destroyed, whichever
// comes first.
async fn race<F: Future>(shutdown: &Shutdown, operation: F) -> Result<F::Output, Error> {
    let destroyed = shutdown.wait();
    pin_mut!(destroyed);
    pin_mut!(operation);
    match future::select(destroyed, operation).await {
        Either::Left(((), _)) => Err(Error::StreamDestroyed),
        Either::Right((output, _)) => Ok(output),
    }
}

/// Handle that can destroy a stream without holding it, including while one
/// of its operations is blocked.
#[derive(Clone)]
pub struct Destroyer {
    shutdown: Shutdown,
}

impl Destroyer {
    /// Tear the stream down. Blocked operations resolve with
    /// [`Error::StreamDestroyed`] and later calls fail the same way.
    pub fn destroy(&self) {
        self.shutdown.fire();
    }
}

/// An outgoing message allocated frame-shaped up front: callers fill the
/// plaintext window in place and hand the buffer back, and sealing reuses
/// the same allocation for the length prefix, ciphertext, and tag.
pub struct SendBuf {
    frame: BytesMut,
}

impl SendBuf {
    fn zeroed(len: usize) -> Self {
        Self {
            frame: BytesMut::zeroed(frame::PREFIX_LEN + cipher::OVERHEAD + len),
        }
    }

    fn copy_from(message: &[u8]) -> Self {
        let mut buf = Self::zeroed(message.len());
        buf.plaintext_mut().copy_from_slice(message);
        buf
    }

    /// The writable plaintext window.
    pub fn plaintext_mut(&mut self) -> &mut [u8] {
        let end = self.frame.len() - cipher::TAG_LEN;
        &mut self.frame[frame::PREFIX_LEN + 1..end]
    }

    /// Plaintext length this buffer was allocated for.
    pub fn len(&self) -> usize {
        self.frame.len() - frame::PREFIX_LEN - cipher::OVERHEAD
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn seal(mut self, encrypter: &mut Encrypter) -> Result<Bytes, Error> {
        let mut frame_buf = mem::take(&mut self.frame);
        let body_len = frame_buf.len() - frame::PREFIX_LEN;
        frame_buf[..frame::PREFIX_LEN].copy_from_slice(&frame::encode_len(body_len));
        let tag_start = frame_buf.len() - cipher::TAG_LEN;
        match encrypter.seal_in_place(&mut frame_buf[frame::PREFIX_LEN..tag_start]) {
            Ok(tag) => {
                frame_buf[tag_start..].copy_from_slice(&tag);
                Ok(frame_buf.freeze())
            }
            Err(error) => {
                frame_buf.as_mut().zeroize();
                Err(error)
            }
        }
    }
}

impl Drop for SendBuf {
    // Unsent plaintext does not outlive the buffer.
    fn drop(&mut self) {
        self.frame.as_mut().zeroize();
    }
}

#[derive(Clone)]
struct Attrs {
    public_key: PublicKey,
    remote_public_key: PublicKey,
    handshake_hash: [u8; HASH_LEN],
    stream_id: Option<StreamId>,
}

enum SetupState {
    Handshaking(Option<Handshake>),
    Accepting(SessionLookup),
    AwaitingHeader,
    Established,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SetupKind {
    Handshaking,
    Accepting,
    AwaitingHeader,
    Established,
}

// Inbound side: raw chunks in, parsed frames out. Chunk boundaries carry no
// meaning, so frames are buffered here until the stream consumes them.
struct RecvState<St: RawStream> {
    stream: St,
    parser: Parser,
    frames: VecDeque<Bytes>,
    eof: bool,
}

impl<St: RawStream> RecvState<St> {
    // Next parsed frame, reading more chunks as needed. Ok(None) is a clean
    // end of the inbound direction and is sticky.
    async fn next_frame(&mut self, shutdown: &Shutdown) -> Result<Option<Bytes>, Error> {
        loop {
            if let Some(frame) = self.frames.pop_front() {
                // Frames buffered before the bound tightened are re-checked
                // on the way out.
                if frame.len() > self.parser.max_len() {
                    return Err(Error::RecvTooLarge(frame.len()));
                }
                return Ok(Some(frame));
            }
            if self.eof {
                return Ok(None);
            }
            let chunk = race(shutdown, self.stream.recv())
                .await?
                .map_err(Error::RecvFailed)?;
            match chunk {
                Some(chunk) => {
                    let stream = &mut self.stream;
                    self.parser
                        .push(chunk, &mut self.frames, |more| stream.expect(more))?;
                }
                None => self.eof = true,
            }
        }
    }
}

// Frames are queued synchronously and removed only once the transport has
// accepted them, so a dropped future never loses or reorders wire data.
async fn flush_wire<Si: RawSink>(
    sink: &mut Si,
    wire_out: &mut VecDeque<Bytes>,
    shutdown: &Shutdown,
) -> Result<(), Error> {
    while let Some(frame) = wire_out.front().cloned() {
        race(shutdown, sink.send(frame))
            .await?
            .map_err(Error::SendFailed)?;
        wire_out.pop_front();
    }
    Ok(())
}

/// An encrypted, authenticated duplex byte stream.
///
/// All operations take `&mut self`; use [`SecretStream::split`] for
/// concurrent sending and receiving from different tasks.
pub struct SecretStream<Si: RawSink, St: RawStream> {
    role: Role,
    session_mode: bool,
    shutdown: Shutdown,

    sink: Si,
    encrypter: Option<Encrypter>,
    wire_out: VecDeque<Bytes>,
    max_message_size: usize,
    pending: VecDeque<SendBuf>,

    recv: RecvState<St>,
    pending_decrypter: Option<PendingDecrypter>,
    decrypter: Option<Decrypter>,

    setup: SetupState,
    local_public: Option<PublicKey>,
    attrs: Option<Attrs>,
}

impl SecretStream<bridge::Sink, bridge::Stream> {
    /// Two streams wired back to back over an in-process bridge, initiator
    /// first. Useful for loopback transports and tests.
    pub fn pair(initiator: Config, responder: Config) -> Result<(Self, Self), Error> {
        let ((left_sink, left_stream), (right_sink, right_stream)) = bridge::pair(PAIR_CAPACITY);
        Ok((
            Self::new(Role::Initiator, left_sink, left_stream, initiator)?,
            Self::new(Role::Responder, right_sink, right_stream, responder)?,
        ))
    }
}

impl<Si: RawSink, St: RawStream> SecretStream<Si, St> {
    /// Create a stream over the given transport. Nothing is transmitted
    /// until the first operation drives it.
    pub fn new(role: Role, sink: Si, stream: St, config: Config) -> Result<Self, Error> {
        Self::attached(role, sink, stream, config, VecDeque::new())
    }

    fn attached(
        role: Role,
        sink: Si,
        stream: St,
        config: Config,
        queue: VecDeque<SendBuf>,
    ) -> Result<Self, Error> {
        let Config {
            key_pair,
            max_message_size,
            session,
        } = config;
        let max_message_size = effective_max(max_message_size);
        let parser_limit = (max_message_size + cipher::OVERHEAD).max(SETUP_FRAME_CAP);
        let session_mode = matches!(session, Some(Session::Resume(_) | Session::Accept(_)));
        let mut this = Self {
            role,
            session_mode,
            shutdown: Shutdown::new(),
            sink,
            encrypter: None,
            wire_out: VecDeque::new(),
            max_message_size,
            pending: queue,
            recv: RecvState {
                stream,
                parser: Parser::new(parser_limit),
                frames: VecDeque::new(),
                eof: false,
            },
            pending_decrypter: None,
            decrypter: None,
            setup: SetupState::AwaitingHeader,
            local_public: None,
            attrs: None,
        };
        match session {
            Some(Session::Preset(result) | Session::Resume(result)) => {
                this.install_result(result)?;
            }
            Some(Session::Accept(lookup)) => {
                this.setup = SetupState::Accepting(lookup);
            }
            None => {
                let key_pair = key_pair.unwrap_or_else(|| KeyPair::generate(&mut OsRng));
                this.local_public = Some(*key_pair.public());
                this.setup = SetupState::Handshaking(Some(Handshake::new(role, &key_pair)?));
            }
        }
        Ok(this)
    }

    /// Drive setup until the send direction is live: the handshake is
    /// complete (or the resumed session accepted) and everything queued so
    /// far is on the wire. Receiving may still be awaiting the peer header.
    pub async fn connect(&mut self) -> Result<(), Error> {
        self.check_live()?;
        loop {
            let result = match self.setup_kind() {
                SetupKind::Handshaking => self.step_handshake().await,
                SetupKind::Accepting => self.step_accept().await,
                _ => break,
            };
            if let Err(error) = result {
                return Err(self.fail(error));
            }
        }
        if let Err(error) = self.flush().await {
            return Err(self.fail(error));
        }
        Ok(())
    }

    /// Encrypt and transmit one message. Before keys exist the message is
    /// queued and the call returns immediately; afterwards it completes once
    /// the transport has accepted the frame.
    pub async fn send(&mut self, message: &[u8]) -> Result<(), Error> {
        self.check_live()?;
        if message.len() > self.max_message_size {
            return Err(Error::SendTooLarge(message.len()));
        }
        self.dispatch(SendBuf::copy_from(message)).await
    }

    /// Allocate a buffer for [`SecretStream::send_buf`]. Filling it in place
    /// avoids the copy that [`SecretStream::send`] makes.
    pub fn alloc(&self, len: usize) -> SendBuf {
        SendBuf::zeroed(len)
    }

    /// Like [`SecretStream::send`], but seals a buffer the caller filled.
    pub async fn send_buf(&mut self, buf: SendBuf) -> Result<(), Error> {
        self.check_live()?;
        if buf.len() > self.max_message_size {
            return Err(Error::SendTooLarge(buf.len()));
        }
        self.dispatch(buf).await
    }

    /// Receive the next message, driving any outstanding setup first.
    /// Ok(None) means the peer cleanly ended its send direction; this side
    /// may keep sending.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, Error> {
        self.check_live()?;
        self.establish().await?;
        let shutdown = self.shutdown.clone();
        let frame = match self.recv.next_frame(&shutdown).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(None),
            Err(error) => return Err(self.fail(error)),
        };
        let decrypter = self
            .decrypter
            .as_mut()
            .expect("established stream has a decrypter");
        match decrypter.open(&frame) {
            Ok(message) => Ok(Some(message)),
            Err(error) => Err(self.fail(error)),
        }
    }

    /// End the send direction cleanly. Outstanding setup and queued messages
    /// are pushed out first; the receive direction stays usable.
    pub async fn close(&mut self) -> Result<(), Error> {
        self.connect().await?;
        let shutdown = self.shutdown.clone();
        match race(&shutdown, self.sink.close()).await {
            Ok(result) => result.map_err(|error| self.fail(Error::SendFailed(error))),
            Err(destroyed) => Err(self.fail(destroyed)),
        }
    }

    /// Drive setup to completion and split into independently owned send and
    /// receive halves sharing one teardown signal.
    pub async fn split(mut self) -> Result<(Sender<Si>, Receiver<St>), Error> {
        self.check_live()?;
        self.establish().await?;
        let (Some(encrypter), Some(decrypter), Some(attrs)) = (
            self.encrypter.take(),
            self.decrypter.take(),
            self.attrs.take(),
        ) else {
            unreachable!("established stream is missing cipher state");
        };
        Ok((
            Sender {
                sink: self.sink,
                encrypter,
                wire_out: self.wire_out,
                max_message_size: self.max_message_size,
                shutdown: self.shutdown.clone(),
                attrs: attrs.clone(),
            },
            Receiver {
                recv: self.recv,
                decrypter,
                shutdown: self.shutdown,
                attrs,
            },
        ))
    }

    /// Tear the stream down immediately and wipe key material. Nothing is
    /// flushed; use [`SecretStream::close`] for an orderly end.
    pub fn destroy(mut self) {
        self.shutdown.fire();
        self.wipe();
    }

    /// A clonable handle that destroys this stream from elsewhere.
    pub fn destroyer(&self) -> Destroyer {
        Destroyer {
            shutdown: self.shutdown.clone(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_initiator(&self) -> bool {
        self.role.is_initiator()
    }

    pub fn phase(&self) -> Phase {
        if self.shutdown.is_fired() {
            return Phase::Destroyed;
        }
        match self.setup_kind() {
            SetupKind::Handshaking => Phase::Handshaking,
            SetupKind::Accepting | SetupKind::AwaitingHeader => Phase::AwaitingHeader,
            SetupKind::Established => Phase::Established,
        }
    }

    /// Local static key. None while a deferred key pair or accepted session
    /// has not produced one yet.
    pub fn public_key(&self) -> Option<PublicKey> {
        self.local_public
    }

    /// The peer's authenticated static key, once keys exist.
    pub fn remote_public_key(&self) -> Option<PublicKey> {
        self.attrs.as_ref().map(|attrs| attrs.remote_public_key)
    }

    /// Transcript hash binding both sides of the session, once keys exist.
    pub fn handshake_hash(&self) -> Option<&[u8; HASH_LEN]> {
        self.attrs.as_ref().map(|attrs| &attrs.handshake_hash)
    }

    /// Public session identifier. Only resumed and accepted sessions carry
    /// one.
    pub fn stream_id(&self) -> Option<StreamId> {
        self.attrs.as_ref().and_then(|attrs| attrs.stream_id)
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    fn setup_kind(&self) -> SetupKind {
        match &self.setup {
            SetupState::Handshaking(_) => SetupKind::Handshaking,
            SetupState::Accepting(_) => SetupKind::Accepting,
            SetupState::AwaitingHeader => SetupKind::AwaitingHeader,
            SetupState::Established => SetupKind::Established,
        }
    }

    fn check_live(&mut self) -> Result<(), Error> {
        if self.shutdown.is_fired() {
            self.wipe();
            return Err(Error::StreamDestroyed);
        }
        Ok(())
    }

    // Drive setup until both directions are live.
    async fn establish(&mut self) -> Result<(), Error> {
        loop {
            let result = match self.setup_kind() {
                SetupKind::Handshaking => self.step_handshake().await,
                SetupKind::Accepting => self.step_accept().await,
                SetupKind::AwaitingHeader => self.step_await_header().await,
                SetupKind::Established => return Ok(()),
            };
            if let Err(error) = result {
                return Err(self.fail(error));
            }
        }
    }

    fn handshake_wants_frame(&self) -> bool {
        match &self.setup {
            // The initiator's opening message consumes no input.
            SetupState::Handshaking(Some(handshake)) => {
                !(self.role.is_initiator() && !handshake.started())
            }
            _ => true,
        }
    }

    async fn step_handshake(&mut self) -> Result<(), Error> {
        let input = if self.handshake_wants_frame() {
            Some(self.read_setup_frame().await?)
        } else {
            None
        };
        let step = match mem::replace(&mut self.setup, SetupState::AwaitingHeader) {
            SetupState::Handshaking(Some(handshake)) => match input {
                Some(frame) => handshake.recv(&frame),
                None => handshake.send(),
            },
            _ => unreachable!("handshake step outside the handshake phase"),
        };
        match step? {
            Step::Next { handshake, send } => {
                if let Some(message) = send {
                    self.wire_out.push_back(Bytes::from(message));
                }
                self.setup = SetupState::Handshaking(Some(handshake));
            }
            Step::Complete { send, result } => {
                if let Some(message) = send {
                    self.wire_out.push_back(Bytes::from(message));
                }
                let peer = result.remote_public_key;
                self.install_result(result)?;
                debug!(role = ?self.role, ?peer, "handshake complete");
            }
        }
        self.flush().await
    }

    async fn step_accept(&mut self) -> Result<(), Error> {
        let frame = self.read_setup_frame().await?;
        if frame.len() != cipher::STREAM_ID_LEN + cipher::HEADER_LEN {
            return Err(Error::InvalidHeader(frame.len()));
        }
        let mut id_bytes = [0u8; cipher::STREAM_ID_LEN];
        id_bytes.copy_from_slice(&frame[..cipher::STREAM_ID_LEN]);
        let announced = StreamId::from_bytes(id_bytes);
        let result = match &mut self.setup {
            SetupState::Accepting(lookup) => lookup(&announced).ok_or(Error::UnknownStreamId)?,
            _ => unreachable!("accept step outside the accept phase"),
        };
        // The looked-up session must hold the transcript the id was derived
        // from, or the peer would get keys for someone else's session.
        if derive_stream_id(&result.handshake_hash) != announced {
            return Err(Error::StreamIdMismatch);
        }
        self.install_result(result)?;
        self.init_decrypter(&frame[cipher::STREAM_ID_LEN..])?;
        self.flush().await
    }

    async fn step_await_header(&mut self) -> Result<(), Error> {
        let frame = self.read_setup_frame().await?;
        let expected = if self.session_mode {
            cipher::STREAM_ID_LEN + cipher::HEADER_LEN
        } else {
            cipher::HEADER_LEN
        };
        if frame.len() != expected {
            return Err(Error::InvalidHeader(frame.len()));
        }
        let header_bytes = if self.session_mode {
            // Both sides must have resumed the same session.
            match self.attrs.as_ref().and_then(|attrs| attrs.stream_id) {
                Some(id) if frame[..cipher::STREAM_ID_LEN] == id.as_bytes()[..] => {}
                _ => return Err(Error::StreamIdMismatch),
            }
            &frame[cipher::STREAM_ID_LEN..]
        } else {
            &frame[..]
        };
        self.init_decrypter(header_bytes)
    }

    // Make the keys of a completed (or resumed) handshake live: announce our
    // header, seal everything queued before keys existed, and start waiting
    // for the peer's announcement.
    fn install_result(&mut self, result: HandshakeResult) -> Result<(), Error> {
        let HandshakeResult {
            tx,
            rx,
            handshake_hash,
            public_key,
            remote_public_key,
        } = result;
        let stream_id = self.session_mode.then(|| derive_stream_id(&handshake_hash));

        let (mut encrypter, header) = Encrypter::new(&tx, &mut OsRng);
        self.pending_decrypter = Some(PendingDecrypter::new(&rx));

        // One announcement frame, ahead of every frame sealed with these
        // keys: the session id when resuming, then the header.
        let body_len = match stream_id {
            Some(_) => cipher::STREAM_ID_LEN + cipher::HEADER_LEN,
            None => cipher::HEADER_LEN,
        };
        let mut announce = BytesMut::with_capacity(frame::PREFIX_LEN + body_len);
        announce.extend_from_slice(&frame::encode_len(body_len));
        if let Some(id) = &stream_id {
            announce.extend_from_slice(id.as_bytes());
        }
        announce.extend_from_slice(header.as_ref());
        self.wire_out.push_back(announce.freeze());

        for buf in self.pending.drain(..) {
            let frame = buf.seal(&mut encrypter)?;
            self.wire_out.push_back(frame);
        }

        self.encrypter = Some(encrypter);
        self.local_public = Some(public_key);
        self.attrs = Some(Attrs {
            public_key,
            remote_public_key,
            handshake_hash,
            stream_id,
        });
        self.setup = SetupState::AwaitingHeader;
        Ok(())
    }

    fn init_decrypter(&mut self, header_bytes: &[u8]) -> Result<(), Error> {
        let bytes: [u8; cipher::HEADER_LEN] = header_bytes
            .try_into()
            .map_err(|_| Error::InvalidHeader(header_bytes.len()))?;
        let pending = self
            .pending_decrypter
            .take()
            .expect("receive key is installed before the header arrives");
        self.decrypter = Some(pending.init(&Header(bytes)));
        // No setup frame follows the header, so the parser no longer needs
        // room for one; from here the message cap bounds every frame.
        self.recv
            .parser
            .set_max_len(self.max_message_size + cipher::OVERHEAD);
        self.setup = SetupState::Established;
        debug!(role = ?self.role, "stream established");
        Ok(())
    }

    // Own queued frames go out before blocking on the peer, so two streams
    // driving setup against each other cannot deadlock.
    async fn read_setup_frame(&mut self) -> Result<Bytes, Error> {
        self.flush().await?;
        let shutdown = self.shutdown.clone();
        match self.recv.next_frame(&shutdown).await? {
            Some(frame) => Ok(frame),
            None => Err(Error::StreamClosed),
        }
    }

    async fn dispatch(&mut self, buf: SendBuf) -> Result<(), Error> {
        match self.encrypter.as_mut() {
            None => {
                self.pending.push_back(buf);
                Ok(())
            }
            Some(encrypter) => {
                let frame = match buf.seal(encrypter) {
                    Ok(frame) => frame,
                    Err(error) => return Err(self.fail(error)),
                };
                self.wire_out.push_back(frame);
                match self.flush().await {
                    Ok(()) => Ok(()),
                    Err(error) => Err(self.fail(error)),
                }
            }
        }
    }

    async fn flush(&mut self) -> Result<(), Error> {
        let shutdown = self.shutdown.clone();
        flush_wire(&mut self.sink, &mut self.wire_out, &shutdown).await
    }

    // Terminal error path: first failure tears the stream down, later ones
    // pass through untouched.
    fn fail(&mut self, error: Error) -> Error {
        if !self.shutdown.is_fired() {
            debug!(?error, role = ?self.role, "destroying stream");
        }
        self.shutdown.fire();
        self.wipe();
        error
    }

    fn wipe(&mut self) {
        self.encrypter = None;
        self.pending_decrypter = None;
        self.decrypter = None;
        self.pending.clear();
        self.wire_out.clear();
        if let SetupState::Handshaking(slot) = &mut self.setup {
            slot.take();
        }
    }
}

/// Send half of an established stream. See [`SecretStream::split`].
pub struct Sender<Si: RawSink> {
    sink: Si,
    encrypter: Encrypter,
    wire_out: VecDeque<Bytes>,
    max_message_size: usize,
    shutdown: Shutdown,
    attrs: Attrs,
}

impl<Si: RawSink> Sender<Si> {
    /// Encrypt and transmit one message.
    pub async fn send(&mut self, message: &[u8]) -> Result<(), Error> {
        if self.shutdown.is_fired() {
            return Err(Error::StreamDestroyed);
        }
        if message.len() > self.max_message_size {
            return Err(Error::SendTooLarge(message.len()));
        }
        self.transmit(SendBuf::copy_from(message)).await
    }

    /// Allocate a buffer for [`Sender::send_buf`].
    pub fn alloc(&self, len: usize) -> SendBuf {
        SendBuf::zeroed(len)
    }

    /// Seal and transmit a buffer the caller filled in place.
    pub async fn send_buf(&mut self, buf: SendBuf) -> Result<(), Error> {
        if self.shutdown.is_fired() {
            return Err(Error::StreamDestroyed);
        }
        if buf.len() > self.max_message_size {
            return Err(Error::SendTooLarge(buf.len()));
        }
        self.transmit(buf).await
    }

    /// End the send direction cleanly after flushing queued frames.
    pub async fn close(&mut self) -> Result<(), Error> {
        if self.shutdown.is_fired() {
            return Err(Error::StreamDestroyed);
        }
        let shutdown = self.shutdown.clone();
        if let Err(error) = flush_wire(&mut self.sink, &mut self.wire_out, &shutdown).await {
            return Err(self.fail(error));
        }
        match race(&shutdown, self.sink.close()).await {
            Ok(result) => result.map_err(|error| self.fail(Error::SendFailed(error))),
            Err(destroyed) => Err(self.fail(destroyed)),
        }
    }

    /// Destroy the whole stream, unblocking the receive half as well.
    pub fn destroy(self) {
        self.shutdown.fire();
    }

    pub fn destroyer(&self) -> Destroyer {
        Destroyer {
            shutdown: self.shutdown.clone(),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.attrs.public_key
    }

    pub fn remote_public_key(&self) -> PublicKey {
        self.attrs.remote_public_key
    }

    pub fn handshake_hash(&self) -> &[u8; HASH_LEN] {
        &self.attrs.handshake_hash
    }

    pub fn stream_id(&self) -> Option<StreamId> {
        self.attrs.stream_id
    }

    async fn transmit(&mut self, buf: SendBuf) -> Result<(), Error> {
        let frame = match buf.seal(&mut self.encrypter) {
            Ok(frame) => frame,
            Err(error) => return Err(self.fail(error)),
        };
        self.wire_out.push_back(frame);
        let shutdown = self.shutdown.clone();
        match flush_wire(&mut self.sink, &mut self.wire_out, &shutdown).await {
            Ok(()) => Ok(()),
            Err(error) => Err(self.fail(error)),
        }
    }

    fn fail(&mut self, error: Error) -> Error {
        if !self.shutdown.is_fired() {
            debug!(?error, "destroying stream");
        }
        self.shutdown.fire();
        self.wire_out.clear();
        error
    }
}

/// Receive half of an established stream. See [`SecretStream::split`].
pub struct Receiver<St: RawStream> {
    recv: RecvState<St>,
    decrypter: Decrypter,
    shutdown: Shutdown,
    attrs: Attrs,
}

impl<St: RawStream> Receiver<St> {
    /// Receive the next message. Ok(None) means the peer cleanly ended its
    /// send direction.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, Error> {
        if self.shutdown.is_fired() {
            return Err(Error::StreamDestroyed);
        }
        let shutdown = self.shutdown.clone();
        let frame = match self.recv.next_frame(&shutdown).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(None),
            Err(error) => return Err(self.fail(error)),
        };
        match self.decrypter.open(&frame) {
            Ok(message) => Ok(Some(message)),
            Err(error) => Err(self.fail(error)),
        }
    }

    /// Destroy the whole stream, unblocking the send half as well.
    pub fn destroy(self) {
        self.shutdown.fire();
    }

    pub fn destroyer(&self) -> Destroyer {
        Destroyer {
            shutdown: self.shutdown.clone(),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.attrs.public_key
    }

    pub fn remote_public_key(&self) -> PublicKey {
        self.attrs.remote_public_key
    }

    pub fn handshake_hash(&self) -> &[u8; HASH_LEN] {
        &self.attrs.handshake_hash
    }

    pub fn stream_id(&self) -> Option<StreamId> {
        self.attrs.stream_id
    }

    fn fail(&mut self, error: Error) -> Error {
        if !self.shutdown.is_fired() {
            debug!(?error, "destroying stream");
        }
        self.shutdown.fire();
        error
    }
}

/// A stream that does not have its transport yet. Writes are accepted and
/// queued; attaching produces a [`SecretStream`] that flushes them in order
/// once keys exist.
pub struct Pending {
    role: Role,
    config: Config,
    queue: VecDeque<SendBuf>,
}

impl Pending {
    pub fn new(role: Role, config: Config) -> Self {
        Self {
            role,
            config,
            queue: VecDeque::new(),
        }
    }

    /// Queue one message for transmission after attachment.
    pub fn send(&mut self, message: &[u8]) -> Result<(), Error> {
        if message.len() > effective_max(self.config.max_message_size) {
            return Err(Error::SendTooLarge(message.len()));
        }
        self.queue.push_back(SendBuf::copy_from(message));
        Ok(())
    }

    /// Allocate a buffer for [`Pending::send_buf`].
    pub fn alloc(&self, len: usize) -> SendBuf {
        SendBuf::zeroed(len)
    }

    /// Queue a buffer the caller filled in place.
    pub fn send_buf(&mut self, buf: SendBuf) -> Result<(), Error> {
        if buf.len() > effective_max(self.config.max_message_size) {
            return Err(Error::SendTooLarge(buf.len()));
        }
        self.queue.push_back(buf);
        Ok(())
    }

    /// Attach the transport, turning this into a live stream.
    pub fn attach<Si: RawSink, St: RawStream>(
        self,
        sink: Si,
        stream: St,
    ) -> Result<SecretStream<Si, St>, Error> {
        SecretStream::attached(self.role, sink, stream, self.config, self.queue)
    }

    /// Attach the transport once a key pair resolves, for key material that
    /// lives behind an async boundary. Queued writes are dropped and wiped
    /// if resolution fails.
    pub async fn attach_with<Si, St, F>(
        mut self,
        sink: Si,
        stream: St,
        key_pair: F,
    ) -> Result<SecretStream<Si, St>, Error>
    where
        Si: RawSink,
        St: RawStream,
        F: Future<Output = io::Result<KeyPair>>,
    {
        let key_pair = key_pair.await.map_err(Error::KeyPairResolution)?;
        self.config.key_pair = Some(key_pair);
        self.attach(sink, stream)
    }
}
