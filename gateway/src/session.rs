use crate::codec::{CodecError, Frame, FrameDecoder};
use dashmap::DashMap;
use mio::{Interest, Token};
use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;

/// Identifier of one accepted connection. Never reused while the gateway
/// runs, so a stale id can only miss, never hit a newer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(usize);

impl SessionId {
    pub fn token(self) -> Token {
        Token(self.0)
    }

    pub fn from_token(token: Token) -> Self {
        Self(token.0)
    }

    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outbound buffer plus how far into it we've written.
#[derive(Debug)]
struct PendingWrite {
    frame: Frame,
    written: usize,
}

impl PendingWrite {
    fn remaining(&self) -> &[u8] {
        &self.frame.as_bytes()[self.written..]
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing left to write; the session only needs read interest.
    Drained,
    /// The socket stopped accepting bytes; retry on the next writable event.
    Pending,
}

/// Socket reads allowed per [`Session::read_frames`] call.
pub const READS_PER_CALL: usize = 4;

#[derive(Debug, Default)]
pub struct ReadOutcome {
    /// Frames completed by this call, in arrival order. Kept even when the
    /// call also ended with an error.
    pub frames: Vec<String>,
    pub peer_closed: bool,
    /// The read budget ran out before the socket would block.
    pub more: bool,
    pub error: Option<ReadError>,
}

#[derive(Debug)]
pub enum ReadError {
    Io(io::Error),
    Decode(CodecError),
}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadError::Io(e) => write!(f, "read failed: {e}"),
            ReadError::Decode(e) => write!(f, "decode failed: {e}"),
        }
    }
}

/// Per-connection state. Only the reactor thread touches it.
#[derive(Debug)]
pub struct Session<S> {
    stream: S,
    peer: SocketAddr,
    pending: Option<PendingWrite>,
    decoder: FrameDecoder,
    registered: Interest,
}

impl<S> Session<S> {
    pub fn new(stream: S, peer: SocketAddr, max_frame_len: usize) -> Self {
        Self {
            stream,
            peer,
            pending: None,
            decoder: FrameDecoder::new(max_frame_len),
            registered: Interest::READABLE,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Queues `frame` for delivery. At most one buffer is held per session:
    /// an undrained previous buffer is replaced and the new one is written
    /// from its first byte. If the old buffer was partly written, the peer
    /// receives that truncated prefix immediately followed by the new frame.
    pub fn assign(&mut self, frame: Frame) {
        self.pending = Some(PendingWrite { frame, written: 0 });
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Bytes of the pending buffer not yet written.
    pub fn pending_len(&self) -> usize {
        self.pending
            .as_ref()
            .map_or(0, |pending| pending.remaining().len())
    }

    /// The interest this session currently needs from the multiplexer.
    pub fn interest(&self) -> Interest {
        if self.has_pending() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    /// The interest last registered with the multiplexer.
    pub fn registered(&self) -> Interest {
        self.registered
    }

    pub fn set_registered(&mut self, interest: Interest) {
        self.registered = interest;
    }
}

impl<S: Write> Session<S> {
    /// Writes as much of the pending buffer as the socket takes without
    /// blocking. Resumes from where the previous call stopped.
    pub fn flush(&mut self) -> io::Result<FlushOutcome> {
        let Some(pending) = self.pending.as_mut() else {
            return Ok(FlushOutcome::Drained);
        };

        while !pending.remaining().is_empty() {
            match self.stream.write(pending.remaining()) {
                Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero)),
                Ok(n) => pending.written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(FlushOutcome::Pending),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        self.pending = None;
        Ok(FlushOutcome::Drained)
    }
}

impl<S: Read> Session<S> {
    /// Reads until the socket would block, the peer closes, an error occurs
    /// or [`READS_PER_CALL`] reads were made, and returns the frames
    /// completed by those bytes. `scratch` is the reactor's shared read
    /// buffer.
    pub fn read_frames(&mut self, scratch: &mut [u8]) -> ReadOutcome {
        let mut outcome = ReadOutcome::default();
        let mut reads = 0;
        while reads < READS_PER_CALL {
            match self.stream.read(scratch) {
                Ok(0) => {
                    outcome.peer_closed = true;
                    return outcome;
                }
                Ok(n) => {
                    reads += 1;
                    let decoded = self.decoder.push(&scratch[..n]);
                    outcome.frames.extend(decoded.frames);
                    if let Some(e) = decoded.error {
                        outcome.error = Some(ReadError::Decode(e));
                        return outcome;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return outcome,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    outcome.error = Some(ReadError::Io(e));
                    return outcome;
                }
            }
        }
        outcome.more = true;
        outcome
    }
}

/// Read-only view of the live sessions that other threads may consult.
/// Updated by the reactor on accept and teardown, so readers see an
/// eventually consistent picture.
#[derive(Debug, Clone, Default)]
pub struct ConnectedSet {
    peers: Arc<DashMap<SessionId, SocketAddr>>,
}

impl ConnectedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    #[cfg(test)]
    pub fn contains(&self, id: SessionId) -> bool {
        self.peers.contains_key(&id)
    }

    /// Snapshot of session ids; does not hold any shard lock afterwards.
    pub fn ids(&self) -> Vec<SessionId> {
        self.peers.iter().map(|entry| *entry.key()).collect()
    }

    pub fn peers(&self) -> Vec<(SessionId, SocketAddr)> {
        self.peers
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    fn insert(&self, id: SessionId, peer: SocketAddr) {
        self.peers.insert(id, peer);
    }

    fn remove(&self, id: SessionId) {
        self.peers.remove(&id);
    }

    fn clear(&self) {
        self.peers.clear();
    }
}

/// Arena of sessions keyed by id, owned by the reactor thread. Every
/// insert/remove is mirrored into the shared [`ConnectedSet`].
#[derive(Debug)]
pub struct SessionRegistry<S> {
    sessions: HashMap<SessionId, Session<S>>,
    connected: ConnectedSet,
    next_id: usize,
}

impl<S> SessionRegistry<S> {
    /// `first_id` lets the caller keep low token values for its own use.
    pub fn new(connected: ConnectedSet, first_id: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            connected,
            next_id: first_id,
        }
    }

    pub fn insert(&mut self, session: Session<S>) -> SessionId {
        let id = SessionId(self.next_id);
        self.next_id += 1;
        self.connected.insert(id, session.peer());
        self.sessions.insert(id, session);
        id
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session<S>> {
        self.sessions.get_mut(&id)
    }

    pub fn remove(&mut self, id: SessionId) -> Option<Session<S>> {
        self.connected.remove(id);
        self.sessions.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    /// Removes every session, e.g. on shutdown.
    pub fn drain(&mut self) -> Vec<(SessionId, Session<S>)> {
        self.connected.clear();
        self.sessions.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory stream: hands out scripted reads and accepts at most
    /// `write_budget` bytes before reporting `WouldBlock`.
    #[derive(Default)]
    struct ScriptedStream {
        reads: Vec<io::Result<Vec<u8>>>,
        written: Vec<u8>,
        write_budget: usize,
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.reads.is_empty() {
                return Err(ErrorKind::WouldBlock.into());
            }
            let chunk = self.reads.remove(0)?;
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.write_budget == 0 {
                return Err(ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.write_budget);
            self.written.extend_from_slice(&buf[..n]);
            self.write_budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn session(stream: ScriptedStream) -> Session<ScriptedStream> {
        Session::new(stream, peer(), 1024)
    }

    #[test]
    fn test_flush_drains_and_drops_write_interest() {
        let mut session = session(ScriptedStream {
            write_budget: 64,
            ..Default::default()
        });
        session.assign(Frame::from(&b"ANNOUNCE|1\n"[..]));
        assert_eq!(session.interest(), Interest::READABLE | Interest::WRITABLE);

        assert_eq!(session.flush().unwrap(), FlushOutcome::Drained);

        assert!(!session.has_pending());
        assert_eq!(session.interest(), Interest::READABLE);
        assert_eq!(session.stream_mut().written, b"ANNOUNCE|1\n");
    }

    #[test]
    fn test_partial_write_resumes_at_offset() {
        let mut session = session(ScriptedStream {
            write_budget: 4,
            ..Default::default()
        });
        session.assign(Frame::from(&b"0123456789"[..]));

        assert_eq!(session.flush().unwrap(), FlushOutcome::Pending);
        assert_eq!(session.pending_len(), 6);
        assert_eq!(session.interest(), Interest::READABLE | Interest::WRITABLE);

        session.stream_mut().write_budget = 3;
        assert_eq!(session.flush().unwrap(), FlushOutcome::Pending);

        session.stream_mut().write_budget = 100;
        assert_eq!(session.flush().unwrap(), FlushOutcome::Drained);

        // No byte re-sent, none skipped.
        assert_eq!(session.stream_mut().written, b"0123456789");
    }

    #[test]
    fn test_second_assignment_overwrites_undrained_buffer() {
        let mut session = session(ScriptedStream {
            write_budget: 3,
            ..Default::default()
        });
        session.assign(Frame::from(&b"first\n"[..]));
        assert_eq!(session.flush().unwrap(), FlushOutcome::Pending);

        session.assign(Frame::from(&b"second\n"[..]));
        assert_eq!(session.pending_len(), 7);

        session.stream_mut().write_budget = 100;
        assert_eq!(session.flush().unwrap(), FlushOutcome::Drained);

        // The cut-off prefix of the first frame stays on the wire.
        assert_eq!(session.stream_mut().written, b"firsecond\n");
    }

    #[test]
    fn test_flush_without_pending_is_drained() {
        let mut session = session(ScriptedStream::default());
        assert_eq!(session.flush().unwrap(), FlushOutcome::Drained);
    }

    #[test]
    fn test_zero_length_write_is_an_error() {
        struct ZeroWriter;
        impl Write for ZeroWriter {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut session = Session::new(ZeroWriter, peer(), 16);
        session.assign(Frame::from(&b"x"[..]));

        let err = session.flush().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WriteZero);
    }

    #[test]
    fn test_read_frames_accumulates_across_reads() {
        let mut session = session(ScriptedStream {
            reads: vec![Ok(b"POST|bob|Ti".to_vec()), Ok(b"tle|Body\nPOST|x|y|z\n".to_vec())],
            ..Default::default()
        });
        let mut scratch = [0u8; 64];

        let outcome = session.read_frames(&mut scratch);

        assert!(!outcome.peer_closed);
        assert!(!outcome.more);
        assert!(outcome.error.is_none());
        assert_eq!(
            outcome.frames,
            vec!["POST|bob|Title|Body".to_owned(), "POST|x|y|z".to_owned()]
        );
    }

    #[test]
    fn test_read_frames_reports_peer_close() {
        let mut session = session(ScriptedStream {
            reads: vec![Ok(b"POST|a|b|c\n".to_vec()), Ok(Vec::new())],
            ..Default::default()
        });
        let mut scratch = [0u8; 64];

        let outcome = session.read_frames(&mut scratch);

        assert!(outcome.peer_closed);
        assert_eq!(outcome.frames, vec!["POST|a|b|c".to_owned()]);
    }

    #[test]
    fn test_read_frames_surfaces_reset() {
        let mut session = session(ScriptedStream {
            reads: vec![Err(ErrorKind::ConnectionReset.into())],
            ..Default::default()
        });
        let mut scratch = [0u8; 64];

        assert!(matches!(
            session.read_frames(&mut scratch).error,
            Some(ReadError::Io(e)) if e.kind() == ErrorKind::ConnectionReset
        ));
    }

    #[test]
    fn test_read_frames_keeps_frames_read_before_invalid_utf8() {
        let mut session = session(ScriptedStream {
            reads: vec![Ok(b"POST|a|b|c\n".to_vec()), Ok(b"POST|d|e|f\n\xff\n".to_vec())],
            ..Default::default()
        });
        let mut scratch = [0u8; 64];

        let outcome = session.read_frames(&mut scratch);

        assert_eq!(
            outcome.frames,
            vec!["POST|a|b|c".to_owned(), "POST|d|e|f".to_owned()]
        );
        assert!(matches!(
            outcome.error,
            Some(ReadError::Decode(CodecError::InvalidUtf8))
        ));
    }

    #[test]
    fn test_read_frames_stops_after_read_budget() {
        let reads = (0..READS_PER_CALL + 2)
            .map(|i| Ok(format!("POST|a|b|{i}\n").into_bytes()))
            .collect();
        let mut session = session(ScriptedStream {
            reads,
            ..Default::default()
        });
        let mut scratch = [0u8; 64];

        let first = session.read_frames(&mut scratch);
        assert!(first.more);
        assert_eq!(first.frames.len(), READS_PER_CALL);

        let second = session.read_frames(&mut scratch);
        assert!(!second.more);
        assert_eq!(second.frames, vec!["POST|a|b|4".to_owned(), "POST|a|b|5".to_owned()]);
    }

    #[test]
    fn test_registry_mirrors_connected_set() {
        let connected = ConnectedSet::new();
        let mut registry = SessionRegistry::new(connected.clone(), 2);

        let first = registry.insert(session(ScriptedStream::default()));
        let second = registry.insert(session(ScriptedStream::default()));

        assert_eq!(first.as_usize(), 2);
        assert_eq!(second.as_usize(), 3);
        assert_eq!(connected.len(), 2);

        assert!(registry.remove(first).is_some());
        assert!(!connected.contains(first));
        assert!(connected.contains(second));
        assert!(registry.get_mut(first).is_none());

        // Ids are not reused after removal.
        let third = registry.insert(session(ScriptedStream::default()));
        assert_eq!(third.as_usize(), 4);

        assert_eq!(registry.drain().len(), 2);
        assert!(connected.is_empty());
        assert!(registry.is_empty());
    }
}
