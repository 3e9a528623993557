use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, warn};

use crate::protocol::codec::ResyncEvent;
use crate::protocol::packet::{DecodeError, Packet};

pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Constructed,
    Running,
    Stopping,
    Stopped,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SessionError {
    #[error("session is in view mode, live mutation rejected")]
    ViewMode,

    #[error("session is not running")]
    NotRunning,

    #[error("session is shutting down, new subscribers rejected")]
    ShuttingDown,
}

/// What a subscriber receives: a one-off snapshot on attach, then one
/// event per decoded packet, in decode order.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    Init {
        view_mode: bool,
        packets: Vec<Arc<Packet>>,
    },
    Packet(Arc<Packet>),
    History(Vec<Arc<Packet>>),
}

/// Diagnostic stream events. These never reach subscribers as packet
/// events; corrupt input manifests there only as gaps.
#[derive(Clone, Debug)]
pub enum Diagnostic {
    Decode { error: DecodeError, frame: Bytes },
    Resync { skipped: usize },
}

/// A sink registered with the session receives every published packet,
/// synchronously and in decode order.
pub trait PacketSink: Send + Sync {
    fn on_packet(&self, packet: &Arc<Packet>);
}

#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionCounters {
    pub packets: u64,
    pub decode_errors: u64,
    pub resyncs: u64,
}

struct Inner {
    state: SessionState,
    view_mode: bool,
    capacity: usize,
    history: VecDeque<Arc<Packet>>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<SessionEvent>>,
    next_subscriber: u64,
    sinks: Vec<Arc<dyn PacketSink>>,
    counters: SessionCounters,
}

impl Inner {
    fn broadcast(&mut self, event: &SessionEvent) {
        // senders to detached receivers are pruned as they surface
        self.subscribers
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }
}

/// Live capture session: bounded history ring, subscriber fan-out and
/// registered sinks.
///
/// Snapshot-on-attach and live delivery share one critical section, so
/// a new subscriber neither misses a packet decoded before its snapshot
/// nor sees one twice.
pub struct LiveSession {
    inner: Mutex<Inner>,
    diagnostics: broadcast::Sender<Diagnostic>,
    shutdown: watch::Sender<bool>,
}

impl LiveSession {
    pub fn new(capacity: usize) -> Self {
        Self::build(capacity, false, VecDeque::new())
    }

    /// A session pre-populated from a persisted export. No live decodes
    /// occur; mutating operations are rejected.
    pub fn in_view_mode(packets: Vec<Packet>) -> Self {
        let history: VecDeque<Arc<Packet>> = packets.into_iter().map(Arc::new).collect();
        let capacity = history.len().max(DEFAULT_HISTORY_CAPACITY);
        let mut session = Self::build(capacity, true, history);
        // view sessions are immediately serviceable
        session.inner.get_mut().expect("session lock").state = SessionState::Running;
        session
    }

    fn build(capacity: usize, view_mode: bool, history: VecDeque<Arc<Packet>>) -> Self {
        let (diagnostics, _) = broadcast::channel(64);
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Mutex::new(Inner {
                state: SessionState::Constructed,
                view_mode,
                capacity,
                history,
                subscribers: HashMap::new(),
                next_subscriber: 0,
                sinks: Vec::new(),
                counters: SessionCounters::default(),
            }),
            diagnostics,
            shutdown,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("session lock")
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn is_view_mode(&self) -> bool {
        self.lock().view_mode
    }

    pub fn counters(&self) -> SessionCounters {
        self.lock().counters
    }

    pub fn add_sink(&self, sink: Arc<dyn PacketSink>) {
        self.lock().sinks.push(sink);
    }

    /// Idempotent; a stopped session stays stopped.
    pub fn start(&self) {
        let mut inner = self.lock();
        if inner.state == SessionState::Constructed {
            inner.state = SessionState::Running;
        }
    }

    /// Publish one decoded packet: append to the ring, hand to every
    /// sink, push to every subscriber.
    pub fn publish(&self, packet: Packet) -> Result<(), SessionError> {
        let mut inner = self.lock();

        if inner.view_mode {
            return Err(SessionError::ViewMode);
        }
        if inner.state != SessionState::Running {
            return Err(SessionError::NotRunning);
        }

        let packet = Arc::new(packet);

        inner.history.push_back(packet.clone());
        while inner.history.len() > inner.capacity {
            inner.history.pop_front();
        }
        inner.counters.packets += 1;

        for sink in &inner.sinks {
            sink.on_packet(&packet);
        }

        inner.broadcast(&SessionEvent::Packet(packet));
        Ok(())
    }

    /// Attach a subscriber. The init event with the current history is
    /// already queued on the returned channel.
    pub fn subscribe(&self) -> Result<Subscription, SessionError> {
        let mut inner = self.lock();

        match inner.state {
            SessionState::Constructed | SessionState::Running => {}
            SessionState::Stopping | SessionState::Stopped => {
                return Err(SessionError::ShuttingDown)
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let init = SessionEvent::Init {
            view_mode: inner.view_mode,
            packets: inner.history.iter().cloned().collect(),
        };
        tx.send(init).expect("send to owned receiver");

        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        inner.subscribers.insert(id, tx);

        debug!(id, "subscriber attached");
        Ok(Subscription { id, events: rx })
    }

    /// Silent and idempotent.
    pub fn unsubscribe(&self, id: u64) {
        self.lock().subscribers.remove(&id);
    }

    /// Re-send the full history to every subscriber.
    pub fn broadcast_history(&self) {
        let mut inner = self.lock();
        let snapshot: Vec<Arc<Packet>> = inner.history.iter().cloned().collect();
        inner.broadcast(&SessionEvent::History(snapshot));
    }

    /// Drop the retained history. Rejected in view mode.
    pub fn clear(&self) -> Result<(), SessionError> {
        let mut inner = self.lock();
        if inner.view_mode {
            return Err(SessionError::ViewMode);
        }
        inner.history.clear();
        Ok(())
    }

    pub fn history_snapshot(&self) -> Vec<Arc<Packet>> {
        self.lock().history.iter().cloned().collect()
    }

    pub fn report_error(&self, error: DecodeError, frame: &[u8]) {
        let mut inner = self.lock();
        inner.counters.decode_errors += 1;
        drop(inner);

        warn!(%error, len = frame.len(), "frame failed to decode");
        let _ = self.diagnostics.send(Diagnostic::Decode {
            error,
            frame: Bytes::copy_from_slice(frame),
        });
    }

    pub fn report_resync(&self, event: ResyncEvent) {
        let mut inner = self.lock();
        inner.counters.resyncs += 1;
        drop(inner);

        debug!(skipped = event.skipped, "stream resynchronised");
        let _ = self.diagnostics.send(Diagnostic::Resync {
            skipped: event.skipped,
        });
    }

    pub fn diagnostics(&self) -> broadcast::Receiver<Diagnostic> {
        self.diagnostics.subscribe()
    }

    /// Stop the session: pending subscriber deliveries are cancelled by
    /// dropping their channels, sinks have already seen every published
    /// packet.
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.state == SessionState::Stopped {
            return;
        }
        inner.state = SessionState::Stopping;
        inner.subscribers.clear();
        inner.state = SessionState::Stopped;
        drop(inner);

        let _ = self.shutdown.send(true);
    }

    /// Resolves once `close` has run.
    pub async fn closed(&self) {
        let mut rx = self.shutdown.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use packed_struct::prelude::PackedStruct;

    use super::*;
    use crate::protocol::address::Address;
    use crate::protocol::command::{Command, DataType, PacketType};
    use crate::protocol::message::{MessageSet, MessageValue};
    use crate::protocol::packet::encode_frame;

    fn packet(number: u8) -> Packet {
        let command = Command::new(PacketType::Normal, DataType::Notification, number);
        let frame = encode_frame(
            Address::new(0x20, 0, 0),
            Address::new(0x50, 0, 0),
            command,
            &[MessageSet::new(0x4000, MessageValue::Enum(1))],
        )
        .unwrap();
        Packet::decode(&frame).unwrap()
    }

    fn running_session(capacity: usize) -> LiveSession {
        let session = LiveSession::new(capacity);
        session.start();
        session
    }

    #[tokio::test]
    async fn snapshot_then_live_events_exactly_once() {
        let session = running_session(10);

        session.publish(packet(0)).unwrap();
        session.publish(packet(1)).unwrap();

        let mut sub = session.subscribe().unwrap();
        session.publish(packet(2)).unwrap();

        let init = sub.events.recv().await.unwrap();
        let snapshot = match init {
            SessionEvent::Init { view_mode, packets } => {
                assert!(!view_mode);
                packets
            }
            other => panic!("expected init, got {other:?}"),
        };
        let numbers: Vec<u8> = snapshot.iter().map(|p| p.command.packet_number).collect();
        assert_eq!(numbers, [0, 1]);

        match sub.events.recv().await.unwrap() {
            SessionEvent::Packet(p) => assert_eq!(p.command.packet_number, 2),
            other => panic!("expected packet, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ring_evicts_oldest() {
        let session = running_session(2);
        for n in 0..3 {
            session.publish(packet(n)).unwrap();
        }

        let numbers: Vec<u8> = session
            .history_snapshot()
            .iter()
            .map(|p| p.command.packet_number)
            .collect();
        assert_eq!(numbers, [1, 2]);
        assert_eq!(session.counters().packets, 3);
    }

    #[tokio::test]
    async fn subscribers_see_packets_in_decode_order() {
        let session = running_session(100);
        let mut sub = session.subscribe().unwrap();

        for n in 0..20 {
            session.publish(packet(n)).unwrap();
        }

        // skip init
        sub.events.recv().await.unwrap();

        for n in 0..20 {
            match sub.events.recv().await.unwrap() {
                SessionEvent::Packet(p) => assert_eq!(p.command.packet_number, n),
                other => panic!("expected packet, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn view_mode_rejects_mutation() {
        let session = LiveSession::in_view_mode(vec![packet(7)]);
        assert_eq!(session.state(), SessionState::Running);
        assert!(session.is_view_mode());

        assert_eq!(session.publish(packet(0)), Err(SessionError::ViewMode));
        assert_eq!(session.clear(), Err(SessionError::ViewMode));

        let mut sub = session.subscribe().unwrap();
        match sub.events.recv().await.unwrap() {
            SessionEvent::Init { view_mode, packets } => {
                assert!(view_mode);
                assert_eq!(packets.len(), 1);
            }
            other => panic!("expected init, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn state_machine() {
        let session = LiveSession::new(10);
        assert_eq!(session.state(), SessionState::Constructed);
        assert_eq!(session.publish(packet(0)), Err(SessionError::NotRunning));

        session.start();
        session.start();
        assert_eq!(session.state(), SessionState::Running);

        session.close();
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.subscribe().unwrap_err(), SessionError::ShuttingDown);

        // closing again is harmless, and a stopped session does not restart
        session.close();
        session.start();
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn close_cancels_subscribers() {
        let session = running_session(10);
        let mut sub = session.subscribe().unwrap();
        sub.events.recv().await.unwrap(); // init

        session.close();
        assert!(sub.events.recv().await.is_none());
        session.closed().await;
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let session = running_session(10);
        let sub = session.subscribe().unwrap();
        session.unsubscribe(sub.id);
        session.unsubscribe(sub.id);

        // publishing after detach must not fail
        session.publish(packet(0)).unwrap();
    }

    #[tokio::test]
    async fn diagnostics_carry_errors_and_resyncs() {
        let session = running_session(10);
        let mut diag = session.diagnostics();

        session.report_error(DecodeError::InvalidEnd, &[0x32, 0x00]);
        session.report_resync(ResyncEvent { skipped: 5 });

        match diag.recv().await.unwrap() {
            Diagnostic::Decode { error, frame } => {
                assert_eq!(error, DecodeError::InvalidEnd);
                assert_eq!(&frame[..], &[0x32, 0x00]);
            }
            other => panic!("expected decode diagnostic, got {other:?}"),
        }
        match diag.recv().await.unwrap() {
            Diagnostic::Resync { skipped } => assert_eq!(skipped, 5),
            other => panic!("expected resync diagnostic, got {other:?}"),
        }

        let counters = session.counters();
        assert_eq!(counters.decode_errors, 1);
        assert_eq!(counters.resyncs, 1);
    }

    #[tokio::test]
    async fn sinks_observe_every_publish() {
        use std::sync::atomic::{AtomicU64, Ordering};

        struct CountingSink(AtomicU64);
        impl PacketSink for CountingSink {
            fn on_packet(&self, _packet: &Arc<Packet>) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let session = running_session(10);
        let sink = Arc::new(CountingSink(AtomicU64::new(0)));
        session.add_sink(sink.clone());

        for n in 0..4 {
            session.publish(packet(n)).unwrap();
        }
        assert_eq!(sink.0.load(Ordering::SeqCst), 4);
    }
}
