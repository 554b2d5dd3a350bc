//! Shared helpers for engine integration tests.
//!
//! Tests run one engine that both listens and connects over loopback, so a
//! single event stream carries both ends of every connection.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use reactor_net::{AddrKind, Address, Engine, Event, Mode, NetEvent, PeerStatus, Session};
use std::time::{Duration, Instant};

pub const STEP: Duration = Duration::from_millis(10);
pub const LIMIT: Duration = Duration::from_secs(5);

/// Engine plus every event it has produced so far.
///
/// Sessions from received events are retained in `kept` so that the host
/// side never drops a wrapper by accident.
pub struct Recorder {
    pub engine: Engine,
    pub unclaimed: Vec<NetEvent>,
    pub kept: Vec<Session>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::with_engine(Engine::new().expect("engine"))
    }

    pub fn with_engine(engine: Engine) -> Self {
        Self {
            engine,
            unclaimed: Vec::new(),
            kept: Vec::new(),
        }
    }

    /// One poll cycle followed by draining the queue
    pub fn pump(&mut self, timeout: Duration) {
        self.engine.update(timeout).expect("update");
        while let Some(net_event) = self.engine.receive() {
            self.kept.push(net_event.who.clone());
            self.unclaimed.push(net_event);
        }
    }

    pub fn pump_for(&mut self, duration: Duration) {
        let end = Instant::now() + duration;
        while Instant::now() < end {
            self.pump(STEP);
        }
    }

    /// Pump until an unclaimed event matches, then claim it
    pub fn wait_for(&mut self, pred: impl Fn(&NetEvent) -> bool) -> NetEvent {
        let deadline = Instant::now() + LIMIT;
        loop {
            if let Some(pos) = self.unclaimed.iter().position(&pred) {
                return self.unclaimed.remove(pos);
            }
            assert!(
                Instant::now() < deadline,
                "no matching event; unclaimed: {:?}",
                self.commands()
            );
            self.pump(STEP);
        }
    }

    /// Claim the next event of `who` with command `cmd`
    pub fn wait_event(&mut self, who: &Session, cmd: &str) -> Event {
        let who = who.clone();
        let cmd = cmd.to_owned();
        self.wait_for(move |e| e.who == who && e.event.command() == cmd)
            .event
    }

    /// Pump until `who` has been removed by the engine
    pub fn wait_closed(&mut self, who: &Session) {
        let deadline = Instant::now() + LIMIT;
        while who.status() != PeerStatus::Closed {
            assert!(Instant::now() < deadline, "peer never closed");
            self.pump(STEP);
        }
    }

    /// Whether an unclaimed event of `who` with command `cmd` exists
    pub fn has_event(&self, who: &Session, cmd: &str) -> bool {
        self.unclaimed
            .iter()
            .any(|e| &e.who == who && e.event.command() == cmd)
    }

    /// Drop every clone of `who` the recorder holds
    pub fn forget(&mut self, who: &Session) {
        self.kept.retain(|s| s != who);
        self.unclaimed.retain(|e| &e.who != who);
    }

    pub fn commands(&self) -> Vec<&'static str> {
        self.unclaimed.iter().map(|e| e.event.command()).collect()
    }
}

/// Port a listener is bound to
pub fn port_of(session: &Session) -> u16 {
    match session.addr(AddrKind::Local).expect("local address") {
        Address::Socket(addr) => addr.port(),
        other => panic!("unexpected address {other:?}"),
    }
}

/// A TCP listener and an outbound peer that has completed its connect,
/// plus the accepted side after its halo arrived.
pub struct Link {
    pub listener: Session,
    pub client: Session,
    pub server: Session,
}

pub fn link(recorder: &mut Recorder) -> Link {
    let listener = recorder
        .engine
        .server(Mode::Tcp, "127.0.0.1", 0, None)
        .expect("listen");
    let client = recorder
        .engine
        .connect(Mode::Tcp, "127.0.0.1", port_of(&listener))
        .expect("connect");

    recorder.wait_event(&client, "outgoing");
    let server = recorder
        .wait_for(|e| e.event == Event::Incoming)
        .who;
    recorder.wait_event(&server, "halo");

    Link {
        listener,
        client,
        server,
    }
}

/// `link` followed by a completed auth/accept exchange
pub fn established(recorder: &mut Recorder) -> Link {
    let link = link(recorder);
    link.client.auth("secret").expect("auth");
    recorder.wait_event(&link.server, "auth");
    link.server.accept("welcome").expect("accept");
    recorder.wait_event(&link.client, "accepted");
    link
}
