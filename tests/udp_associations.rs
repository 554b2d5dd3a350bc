#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! UDP listeners and outbound UDP peers over loopback.

mod common;

use bytes::Bytes;
use common::{port_of, Recorder};
use reactor_net::core::frame::{Frame, FrameCodec};
use reactor_net::{AddrKind, Address, Event, Mode, NetError, PeerStatus};
use std::net::UdpSocket;
use std::time::Duration;

#[test]
fn test_udp_echo_through_association() {
    let mut r = Recorder::new();
    let listener = r.engine.server(Mode::Udp, "127.0.0.1", 0, None).unwrap();
    let client = r
        .engine
        .connect(Mode::Udp, "127.0.0.1", port_of(&listener))
        .unwrap();

    assert_eq!(r.wait_event(&client, "outgoing"), Event::Outgoing);
    assert_eq!(client.status(), PeerStatus::Connected);

    client.send("ping over udp").unwrap();
    let association = r.wait_for(|e| e.event == Event::Incoming).who;
    assert_eq!(association.mode(), Mode::Udp);
    assert_eq!(
        r.wait_event(&association, "data"),
        Event::Data {
            bytes: Bytes::from_static(b"ping over udp")
        }
    );

    association.send("reply").unwrap();
    assert_eq!(
        r.wait_event(&client, "data"),
        Event::Data {
            bytes: Bytes::from_static(b"reply")
        }
    );

    match client.addr(AddrKind::Remote).unwrap() {
        Address::Socket(addr) => assert_eq!(addr.port(), port_of(&listener)),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_one_association_per_remote() {
    let mut r = Recorder::new();
    let listener = r.engine.server(Mode::Udp, "127.0.0.1", 0, None).unwrap();
    let port = port_of(&listener);

    let raw = UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut codec = FrameCodec::default();
    for i in 0..3u64 {
        let datagram = codec.encode_to_vec(Frame::Ping(i)).unwrap();
        raw.send_to(&datagram, ("127.0.0.1", port)).unwrap();
    }

    let association = r.wait_for(|e| e.event == Event::Incoming).who;
    for i in 0..3u64 {
        assert_eq!(
            r.wait_event(&association, "ping"),
            Event::Ping { timestamp: i }
        );
    }
    r.pump(Duration::from_millis(20));
    assert!(!r.unclaimed.iter().any(|e| e.event == Event::Incoming));
}

#[test]
fn test_handshake_frames_rejected_on_udp() {
    let mut r = Recorder::new();
    let listener = r.engine.server(Mode::Udp, "127.0.0.1", 0, None).unwrap();

    let raw = UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut codec = FrameCodec::default();
    raw.send_to(
        &codec.encode_to_vec(Frame::Data(Bytes::from_static(b"x"))).unwrap(),
        ("127.0.0.1", port_of(&listener)),
    )
    .unwrap();
    let association = r.wait_for(|e| e.event == Event::Incoming).who;

    raw.send_to(
        &codec.encode_to_vec(Frame::Halo(1)).unwrap(),
        ("127.0.0.1", port_of(&listener)),
    )
    .unwrap();
    r.wait_closed(&association);
    assert_eq!(listener.status(), PeerStatus::Listening);
}

#[test]
fn test_udp_listener_and_association_rules() {
    let mut r = Recorder::new();
    let listener = r.engine.server(Mode::Udp, "127.0.0.1", 0, None).unwrap();
    assert!(matches!(
        listener.send("x"),
        Err(NetError::InvalidState { .. })
    ));

    let client = r
        .engine
        .connect(Mode::Udp, "127.0.0.1", port_of(&listener))
        .unwrap();
    r.wait_event(&client, "outgoing");
    client.ping(9).unwrap();

    let association = r.wait_for(|e| e.event == Event::Incoming).who;
    assert_eq!(
        r.wait_event(&association, "ping"),
        Event::Ping { timestamp: 9 }
    );
    assert!(matches!(
        association.auth("secret"),
        Err(NetError::InvalidState { op: "auth", .. })
    ));

    association.close().unwrap();
    assert_eq!(association.status(), PeerStatus::Closed);
    assert_eq!(listener.status(), PeerStatus::Listening);
}
