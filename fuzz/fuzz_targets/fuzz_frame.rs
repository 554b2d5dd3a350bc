#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use reactor_net::core::frame::FrameCodec;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Stream decoding must stop cleanly on garbage, never panic or spin
    let mut codec = FrameCodec::new(64 * 1024);
    let mut buf = BytesMut::from(data);
    while let Ok(Some(_)) = codec.decode(&mut buf) {}

    let _ = codec.decode_datagram(data);
});
