//! Shared fixtures for the integration suite: wire-level frame builders and
//! a gateway harness bound to an ephemeral port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use avlgate::codec::crc::crc16;
use avlgate::config::Config;
use avlgate::gateway::{
    AdmissionController, ChannelSink, CommandDispatcher, GatewayEvent, GatewayServer,
    SessionRegistry, ShutdownTrigger,
};

#[allow(dead_code)]
pub struct TestGateway {
    pub addr: SocketAddr,
    pub dispatcher: Arc<CommandDispatcher>,
    pub admission: Arc<AdmissionController>,
    pub registry: Arc<SessionRegistry>,
    pub events: mpsc::UnboundedReceiver<GatewayEvent>,
    pub shutdown: ShutdownTrigger,
}

/// Spawn a gateway on 127.0.0.1 with an ephemeral port, collecting events
/// through a channel sink.
#[allow(dead_code)]
pub async fn spawn_gateway(mut config: Config) -> TestGateway {
    config.gateway.bind = "127.0.0.1:0".to_string();
    let (sink, events) = ChannelSink::new();
    let mut server = GatewayServer::new(config, Arc::new(sink));
    let addr = server.bind().await.expect("bind gateway");
    let harness = TestGateway {
        addr,
        dispatcher: server.dispatcher(),
        admission: server.admission(),
        registry: server.registry(),
        events,
        shutdown: server.shutdown_trigger(),
    };
    tokio::spawn(server.run());
    harness
}

/// `<u16 length><ASCII digits>` as the tracker sends it.
#[allow(dead_code)]
pub fn handshake_frame(imei: &str) -> Vec<u8> {
    let mut frame = (imei.len() as u16).to_be_bytes().to_vec();
    frame.extend_from_slice(imei.as_bytes());
    frame
}

/// One minimal Codec 8 record: fixed fix data, no I/O elements.
#[allow(dead_code)]
pub fn codec8_record(ts_millis: u64) -> Vec<u8> {
    let mut rec = Vec::new();
    rec.extend_from_slice(&ts_millis.to_be_bytes());
    rec.push(0); // priority
    rec.extend_from_slice(&546_154_550i32.to_be_bytes()); // latitude
    rec.extend_from_slice(&254_113_490i32.to_be_bytes()); // longitude
    rec.extend_from_slice(&120u16.to_be_bytes()); // altitude
    rec.extend_from_slice(&90u16.to_be_bytes()); // angle
    rec.push(7); // satellites
    rec.extend_from_slice(&50u16.to_be_bytes()); // speed
    rec.push(1); // event id
    rec.push(0); // total io
    rec.extend_from_slice(&[0, 0, 0, 0]); // empty 1/2/4/8-byte groups
    rec
}

/// Wrap records into a Codec 8 batch frame, optionally with a corrupted CRC.
#[allow(dead_code)]
pub fn codec8_batch(timestamps: &[u64], corrupt_crc: bool) -> Vec<u8> {
    let mut data = vec![0x08, timestamps.len() as u8];
    for &ts in timestamps {
        data.extend_from_slice(&codec8_record(ts));
    }
    data.push(timestamps.len() as u8);
    let mut crc = crc16(&data) as u32;
    if corrupt_crc {
        crc ^= 0xFFFF;
    }
    let mut frame = vec![0, 0, 0, 0];
    frame.extend_from_slice(&(data.len() as u32).to_be_bytes());
    frame.extend_from_slice(&data);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame
}

/// A device-side Codec 12 response frame (type 0x06).
#[allow(dead_code)]
pub fn codec12_response(text: &str) -> Vec<u8> {
    let payload = text.as_bytes();
    let mut data = vec![0x0C, 1, 0x06];
    data.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    data.extend_from_slice(payload);
    data.push(1);
    let crc = crc16(&data) as u32;
    let mut frame = vec![0, 0, 0, 0];
    frame.extend_from_slice(&(data.len() as u32).to_be_bytes());
    frame.extend_from_slice(&data);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame
}

/// Connect and complete the handshake, asserting the accept byte.
#[allow(dead_code)]
pub async fn connect_device(addr: SocketAddr, imei: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream
        .write_all(&handshake_frame(imei))
        .await
        .expect("write handshake");
    let mut ack = [0u8; 1];
    stream.read_exact(&mut ack).await.expect("read handshake ack");
    assert_eq!(ack, [0x01], "handshake should be accepted");
    stream
}

/// Read one complete envelope frame (preamble..CRC) from the device socket.
#[allow(dead_code)]
pub async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut head = [0u8; 8];
    stream.read_exact(&mut head).await.expect("read frame head");
    let declared = u32::from_be_bytes([head[4], head[5], head[6], head[7]]) as usize;
    let mut rest = vec![0u8; declared + 4];
    stream.read_exact(&mut rest).await.expect("read frame body");
    let mut frame = head.to_vec();
    frame.extend_from_slice(&rest);
    frame
}

/// Receive the next event or fail loudly after two seconds.
#[allow(dead_code)]
pub async fn next_event(events: &mut mpsc::UnboundedReceiver<GatewayEvent>) -> GatewayEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for a gateway event")
        .expect("event channel closed")
}

#[test]
fn handshake_frame_matches_wire_example() {
    let frame = handshake_frame("353691844288760");
    assert_eq!(frame.len(), 17);
    assert_eq!(&frame[..2], &[0x00, 0x0F]);
}
