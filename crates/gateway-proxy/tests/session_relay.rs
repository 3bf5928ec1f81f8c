use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

use rusty_interceptor_core::{
    CandidateTable, Direction, HandlerFuture, MessageCatalog, MessageInfo, Packet, PacketHandler,
    PacketMatcher, StreamCipher,
};
use rusty_interceptor_proxy::{
    CloseReason, Interceptor, InterceptorConfig, SessionError, SessionState, StaticKeySource,
};

const WAIT: Duration = Duration::from_secs(5);
const PIPE: usize = 64 * 1024;

fn plain_config() -> InterceptorConfig {
    InterceptorConfig {
        recover_key: false,
        ..InterceptorConfig::default()
    }
}

/// Returns the client-side and server-side ends the test drives.
fn connect(interceptor: &Interceptor) -> (DuplexStream, DuplexStream) {
    let (client, proxy_client_side) = tokio::io::duplex(PIPE);
    let (proxy_server_side, server) = tokio::io::duplex(PIPE);
    interceptor
        .intercept(proxy_client_side, proxy_server_side)
        .unwrap();
    (client, server)
}

async fn wait_relaying(interceptor: &Interceptor) {
    timeout(WAIT, async {
        while interceptor.state() != SessionState::Relaying {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("session never reached relaying");
}

fn frame(header: u16, payload: &[u8]) -> Vec<u8> {
    Packet::with_payload(header, payload.to_vec()).to_frame()
}

async fn recv_with<R>(reader: &mut R, cipher: &mut Option<StreamCipher>) -> Packet
where
    R: AsyncRead + Unpin,
{
    timeout(WAIT, async {
        let mut prefix = [0u8; 4];
        reader.read_exact(&mut prefix).await.unwrap();
        if let Some(cipher) = cipher.as_mut() {
            cipher.apply(&mut prefix);
        }
        let total = i32::from_be_bytes(prefix);
        let mut body = vec![0u8; total as usize];
        reader.read_exact(&mut body).await.unwrap();
        if let Some(cipher) = cipher.as_mut() {
            cipher.apply(&mut body);
        }
        Packet::from_frame_body(total, &body)
    })
    .await
    .expect("timed out waiting for a frame")
}

async fn recv<R>(reader: &mut R) -> Packet
where
    R: AsyncRead + Unpin,
{
    recv_with(reader, &mut None).await
}

async fn expect_eof<R>(reader: &mut R)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 64];
    let read = timeout(WAIT, reader.read(&mut buf))
        .await
        .expect("peer was never closed")
        .unwrap_or(0);
    assert_eq!(read, 0);
}

#[tokio::test]
async fn relays_frames_in_both_directions() {
    let interceptor = Interceptor::new(plain_config());
    let (mut client, mut server) = connect(&interceptor);

    client.write_all(&frame(4000, b"hello")).await.unwrap();
    let upstream = recv(&mut server).await;
    assert_eq!(upstream.header(), 4000);
    assert_eq!(upstream.payload(), b"hello");

    server.write_all(&frame(1, &[0, 0, 0, 7])).await.unwrap();
    server.write_all(&frame(2, b"")).await.unwrap();
    assert_eq!(recv(&mut client).await.payload(), &[0, 0, 0, 7]);
    assert_eq!(recv(&mut client).await.header(), 2);
    assert!(interceptor.is_connected());
}

#[tokio::test]
async fn blocked_packet_never_reaches_the_peer() {
    let interceptor = Interceptor::new(plain_config());
    interceptor.attach(
        Direction::Outgoing,
        |p| p.header() == 2,
        |p: &mut Packet| {
            p.block();
            Ok(())
        },
    );
    let (mut client, mut server) = connect(&interceptor);

    client.write_all(&frame(2, b"drop me")).await.unwrap();
    client.write_all(&frame(3, b"keep")).await.unwrap();

    let first = recv(&mut server).await;
    assert_eq!(first.header(), 3);
    assert_eq!(first.payload(), b"keep");
}

#[tokio::test]
async fn only_the_first_matching_handler_rewrites() {
    let interceptor = Interceptor::new(plain_config());
    interceptor.attach(
        Direction::Incoming,
        |p| p.header() == 10,
        |p: &mut Packet| {
            p.replace_string_at(0, "rewritten")?;
            Ok(())
        },
    );
    interceptor.attach(
        Direction::Incoming,
        |_| true,
        |p: &mut Packet| {
            p.set_header(99);
            Ok(())
        },
    );
    let (mut client, mut server) = connect(&interceptor);

    let mut original = Packet::new(10);
    original.write_string("hi").unwrap();
    original.write(5i32);
    server.write_all(&original.to_frame()).await.unwrap();

    let delivered = recv(&mut client).await;
    assert_eq!(delivered.header(), 10);
    assert!(delivered.is_valid());
    assert_eq!(delivered.read_string_at(0).as_deref(), Some("rewritten"));
    assert_eq!(delivered.read_at::<i32>(11), Some(5));
}

#[tokio::test]
async fn failing_handler_still_forwards() {
    let interceptor = Interceptor::new(plain_config());
    interceptor.attach(Direction::Outgoing, |_| true, |_: &mut Packet| {
        anyhow::bail!("handler failed")
    });
    let (mut client, mut server) = connect(&interceptor);

    client.write_all(&frame(8, b"x")).await.unwrap();
    assert_eq!(recv(&mut server).await.header(), 8);
}

#[tokio::test]
async fn wait_for_resolves_and_packet_is_still_relayed() {
    let interceptor = Interceptor::new(plain_config());
    let (mut client, mut server) = connect(&interceptor);

    let wait = interceptor.wait_for(Direction::Incoming, 77u16);
    server.write_all(&frame(76, b"no")).await.unwrap();
    server.write_all(&frame(77, b"yes")).await.unwrap();

    let matched = timeout(WAIT, wait).await.unwrap().unwrap();
    assert_eq!(matched.payload(), b"yes");
    assert_eq!(recv(&mut client).await.header(), 76);
    assert_eq!(recv(&mut client).await.header(), 77);
    assert!(interceptor.registry(Direction::Incoming).is_empty());
}

#[tokio::test]
async fn catalog_tags_packets_for_hash_waits() {
    let interceptor = Interceptor::new(plain_config());
    let mut catalog = MessageCatalog::new();
    catalog.insert(Direction::Outgoing, MessageInfo::new(1234, "3f1c9a", None));
    interceptor.install_catalog(catalog);

    let (mut client, mut server) = connect(&interceptor);
    let wait = interceptor.wait_for(Direction::Outgoing, PacketMatcher::hash("3f1c9a"));

    client.write_all(&frame(1234, b"")).await.unwrap();
    let matched = timeout(WAIT, wait).await.unwrap().unwrap();
    assert_eq!(matched.identity_hash(), Some("3f1c9a"));
    assert_eq!(recv(&mut server).await.header(), 1234);
}

#[tokio::test]
async fn observers_see_each_packet() {
    let interceptor = Interceptor::new(plain_config());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    interceptor.on_incoming(move |p| {
        log.lock().push(p.header());
        Ok(())
    });
    interceptor.on_incoming(|_| panic!("broken subscriber"));
    let (mut client, mut server) = connect(&interceptor);

    server.write_all(&frame(5, b"")).await.unwrap();
    server.write_all(&frame(6, b"")).await.unwrap();
    recv(&mut client).await;
    recv(&mut client).await;
    assert_eq!(*seen.lock(), vec![5, 6]);
}

#[tokio::test]
async fn injected_packets_reach_both_peers() {
    let interceptor = Interceptor::new(plain_config());
    let (mut client, mut server) = connect(&interceptor);
    wait_relaying(&interceptor).await;

    let mut chat = Packet::new(52);
    chat.write_string("injected").unwrap();
    interceptor.send_to_server(chat).await.unwrap();
    interceptor
        .send_to_client(Packet::with_payload(33, vec![1]))
        .await
        .unwrap();

    assert_eq!(recv(&mut server).await.read_string_at(0).as_deref(), Some("injected"));
    assert_eq!(recv(&mut client).await.header(), 33);
}

/// Answers every matching client packet by injecting a packet of the same type.
struct Echo {
    interceptor: Interceptor,
    calls: Arc<AtomicUsize>,
}

impl PacketHandler for Echo {
    fn handle<'a>(&'a self, _packet: &'a mut Packet) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.interceptor
                .send_to_server(Packet::with_payload(52, b"echo".to_vec()))
                .await?;
            Ok(())
        })
    }
}

#[tokio::test]
async fn injected_packets_skip_handlers() {
    let interceptor = Interceptor::new(plain_config());
    let calls = Arc::new(AtomicUsize::new(0));
    interceptor.attach_handler(
        Direction::Outgoing,
        |p| p.header() == 52,
        Echo {
            interceptor: interceptor.clone(),
            calls: calls.clone(),
        },
    );
    let observed = Arc::new(Mutex::new(Vec::new()));
    let log = observed.clone();
    interceptor.on_outgoing(move |p| {
        log.lock().push(p.payload().to_vec());
        Ok(())
    });
    let (mut client, mut server) = connect(&interceptor);

    client.write_all(&frame(52, b"typed")).await.unwrap();
    assert_eq!(recv(&mut server).await.payload(), b"echo");
    assert_eq!(recv(&mut server).await.payload(), b"typed");

    client.write_all(&frame(53, b"")).await.unwrap();
    assert_eq!(recv(&mut server).await.header(), 53);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        *observed.lock(),
        vec![b"echo".to_vec(), b"typed".to_vec(), Vec::new()]
    );
}

#[tokio::test]
async fn injected_packets_do_not_resolve_waiters() {
    let interceptor = Interceptor::new(plain_config());
    let (mut client, mut server) = connect(&interceptor);
    wait_relaying(&interceptor).await;

    let mut wait = interceptor.wait_for(Direction::Incoming, 40u16);
    interceptor
        .send_to_client(Packet::with_payload(40, b"ours".to_vec()))
        .await
        .unwrap();
    assert_eq!(recv(&mut client).await.payload(), b"ours");
    assert!(timeout(Duration::from_millis(50), &mut wait).await.is_err());

    server.write_all(&frame(40, b"theirs")).await.unwrap();
    let matched = timeout(WAIT, wait).await.unwrap().unwrap();
    assert_eq!(matched.payload(), b"theirs");
}

#[tokio::test]
async fn observers_skip_blocked_packets() {
    let interceptor = Interceptor::new(plain_config());
    interceptor.attach(
        Direction::Outgoing,
        |p| p.header() == 2,
        |p: &mut Packet| {
            p.block();
            Ok(())
        },
    );
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    interceptor.on_outgoing(move |p| {
        log.lock().push(p.header());
        Ok(())
    });
    let (mut client, mut server) = connect(&interceptor);

    client.write_all(&frame(2, b"drop me")).await.unwrap();
    client.write_all(&frame(3, b"keep")).await.unwrap();
    assert_eq!(recv(&mut server).await.header(), 3);
    assert_eq!(*seen.lock(), vec![3]);
}

#[tokio::test]
async fn paused_lane_holds_input_until_resumed() {
    let interceptor = Interceptor::new(plain_config());
    interceptor.pause(Direction::Outgoing);
    let (mut client, mut server) = connect(&interceptor);
    wait_relaying(&interceptor).await;

    client.write_all(&frame(2, b"held")).await.unwrap();
    let mut peek = [0u8; 1];
    assert!(
        timeout(Duration::from_millis(100), server.read(&mut peek))
            .await
            .is_err()
    );

    interceptor.resume(Direction::Outgoing);
    assert_eq!(recv(&mut server).await.payload(), b"held");
}

#[tokio::test]
async fn desync_tears_down_the_session() {
    let interceptor = Interceptor::new(plain_config());
    let reasons = Arc::new(Mutex::new(Vec::new()));
    let log = reasons.clone();
    interceptor.on_disconnected(move |reason| {
        log.lock().push(reason);
        Ok(())
    });
    let (mut client, mut server) = connect(&interceptor);
    let pending = interceptor.wait_for(Direction::Incoming, 1u16);

    client
        .write_all(&[0xff, 0xff, 0xff, 0xff, 0x00, 0x01])
        .await
        .unwrap();

    assert_eq!(timeout(WAIT, interceptor.closed()).await.unwrap(), CloseReason::Desync);
    assert_eq!(*reasons.lock(), vec![CloseReason::Desync]);
    assert!(pending.await.is_err());
    expect_eof(&mut server).await;
    expect_eof(&mut client).await;
}

#[tokio::test]
async fn client_eof_closes_the_server_side() {
    let interceptor = Interceptor::new(plain_config());
    let (client, mut server) = connect(&interceptor);
    wait_relaying(&interceptor).await;

    drop(client);
    assert_eq!(
        timeout(WAIT, interceptor.closed()).await.unwrap(),
        CloseReason::ClientClosed
    );
    expect_eof(&mut server).await;
}

#[tokio::test]
async fn stop_fires_disconnected_once() {
    let interceptor = Interceptor::new(plain_config());
    let fired = Arc::new(AtomicUsize::new(0));
    let count = fired.clone();
    interceptor.on_disconnected(move |_| {
        count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let (_client, _server) = connect(&interceptor);
    wait_relaying(&interceptor).await;

    interceptor.stop();
    interceptor.stop();
    assert_eq!(timeout(WAIT, interceptor.closed()).await.unwrap(), CloseReason::Stopped);
    assert_eq!(interceptor.state(), SessionState::Closed);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(matches!(
        interceptor.send_to_server(Packet::new(1)).await,
        Err(SessionError::NotConnected)
    ));
}

#[tokio::test]
async fn sessions_cannot_be_restarted() {
    let interceptor = Interceptor::new(plain_config());
    let _ends = connect(&interceptor);
    let (a, b) = tokio::io::duplex(16);
    assert!(matches!(
        interceptor.intercept(a, b),
        Err(SessionError::AlreadyStarted)
    ));
}

#[tokio::test]
async fn recovers_key_and_reenciphers_upstream() {
    const SEED: &[u8] = b"per-session rc4 key";

    let handshake = [frame(4000, b"PRODUCTION"), frame(206, b"")];
    let mut window_plain = Vec::new();
    let mut init = Packet::new(3110);
    init.write_string("dh-public-key").unwrap();
    init.write_frame_to(&mut window_plain);
    Packet::with_payload(2490, vec![0, 0, 0, 1]).write_frame_to(&mut window_plain);

    let mut client_cipher = StreamCipher::new(SEED).unwrap();
    let mut window = window_plain.clone();
    client_cipher.apply(&mut window);
    let table = CandidateTable::from(&client_cipher);

    let config = InterceptorConfig {
        plaintext_frames: handshake.len(),
        settle_delay_ms: 50,
        ..InterceptorConfig::default()
    };
    let interceptor = Interceptor::new(config)
        .with_key_source(Arc::new(StaticKeySource::new(vec![table])));
    let outgoing = Arc::new(Mutex::new(Vec::new()));
    let log = outgoing.clone();
    interceptor.on_outgoing(move |p| {
        log.lock().push(p.header());
        Ok(())
    });
    interceptor.attach(
        Direction::Outgoing,
        |p| p.header() == 500,
        |p: &mut Packet| {
            p.replace_string_at(0, "a much longer replacement")?;
            Ok(())
        },
    );
    let (mut client, mut server) = connect(&interceptor);

    for bytes in &handshake {
        client.write_all(bytes).await.unwrap();
    }
    client.write_all(&window).await.unwrap();

    assert_eq!(recv(&mut server).await.header(), 4000);
    assert_eq!(recv(&mut server).await.header(), 206);

    let mut server_cipher = Some(StreamCipher::new(SEED).unwrap());
    let first = recv_with(&mut server, &mut server_cipher).await;
    assert_eq!(first.header(), 3110);
    assert_eq!(first.read_string_at(0).as_deref(), Some("dh-public-key"));
    assert_eq!(recv_with(&mut server, &mut server_cipher).await.header(), 2490);

    let mut follow_up = Packet::new(500);
    follow_up.write_string("short").unwrap();
    follow_up.write(7u8);
    let mut wire = follow_up.to_frame();
    client_cipher.apply(&mut wire);
    client.write_all(&wire).await.unwrap();

    let rewritten = recv_with(&mut server, &mut server_cipher).await;
    assert_eq!(rewritten.header(), 500);
    assert!(rewritten.is_valid());
    assert_eq!(
        rewritten.read_string_at(0).as_deref(),
        Some("a much longer replacement")
    );
    assert_eq!(rewritten.read_at::<u8>(27), Some(7));

    interceptor.send_to_server(Packet::with_payload(9, vec![1, 2])).await.unwrap();
    let injected = recv_with(&mut server, &mut server_cipher).await;
    assert_eq!(injected.payload(), &[1, 2]);

    assert_eq!(*outgoing.lock(), vec![4000, 206, 3110, 2490, 500, 9]);
}

#[tokio::test]
async fn failed_recovery_ends_in_desync() {
    let mut client_cipher = StreamCipher::new(b"real key").unwrap();
    let mut window = frame(3110, b"0123456789abcdef");
    client_cipher.apply(&mut window);
    let wrong = CandidateTable::from(&StreamCipher::new(b"someone else").unwrap());

    let config = InterceptorConfig {
        plaintext_frames: 0,
        settle_delay_ms: 10,
        ..InterceptorConfig::default()
    };
    let interceptor =
        Interceptor::new(config).with_key_source(Arc::new(StaticKeySource::new(vec![wrong])));
    let (mut client, _server) = connect(&interceptor);
    client.write_all(&window).await.unwrap();

    assert_eq!(timeout(WAIT, interceptor.closed()).await.unwrap(), CloseReason::Desync);
}

#[tokio::test]
async fn start_relays_over_loopback_tcp() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = InterceptorConfig {
        listen: "127.0.0.1:0".to_string(),
        upstream: upstream.local_addr().unwrap().to_string(),
        recover_key: false,
        ..InterceptorConfig::default()
    };
    let interceptor = Interceptor::new(config);
    let connected = Arc::new(AtomicUsize::new(0));
    let count = connected.clone();
    interceptor.on_connected(move || {
        count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let addr = interceptor.start().await.unwrap();
    assert_eq!(interceptor.state(), SessionState::Listening);
    assert!(matches!(
        interceptor.start().await,
        Err(SessionError::AlreadyStarted)
    ));

    let mut client = TcpStream::connect(addr).await.unwrap();
    let (mut server, _) = timeout(WAIT, upstream.accept()).await.unwrap().unwrap();

    client.write_all(&frame(4000, b"tcp")).await.unwrap();
    assert_eq!(recv(&mut server).await.payload(), b"tcp");
    server.write_all(&frame(1, b"back")).await.unwrap();
    assert_eq!(recv(&mut client).await.payload(), b"back");
    assert_eq!(connected.load(Ordering::SeqCst), 1);

    interceptor.stop();
    assert_eq!(timeout(WAIT, interceptor.closed()).await.unwrap(), CloseReason::Stopped);
    expect_eof(&mut server).await;
}
