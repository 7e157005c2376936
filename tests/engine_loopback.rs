//! Drives a real `Engine` over loopback TCP: single messages, packed and
//! split frames, outbound `send()`, corrupted frames, and fan-out writes
//! across many clients. Uses only `std::net` for the client side.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use ringserver::{frame, Callbacks, Config, Engine};

fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        env_logger::try_init().expect("unable to initialise logger");
    })
}

#[derive(Default)]
struct State {
    connected: Mutex<Vec<RawFd>>,
    messages: Mutex<Vec<(RawFd, Vec<u8>)>>,
    wrote: Mutex<Vec<(RawFd, usize)>>,
    closed: Mutex<Vec<RawFd>>,
    errors: Mutex<Vec<(RawFd, String)>>,
}

fn callbacks(state: Arc<State>) -> Callbacks<State> {
    Callbacks::new(state)
        .with_on_connected(|state, fd| state.connected.lock().unwrap().push(fd))
        .with_on_message(|state, (fd, body)| state.messages.lock().unwrap().push((fd, body)))
        .with_on_wrote(|state, (fd, bytes)| state.wrote.lock().unwrap().push((fd, bytes)))
        .with_on_closed(|state, fd| state.closed.lock().unwrap().push(fd))
        .with_on_error(|state, (fd, message)| state.errors.lock().unwrap().push((fd, message)))
}

/// Hands a bound, listening, non-blocking socket's descriptor to an engine.
/// The `TcpListener` is forgotten rather than dropped: the engine consumes an
/// already-`listen()`-ed descriptor and owns its lifetime from that point
/// on, closing it itself in `Engine::destroy`.
fn listener_fd() -> (RawFd, std::net::SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
    listener.set_nonblocking(true).expect("set non-blocking");
    let addr = listener.local_addr().expect("local addr");
    let fd = listener.as_raw_fd();
    std::mem::forget(listener);
    (fd, addr)
}

fn start_engine(state: Arc<State>) -> (Engine<State>, std::net::SocketAddr) {
    init_logging();
    let (fd, addr) = listener_fd();
    let engine: Engine<State> = Engine::create(Config::new(2)).expect("engine creation");
    engine.bind_listener(fd);
    engine.set_callbacks(callbacks(state));
    engine.start().expect("engine start");
    (engine, addr)
}

/// Polls `cond` every 10ms for up to two seconds; panics if it never holds.
/// The engine's callbacks run asynchronously on scheduler threads, so tests
/// observe their effects this way rather than via a direct return value.
fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for: {what}");
}

/// Builds a frame whose footer byte is corrupted and is immediately followed
/// by a lone `0x00` byte, so the reassembler's resync scan latches onto that
/// byte right away: one corrupted-frame-and-resync cycle per call.
fn corrupt_frame(body: &[u8]) -> Vec<u8> {
    let mut framed = frame::encode(body).expect("encode");
    *framed.last_mut().unwrap() = 0xFF;
    framed.push(0x00);
    framed
}

#[test]
fn single_short_message_round_trips() {
    let state = Arc::new(State::default());
    let (engine, addr) = start_engine(Arc::clone(&state));

    let mut client = TcpStream::connect(addr).expect("connect");
    wait_until(|| !state.connected.lock().unwrap().is_empty(), "on_connected");

    client
        .write_all(&frame::encode(b"Hola, Mundo!").expect("encode"))
        .expect("write frame");
    wait_until(|| !state.messages.lock().unwrap().is_empty(), "on_message");

    let messages = state.messages.lock().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].1, b"Hola, Mundo!");
    drop(messages);

    drop(client);
    wait_until(|| !state.closed.lock().unwrap().is_empty(), "on_closed");

    engine.stop();
    engine.destroy();
}

#[test]
fn three_packed_messages_are_delivered_in_order() {
    let state = Arc::new(State::default());
    let (engine, addr) = start_engine(Arc::clone(&state));

    let mut client = TcpStream::connect(addr).expect("connect");
    wait_until(|| !state.connected.lock().unwrap().is_empty(), "on_connected");

    let mut wire = Vec::new();
    wire.extend(frame::encode(&[1, 2, 3]).expect("encode"));
    wire.extend(frame::encode(&[1, 2, 3, 4]).expect("encode"));
    wire.extend(frame::encode(&[1, 2, 3, 4, 5]).expect("encode"));
    client.write_all(&wire).expect("write packed frames");

    wait_until(|| state.messages.lock().unwrap().len() == 3, "three on_message calls");

    let messages = state.messages.lock().unwrap();
    assert_eq!(messages[0].1.len(), 3);
    assert_eq!(messages[1].1.len(), 4);
    assert_eq!(messages[2].1.len(), 5);

    drop(messages);
    engine.stop();
    engine.destroy();
}

#[test]
fn body_spanning_multiple_reads_is_delivered_whole() {
    let state = Arc::new(State::default());
    let (engine, addr) = start_engine(Arc::clone(&state));

    let mut client = TcpStream::connect(addr).expect("connect");
    wait_until(|| !state.connected.lock().unwrap().is_empty(), "on_connected");

    let body: Vec<u8> = b"abcdefghijklmnopqrstuvwxyz"
        .iter()
        .cycle()
        .take(8192 + 8192 / 2)
        .copied()
        .collect();
    client
        .write_all(&frame::encode(&body).expect("encode"))
        .expect("write large frame");

    wait_until(|| !state.messages.lock().unwrap().is_empty(), "on_message");
    let messages = state.messages.lock().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].1, body);

    drop(messages);
    engine.stop();
    engine.destroy();
}

#[test]
fn send_writes_a_framed_message_to_the_peer() {
    let state = Arc::new(State::default());
    let (engine, addr) = start_engine(Arc::clone(&state));

    let mut client = TcpStream::connect(addr).expect("connect");
    wait_until(|| !state.connected.lock().unwrap().is_empty(), "on_connected");
    let fd = state.connected.lock().unwrap()[0];

    engine.send(fd, b"Hola".to_vec()).expect("send");
    wait_until(|| !state.wrote.lock().unwrap().is_empty(), "on_wrote");

    let expected = frame::encode(b"Hola").expect("encode");
    let mut received = vec![0u8; expected.len()];
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    client.read_exact(&mut received).expect("read framed send");
    assert_eq!(received, expected);

    engine.stop();
    engine.destroy();
}

#[test]
fn corrupted_frame_is_reported_and_does_not_close_the_connection() {
    let state = Arc::new(State::default());
    let (engine, addr) = start_engine(Arc::clone(&state));

    let mut client = TcpStream::connect(addr).expect("connect");
    wait_until(|| !state.connected.lock().unwrap().is_empty(), "on_connected");

    let good = frame::encode(&[1u8; 10]).expect("encode");
    let mut corrupted = frame::encode(&[2u8; 40]).expect("encode");
    *corrupted.last_mut().unwrap() = 0xFF;

    let mut wire = Vec::new();
    wire.extend(&good);
    wire.extend(&corrupted);
    wire.extend(frame::encode(&[3u8; 50]).expect("encode"));
    client.write_all(&wire).expect("write corrupted stream");

    wait_until(|| !state.errors.lock().unwrap().is_empty(), "on_error");
    wait_until(|| !state.messages.lock().unwrap().is_empty(), "at least one on_message");

    assert_eq!(state.messages.lock().unwrap()[0].1, vec![1u8; 10]);
    assert!(state.closed.lock().unwrap().is_empty(), "connection must survive a resync");

    engine.stop();
    engine.destroy();
}

#[test]
fn three_consecutive_corrupted_frames_force_close_the_connection() {
    let state = Arc::new(State::default());
    let (engine, addr) = start_engine(Arc::clone(&state));

    let client = TcpStream::connect(addr).expect("connect");
    wait_until(|| !state.connected.lock().unwrap().is_empty(), "on_connected");
    let fd = state.connected.lock().unwrap()[0];

    let mut wire = Vec::new();
    wire.extend(corrupt_frame(&[1u8; 8]));
    wire.extend(corrupt_frame(&[2u8; 8]));
    wire.extend(corrupt_frame(&[3u8; 8]));
    (&client).write_all(&wire).expect("write corrupted stream");

    wait_until(|| !state.closed.lock().unwrap().is_empty(), "on_closed after fatal resync");
    assert_eq!(state.closed.lock().unwrap()[0], fd);
    assert!(
        state.errors.lock().unwrap().len() >= 3,
        "expected an on_error per corrupted frame before the force-close"
    );

    engine.stop();
    engine.destroy();
}

#[test]
fn fan_out_write_reaches_every_client() {
    let state = Arc::new(State::default());
    let (engine, addr) = start_engine(Arc::clone(&state));

    const CLIENTS: usize = 20;
    const WRITES_PER_CLIENT: usize = 100;
    const BODY: &[u8] = b"Hola";

    let mut clients = Vec::with_capacity(CLIENTS);
    for i in 0..CLIENTS {
        let client = TcpStream::connect(addr).expect("connect");
        wait_until(
            || state.connected.lock().unwrap().len() == i + 1,
            "on_connected for this client",
        );
        clients.push(client);
    }

    let fds = state.connected.lock().unwrap().clone();
    assert_eq!(fds.len(), CLIENTS);

    for &fd in &fds {
        for _ in 0..WRITES_PER_CLIENT {
            engine.send(fd, BODY.to_vec()).expect("send");
        }
    }

    wait_until(
        || state.wrote.lock().unwrap().len() == CLIENTS * WRITES_PER_CLIENT,
        "on_wrote invoked for every queued write",
    );

    let expected_frame = frame::encode(BODY).expect("encode");
    let expected_wire = expected_frame.repeat(WRITES_PER_CLIENT);
    for client in &mut clients {
        let mut received = vec![0u8; expected_wire.len()];
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.read_exact(&mut received).expect("read all framed writes");
        assert_eq!(received, expected_wire);
    }

    engine.stop();
    engine.destroy();
}

#[test]
fn stop_is_idempotent_on_a_started_engine() {
    let state = Arc::new(State::default());
    let (engine, _addr) = start_engine(Arc::clone(&state));
    engine.stop();
    engine.stop();
    engine.destroy();
}
