//! End-to-end tests against running servers over plain blocking sockets.

use bytes::Bytes;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use tlvrpc_protocol::{Decoder, Frame, TlvConfig, ERROR_TYPE};
use tlvrpc_server::{HandlerTable, MultiReactorServer, Server, ServerConfig, ServerHandle};

const TIMEOUT: Duration = Duration::from_secs(5);

fn handlers() -> HandlerTable {
    HandlerTable::new()
        .with_handler(0, |_: &[u8]| Bytes::from_static(b"Hi there 0"))
        .with_handler(1, |_: &[u8]| Bytes::from_static(b"Hi there 1"))
}

fn single(handlers: HandlerTable) -> ServerHandle {
    single_with(ServerConfig::new("127.0.0.1:0".parse().unwrap(), handlers))
}

fn single_with(config: ServerConfig) -> ServerHandle {
    Server::new(config).unwrap().spawn().unwrap()
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    stream
}

/// Sends `request` on a fresh socket and reads until the server closes it.
fn exchange(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = connect(addr);
    stream.write_all(request).unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    response
}

fn decode_all(bytes: &[u8], config: TlvConfig) -> Vec<Frame> {
    let mut decoder = Decoder::with_config(config);
    decoder.extend(bytes);
    let mut frames = Vec::new();
    while let Some(frame) = decoder.decode_frame().unwrap() {
        frames.push(frame);
    }
    assert_eq!(decoder.buffered(), 0, "trailing bytes after last frame");
    frames
}

fn read_frame(stream: &mut TcpStream, decoder: &mut Decoder) -> Frame {
    let mut buf = [0u8; 256];
    loop {
        if let Some(frame) = decoder.decode_frame().unwrap() {
            return frame;
        }
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0, "connection closed before a full frame");
        decoder.extend(&buf[..n]);
    }
}

#[test]
fn test_unknown_type_returns_error_frame_and_closes() {
    let server = single(handlers());
    let request = Frame::new(69, Bytes::from_static(b"Goodbye World"));

    let response = exchange(server.local_addr(), &request.encode().unwrap());

    assert_eq!(response[0] & 0x7f, ERROR_TYPE);
    let frames = decode_all(&response, TlvConfig::default());
    assert_eq!(frames, vec![Frame::new(ERROR_TYPE, Bytes::new())]);
    assert_eq!(server.stats().unknown_types_total.load(Ordering::Relaxed), 1);
    server.stop().unwrap();
}

#[test]
fn test_unknown_type_with_keep_alive_keeps_connection() {
    let server = single(handlers());
    let mut stream = connect(server.local_addr());
    let mut decoder = Decoder::new();

    stream
        .write_all(&Frame::keep_alive(69, Bytes::new()).encode().unwrap())
        .unwrap();
    let error = read_frame(&mut stream, &mut decoder);
    assert_eq!(error, Frame::keep_alive(ERROR_TYPE, Bytes::new()));

    stream
        .write_all(&Frame::new(1, Bytes::from_static(b"Another message")).encode().unwrap())
        .unwrap();
    let reply = read_frame(&mut stream, &mut decoder);
    assert_eq!(reply, Frame::new(1, Bytes::from_static(b"Hi there 1")));

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
    server.stop().unwrap();
}

#[test]
fn test_multiple_handlers_dispatch_by_type() {
    let server = single(handlers());
    let addr = server.local_addr();

    let zero = exchange(addr, &Frame::new(0, Bytes::from_static(b"Hello World")).encode().unwrap());
    let one = exchange(
        addr,
        &Frame::new(1, Bytes::from_static(b"Another message")).encode().unwrap(),
    );

    assert_eq!(
        decode_all(&zero, TlvConfig::default()),
        vec![Frame::new(0, Bytes::from_static(b"Hi there 0"))]
    );
    assert_eq!(
        decode_all(&one, TlvConfig::default()),
        vec![Frame::new(1, Bytes::from_static(b"Hi there 1"))]
    );

    let stats = server.stats().snapshot();
    assert_eq!(stats.requests_total, 2);
    assert_eq!(stats.responses_total, 2);
    assert_eq!(stats.connections_total, 2);
    server.stop().unwrap();
}

#[test]
fn test_sequential_requests() {
    let server = single(handlers());
    for _ in 0..5 {
        let response = exchange(server.local_addr(), &Frame::new(1, Bytes::new()).encode().unwrap());
        assert_eq!(
            decode_all(&response, TlvConfig::default()),
            vec![Frame::new(1, Bytes::from_static(b"Hi there 1"))]
        );
    }
    server.stop().unwrap();
}

#[test]
fn test_partial_writes_are_reassembled() {
    let server = single(HandlerTable::new().with_handler(1, |body: &[u8]| {
        assert_eq!(body, b"split across writes");
        Bytes::from_static(&[42, 41, 40])
    }));
    let request = Frame::new(1, Bytes::from_static(b"split across writes"))
        .encode()
        .unwrap();
    let mut stream = connect(server.local_addr());
    stream.set_nodelay(true).unwrap();

    stream.write_all(&request[..2]).unwrap();
    thread::sleep(Duration::from_millis(50));
    stream.write_all(&request[2..5]).unwrap();
    thread::sleep(Duration::from_millis(50));
    // header complete, body still missing
    assert_eq!(server.stats().requests_total.load(Ordering::Relaxed), 0);
    stream.write_all(&request[5..]).unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    assert_eq!(response, vec![0x01, 0, 0, 0, 3, 42, 41, 40]);
    server.stop().unwrap();
}

#[test]
fn test_concurrent_connections_are_isolated() {
    let server = single(HandlerTable::new().with_handler(1, |body: &[u8]| {
        let mut reply = vec![42, 41, 40];
        reply.extend_from_slice(body);
        Bytes::from(reply)
    }));
    let addr = server.local_addr();

    let clients: Vec<_> = (0..4u8)
        .map(|id| {
            thread::spawn(move || {
                let request = Frame::new(1, vec![id]).encode().unwrap();
                let mut stream = connect(addr);
                stream.set_nodelay(true).unwrap();
                stream.write_all(&request[..2]).unwrap();
                thread::sleep(Duration::from_millis(10));
                stream.write_all(&request[2..5]).unwrap();
                thread::sleep(Duration::from_millis(10));
                stream.write_all(&request[5..]).unwrap();

                let mut response = Vec::new();
                stream.read_to_end(&mut response).unwrap();
                (id, response)
            })
        })
        .collect();

    for client in clients {
        let (id, response) = client.join().unwrap();
        let frames = decode_all(&response, TlvConfig::default());
        assert_eq!(frames, vec![Frame::new(1, vec![42, 41, 40, id])]);
    }

    let stats = server.stats().snapshot();
    assert_eq!(stats.connections_total, 4);
    assert_eq!(stats.connections_closed, 4);
    assert_eq!(stats.connections_active, 0);
    server.stop().unwrap();
}

#[test]
fn test_keep_alive_serves_many_requests_on_one_socket() {
    let server = single(HandlerTable::new().with_handler(1, |_: &[u8]| Bytes::from_static(&[42])));
    let mut stream = connect(server.local_addr());
    let mut decoder = Decoder::new();

    for _ in 0..5 {
        stream
            .write_all(&Frame::keep_alive(1, Bytes::new()).encode().unwrap())
            .unwrap();
        let reply = read_frame(&mut stream, &mut decoder);
        assert_eq!(reply, Frame::keep_alive(1, Bytes::from_static(&[42])));
    }

    let stats = server.stats().snapshot();
    assert_eq!(stats.connections_total, 1);
    assert_eq!(stats.requests_total, 5);
    server.stop().unwrap();
}

#[test]
fn test_pipelined_keep_alive_requests() {
    let server = single(handlers());
    let mut stream = connect(server.local_addr());

    let mut batch = Vec::new();
    batch.extend_from_slice(&Frame::keep_alive(0, Bytes::new()).encode().unwrap());
    batch.extend_from_slice(&Frame::new(1, Bytes::new()).encode().unwrap());
    stream.write_all(&batch).unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    assert_eq!(
        decode_all(&response, TlvConfig::default()),
        vec![
            Frame::keep_alive(0, Bytes::from_static(b"Hi there 0")),
            Frame::new(1, Bytes::from_static(b"Hi there 1")),
        ]
    );
    server.stop().unwrap();
}

#[test]
fn test_handler_panic_closes_only_that_connection() {
    let server = single(
        handlers().with_handler(5, |_: &[u8]| -> Bytes { panic!("handler failure") }),
    );
    let addr = server.local_addr();

    let response = exchange(addr, &Frame::keep_alive(5, Bytes::new()).encode().unwrap());
    assert!(response.is_empty());
    assert_eq!(server.stats().handler_panics_total.load(Ordering::Relaxed), 1);

    let response = exchange(addr, &Frame::new(0, Bytes::new()).encode().unwrap());
    assert_eq!(
        decode_all(&response, TlvConfig::default()),
        vec![Frame::new(0, Bytes::from_static(b"Hi there 0"))]
    );
    server.stop().unwrap();
}

#[test]
fn test_oversized_body_drops_connection() {
    let tlv = TlvConfig::default().with_max_body_size(16);
    let server = single_with(
        ServerConfig::new("127.0.0.1:0".parse().unwrap(), handlers()).with_tlv(tlv),
    );

    // header only; the announced length is over the limit
    let response = exchange(server.local_addr(), &[0x01, 0, 0, 0, 17]);
    assert!(response.is_empty());

    let stats = server.stats().snapshot();
    assert_eq!(stats.requests_total, 0);
    assert_eq!(stats.errors_total, 1);
    server.stop().unwrap();
}

#[test]
fn test_eof_mid_body_is_a_transport_error() {
    let server = single(handlers());
    {
        let mut stream = connect(server.local_addr());
        stream.write_all(&[0x01, 0, 0, 0, 10, b'a', b'b']).unwrap();
    }

    for _ in 0..100 {
        if server.stats().connections_closed.load(Ordering::Relaxed) == 1 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    let stats = server.stats().snapshot();
    assert_eq!(stats.connections_closed, 1);
    assert_eq!(stats.errors_total, 1);
    assert_eq!(stats.requests_total, 0);
    server.stop().unwrap();
}

#[test]
fn test_wide_header() {
    let tlv = TlvConfig::new(8, 1024).unwrap();
    let server = single_with(
        ServerConfig::new("127.0.0.1:0".parse().unwrap(), handlers()).with_tlv(tlv),
    );

    let request = Frame::new(1, Bytes::from_static(b"wide")).encode_with(&tlv).unwrap();
    assert_eq!(request.len(), 12);
    let response = exchange(server.local_addr(), &request);

    assert_eq!(response.len(), 8 + b"Hi there 1".len());
    assert_eq!(
        decode_all(&response, tlv),
        vec![Frame::new(1, Bytes::from_static(b"Hi there 1"))]
    );
    server.stop().unwrap();
}

#[test]
fn test_multi_reactor_round_robin() {
    let config = ServerConfig::new("127.0.0.1:0".parse().unwrap(), handlers()).with_workers(3);
    let mut ready = None;
    let server = MultiReactorServer::new(config)
        .unwrap()
        .start(|addr| ready = Some(addr))
        .unwrap();
    assert_eq!(ready, Some(server.local_addr()));

    for i in 0..9u8 {
        let response = exchange(server.local_addr(), &Frame::new(i % 2, Bytes::new()).encode().unwrap());
        assert_eq!(decode_all(&response, TlvConfig::default()).len(), 1);
    }

    assert_eq!(server.stats().worker_assignments(), vec![3, 3, 3]);
    let stats = server.stats().snapshot();
    assert_eq!(stats.requests_total, 9);
    assert_eq!(stats.connections_active, 0);
    server.stop().unwrap();
}

#[test]
fn test_multi_reactor_concurrent_keep_alive() {
    let config = ServerConfig::new("127.0.0.1:0".parse().unwrap(), handlers()).with_workers(2);
    let server = MultiReactorServer::new(config).unwrap().start(|_| {}).unwrap();
    let addr = server.local_addr();

    let clients: Vec<_> = (0..6)
        .map(|_| {
            thread::spawn(move || {
                let mut stream = connect(addr);
                let mut decoder = Decoder::new();
                for _ in 0..10 {
                    stream
                        .write_all(&Frame::keep_alive(0, Bytes::new()).encode().unwrap())
                        .unwrap();
                    let reply = read_frame(&mut stream, &mut decoder);
                    assert_eq!(reply.body.as_ref(), b"Hi there 0");
                }
            })
        })
        .collect();
    for client in clients {
        client.join().unwrap();
    }

    let assignments = server.stats().worker_assignments();
    assert_eq!(assignments.iter().sum::<u64>(), 6);
    assert!(assignments.iter().all(|&n| n == 3));
    assert_eq!(server.stats().requests_total.load(Ordering::Relaxed), 60);
    server.stop().unwrap();
}
