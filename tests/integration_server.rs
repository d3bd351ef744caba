//! Integration tests for the connection engine over loopback TCP

use photonwire::buffer::{PoolConfig, TierConfig, KB};
use photonwire::error::{Error, Result};
use photonwire::framing::{HttpDetector, HttpHeaders, LineDetector};
use photonwire::network::{processor_fn, WriteProxy};
use photonwire::{EngineConfig, Message, Server, ServerHandle, SocketId};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Small pools, ephemeral port
fn test_config() -> EngineConfig {
    let pool = PoolConfig {
        small: TierConfig::new(KB, 32),
        medium: TierConfig::new(16 * KB, 4),
        large: TierConfig::new(64 * KB, 2),
    };
    let mut config = EngineConfig::default();
    config.server.bind_addr = "127.0.0.1:0".parse().unwrap();
    config.server.accept_poll_interval_ms = 10;
    config.read_pool = pool;
    config.write_pool = pool;
    config.event_loop.read_buffer_size = 16 * KB;
    config.event_loop.max_idle_backoff_ms = 5;
    config
}

fn connect(handle: &ServerHandle) -> TcpStream {
    let stream = TcpStream::connect(handle.local_addr()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

/// Answers with the request body, or the URI when there is none
fn http_echo(message: &Message, bytes: &[u8], w: &mut WriteProxy<'_>) -> Result<()> {
    let to = message
        .socket_id()
        .ok_or_else(|| Error::Internal("no socket id".into()))?;
    let headers = message
        .metadata::<HttpHeaders>()
        .ok_or_else(|| Error::Internal("no headers".into()))?;
    let body = if headers.body.is_empty() {
        &bytes[headers.uri.clone()]
    } else {
        &bytes[headers.body.clone()]
    };

    let mut response = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body);
    w.reply(to, &response)
}

fn start_http() -> ServerHandle {
    Server::new(
        test_config(),
        HttpDetector::default().factory(),
        processor_fn(http_echo),
    )
    .start()
    .unwrap()
}

fn start_line_echo() -> ServerHandle {
    Server::new(
        test_config(),
        LineDetector::default().factory(),
        processor_fn(|message: &Message, bytes: &[u8], w: &mut WriteProxy<'_>| {
            let to = message
                .socket_id()
                .ok_or_else(|| Error::Internal("no socket id".into()))?;
            w.reply(to, bytes)
        }),
    )
    .start()
    .unwrap()
}

/// Read one response with a Content-Length body
fn read_response(reader: &mut BufReader<TcpStream>) -> Vec<u8> {
    let mut length = 0;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        if line == "\r\n" {
            break;
        }
        if let Some(value) = line.strip_prefix("Content-Length: ") {
            length = value.trim().parse().unwrap();
        }
    }
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).unwrap();
    body
}

#[test]
fn test_http_request_response() {
    let server = start_http();
    let mut client = connect(&server);

    client
        .write_all(b"GET /hello HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let mut reader = BufReader::new(client);
    assert_eq!(read_response(&mut reader), b"/hello");

    server.shutdown().unwrap();
}

#[test]
fn test_pipelined_requests_in_one_write() {
    let server = start_http();
    let mut client = connect(&server);

    client
        .write_all(
            b"POST /a HTTP/1.1\r\nContent-Length: 3\r\n\r\none\
              POST /b HTTP/1.1\r\nContent-Length: 3\r\n\r\ntwo\
              GET /three HTTP/1.1\r\n\r\n",
        )
        .unwrap();

    let mut reader = BufReader::new(client);
    assert_eq!(read_response(&mut reader), b"one");
    assert_eq!(read_response(&mut reader), b"two");
    assert_eq!(read_response(&mut reader), b"/three");

    server.shutdown().unwrap();
}

#[test]
fn test_request_body_split_across_writes() {
    let server = start_http();
    let mut client = connect(&server);

    client
        .write_all(b"POST /upload HTTP/1.1\r\nContent-Length: 11\r\n\r\nhello")
        .unwrap();
    client.flush().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    client.write_all(b" world").unwrap();

    let mut reader = BufReader::new(client);
    assert_eq!(read_response(&mut reader), b"hello world");

    server.shutdown().unwrap();
}

#[test]
fn test_body_larger_than_small_slot() {
    let server = start_http();
    let mut client = connect(&server);

    // Forces promotion to the medium tier on both pools
    let body: Vec<u8> = (0..5000u32).map(|i| b'a' + (i % 26) as u8).collect();
    let mut request = format!(
        "POST /big HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    request.extend_from_slice(&body);
    client.write_all(&request).unwrap();

    let mut reader = BufReader::new(client);
    assert_eq!(read_response(&mut reader), body);

    server.shutdown().unwrap();
}

#[test]
fn test_malformed_request_closes_connection() {
    let server = start_http();
    let mut bad = connect(&server);
    let mut good = connect(&server);

    bad.write_all(b"NOT-HTTP\r\n\r\n").unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(bad.read(&mut buf).unwrap_or(0), 0);

    good.write_all(b"GET /still-up HTTP/1.1\r\n\r\n").unwrap();
    let mut reader = BufReader::new(good);
    assert_eq!(read_response(&mut reader), b"/still-up");

    server.shutdown().unwrap();
}

#[test]
fn test_line_echo_many_clients() {
    let server = start_line_echo();

    let clients: Vec<_> = (0..8)
        .map(|i| {
            let addr = server.local_addr();
            std::thread::spawn(move || {
                let mut stream = TcpStream::connect(addr).unwrap();
                stream
                    .set_read_timeout(Some(Duration::from_secs(5)))
                    .unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                for n in 0..20 {
                    let line = format!("client {} line {}\n", i, n);
                    stream.write_all(line.as_bytes()).unwrap();
                    let mut echoed = String::new();
                    reader.read_line(&mut echoed).unwrap();
                    assert_eq!(echoed, line);
                }
            })
        })
        .collect();

    for client in clients {
        client.join().unwrap();
    }
    server.shutdown().unwrap();
}

#[test]
fn test_outbound_sender_from_other_thread() {
    let seen: Arc<Mutex<Option<SocketId>>> = Arc::new(Mutex::new(None));
    let record = seen.clone();
    let server = Server::new(
        test_config(),
        LineDetector::default().factory(),
        processor_fn(move |message: &Message, _: &[u8], _: &mut WriteProxy<'_>| {
            if let Ok(mut slot) = record.lock() {
                *slot = message.socket_id();
            }
            Ok(())
        }),
    )
    .start()
    .unwrap();

    let mut client = connect(&server);
    client.write_all(b"register\n").unwrap();

    let id = loop {
        if let Some(id) = *seen.lock().unwrap() {
            break id;
        }
        std::thread::sleep(Duration::from_millis(5));
    };

    let sender = server.outbound();
    std::thread::spawn(move || sender.send(id, b"pushed\n".to_vec()))
        .join()
        .unwrap()
        .unwrap();

    let mut reader = BufReader::new(client);
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    assert_eq!(line, "pushed\n");

    server.shutdown().unwrap();
}

#[test]
fn test_close_request_through_handle() {
    let seen: Arc<Mutex<Option<SocketId>>> = Arc::new(Mutex::new(None));
    let record = seen.clone();
    let server = Server::new(
        test_config(),
        LineDetector::default().factory(),
        processor_fn(move |message: &Message, _: &[u8], _: &mut WriteProxy<'_>| {
            if let Ok(mut slot) = record.lock() {
                *slot = message.socket_id();
            }
            Ok(())
        }),
    )
    .start()
    .unwrap();

    let mut client = connect(&server);
    client.write_all(b"hello\n").unwrap();
    let id = loop {
        if let Some(id) = *seen.lock().unwrap() {
            break id;
        }
        std::thread::sleep(Duration::from_millis(5));
    };

    server.close(id).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(client.read(&mut buf).unwrap_or(0), 0);

    server.shutdown().unwrap();
}
