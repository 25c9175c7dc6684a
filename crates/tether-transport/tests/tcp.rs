//! Integration tests for the TCP transport.

use tether_transport::{ConnectionReader, ConnectionWriter, TcpTransport, Transport};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn bind() -> (TcpTransport, String) {
    let transport = TcpTransport::bind("127.0.0.1:0").await.expect("should bind");
    let addr = transport.local_addr().expect("bound").to_string();
    (transport, addr)
}

#[tokio::test]
async fn test_tcp_accept_and_send_receive() {
    let (mut transport, addr) = bind().await;
    assert_eq!(transport.kind(), "tcp");

    let server = tokio::spawn(async move { transport.accept().await.expect("should accept") });
    let mut client = TcpStream::connect(&addr).await.unwrap();
    let mut accepted = server.await.unwrap();
    assert_eq!(accepted.peer, client.local_addr().unwrap());

    client.write_all(b"ping").await.unwrap();
    let mut got = Vec::new();
    while got.len() < 4 {
        let chunk = accepted.reader.recv().await.unwrap().expect("open");
        got.extend_from_slice(&chunk);
    }
    assert_eq!(got, b"ping");

    let mut out: &[u8] = b"pong";
    while !out.is_empty() {
        let n = accepted.writer.send(out).await.unwrap();
        out = &out[n..];
    }
    accepted.writer.flush().await.unwrap();

    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");
}

#[tokio::test]
async fn test_tcp_recv_returns_none_on_client_close() {
    let (mut transport, addr) = bind().await;
    let server = tokio::spawn(async move { transport.accept().await.expect("should accept") });
    let client = TcpStream::connect(&addr).await.unwrap();
    let mut accepted = server.await.unwrap();

    drop(client);
    assert!(accepted.reader.recv().await.unwrap().is_none());
}

#[tokio::test]
async fn test_tcp_writer_close_gives_client_eof() {
    let (mut transport, addr) = bind().await;
    let server = tokio::spawn(async move { transport.accept().await.expect("should accept") });
    let mut client = TcpStream::connect(&addr).await.unwrap();
    let mut accepted = server.await.unwrap();

    accepted.writer.close().await.unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn test_tcp_connection_ids_are_distinct() {
    let (mut transport, addr) = bind().await;
    let server = tokio::spawn(async move {
        let a = transport.accept().await.unwrap();
        let b = transport.accept().await.unwrap();
        (a.id, b.id)
    });
    let _c1 = TcpStream::connect(&addr).await.unwrap();
    let _c2 = TcpStream::connect(&addr).await.unwrap();
    let (a, b) = server.await.unwrap();
    assert_ne!(a, b);
}
