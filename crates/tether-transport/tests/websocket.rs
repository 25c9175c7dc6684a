//! Integration tests for the WebSocket transport.
//!
//! A real server and `tokio-tungstenite` client on `127.0.0.1:0`, so the
//! split reader and writer are exercised over an actual socket.

#[cfg(feature = "websocket")]
mod websocket {
    use futures_util::{SinkExt, StreamExt};
    use tether_transport::{
        ConnectionReader, ConnectionWriter, Transport, WebSocketTransport,
    };
    use tokio_tungstenite::tungstenite::Message;

    type ClientWs = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    /// Binds a transport on a free port and returns it with its address.
    async fn bind() -> (WebSocketTransport, String) {
        let transport = WebSocketTransport::bind("127.0.0.1:0")
            .await
            .expect("should bind");
        let addr = transport.local_addr().expect("bound").to_string();
        (transport, addr)
    }

    async fn connect_client(addr: &str) -> ClientWs {
        let url = format!("ws://{addr}");
        let (ws, _) = tokio_tungstenite::connect_async(&url)
            .await
            .expect("client should connect");
        ws
    }

    #[tokio::test]
    async fn test_websocket_accept_and_send_receive() {
        let (mut transport, addr) = bind().await;
        assert_eq!(transport.kind(), "ws");

        let server = tokio::spawn(async move { transport.accept().await.expect("should accept") });
        let mut client = connect_client(&addr).await;
        let mut accepted = server.await.expect("task should complete");
        assert!(accepted.id.into_inner() > 0);

        // Server sends, client receives.
        let n = accepted
            .writer
            .send(b"hello from server")
            .await
            .expect("send should succeed");
        assert_eq!(n, 17);
        accepted.writer.flush().await.expect("flush should succeed");

        let msg = client.next().await.unwrap().unwrap();
        assert_eq!(msg.into_data().as_ref(), b"hello from server");

        // Client sends, server receives.
        client
            .send(Message::Binary(b"hello from client".to_vec().into()))
            .await
            .unwrap();
        let received = accepted
            .reader
            .recv()
            .await
            .expect("recv should succeed")
            .expect("should have data");
        assert_eq!(received, b"hello from client");

        accepted.writer.close().await.expect("close should succeed");
    }

    #[tokio::test]
    async fn test_websocket_recv_returns_none_on_client_close() {
        let (mut transport, addr) = bind().await;
        let server = tokio::spawn(async move { transport.accept().await.expect("should accept") });

        let mut client = connect_client(&addr).await;
        let mut accepted = server.await.unwrap();

        client.send(Message::Close(None)).await.unwrap();

        let result = accepted.reader.recv().await.expect("recv should not error");
        assert!(result.is_none(), "should return None on client close");
    }

    #[tokio::test]
    async fn test_websocket_text_message_delivered_as_bytes() {
        let (mut transport, addr) = bind().await;
        let server = tokio::spawn(async move { transport.accept().await.expect("should accept") });

        let mut client = connect_client(&addr).await;
        let mut accepted = server.await.unwrap();

        client.send(Message::Text("abc".into())).await.unwrap();
        let received = accepted.reader.recv().await.unwrap().unwrap();
        assert_eq!(received, b"abc");
    }

    #[tokio::test]
    async fn test_websocket_ping_reaches_client() {
        let (mut transport, addr) = bind().await;
        let server = tokio::spawn(async move { transport.accept().await.expect("should accept") });

        let mut client = connect_client(&addr).await;
        let mut accepted = server.await.unwrap();

        accepted.writer.ping().await.expect("ping should succeed");
        let msg = client.next().await.unwrap().unwrap();
        assert!(msg.is_ping());
    }
}
