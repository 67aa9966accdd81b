//! Integration tests for the WebSocket channels.
//!
//! These spin up a real listener on a random port and dial it with the
//! connector, so bytes actually cross a socket.

#[cfg(feature = "websocket")]
mod websocket {
    use std::time::Duration;

    use callwire_transport::{
        ChannelEvent, ChannelEvents, Connector, Listener, WebSocketConnector,
        WebSocketListener,
    };
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    async fn next_event(events: &mut ChannelEvents) -> ChannelEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event should arrive in time")
            .expect("event stream should still be open")
    }

    async fn bind() -> (WebSocketListener, String) {
        let listener = WebSocketListener::bind("127.0.0.1:0")
            .await
            .expect("should bind");
        let addr = listener.local_addr().expect("should have local addr");
        (listener, addr.to_string())
    }

    #[tokio::test]
    async fn test_connect_exchange_and_query_metadata() {
        let (mut listener, addr) = bind().await;

        let server = tokio::spawn(async move {
            listener.accept().await.expect("should accept")
        });

        let connector =
            WebSocketConnector::new(&format!("ws://{addr}/signal?peerId=alice&roomId=r1"))
                .unwrap();
        let (client, mut client_events) = connector.open();
        assert!(matches!(
            next_event(&mut client_events).await,
            ChannelEvent::Connected
        ));

        let mut inbound = server.await.expect("task should complete");
        assert_eq!(inbound.info.path, "/signal");
        assert_eq!(inbound.info.query_param("peerId"), Some("alice"));
        assert_eq!(inbound.info.query_param("roomId"), Some("r1"));
        assert!(matches!(
            next_event(&mut inbound.events).await,
            ChannelEvent::Connected
        ));

        // --- Client sends, server receives ---
        client.send(b"{\"hello\":1}".to_vec()).unwrap();
        match next_event(&mut inbound.events).await {
            ChannelEvent::Message(data) => assert_eq!(data, b"{\"hello\":1}"),
            other => panic!("expected message, got {other:?}"),
        }

        // --- Server sends, client receives ---
        inbound.channel.send(b"{\"hi\":2}".to_vec()).unwrap();
        match next_event(&mut client_events).await {
            ChannelEvent::Message(data) => assert_eq!(data, b"{\"hi\":2}"),
            other => panic!("expected message, got {other:?}"),
        }

        // --- Server closes, client sees the mapped close code ---
        inbound.channel.close(403, "Rejected").unwrap();
        match next_event(&mut client_events).await {
            ChannelEvent::Disconnected { reason } => {
                assert!(reason.contains("4403"), "reason was {reason}");
            }
            other => panic!("expected disconnect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_reports_error_then_disconnect() {
        // Bind and immediately drop so the port is (very likely) free.
        let (listener, addr) = bind().await;
        drop(listener);

        let connector = WebSocketConnector::new(&format!("ws://{addr}")).unwrap();
        let (_client, mut events) = connector.open();

        assert!(matches!(next_event(&mut events).await, ChannelEvent::Error(_)));
        assert!(matches!(
            next_event(&mut events).await,
            ChannelEvent::Disconnected { .. }
        ));
    }

    #[tokio::test]
    async fn test_send_after_channel_finished_fails() {
        let (mut listener, addr) = bind().await;
        let server = tokio::spawn(async move { listener.accept().await.unwrap() });

        let connector = WebSocketConnector::new(&format!("ws://{addr}")).unwrap();
        let (client, mut client_events) = connector.open();
        assert!(matches!(
            next_event(&mut client_events).await,
            ChannelEvent::Connected
        ));
        let inbound = server.await.unwrap();

        client.close(1000, "done").unwrap();
        drop(inbound);
        assert!(matches!(
            next_event(&mut client_events).await,
            ChannelEvent::Disconnected { .. }
        ));
        assert!(client.send(b"late".to_vec()).is_err());
    }

    #[tokio::test]
    async fn test_stalled_handshake_does_not_block_later_peers() {
        let (mut listener, addr) = bind().await;
        let server = tokio::spawn(async move {
            listener.accept().await.expect("should accept")
        });

        // Connects at the TCP level and never sends the upgrade request.
        let _stalled = TcpStream::connect(addr.as_str()).await.unwrap();

        let connector =
            WebSocketConnector::new(&format!("ws://{addr}/?peerId=bob")).unwrap();
        let (_client, mut client_events) = connector.open();
        assert!(matches!(
            next_event(&mut client_events).await,
            ChannelEvent::Connected
        ));

        let inbound = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("well-behaved peer should be accepted")
            .unwrap();
        assert_eq!(inbound.info.query_param("peerId"), Some("bob"));
    }

    #[tokio::test]
    async fn test_stalled_handshake_is_dropped_after_timeout() {
        let (listener, addr) = bind().await;
        let mut listener = listener.with_handshake_timeout(Duration::from_millis(100));
        let _accepting = tokio::spawn(async move {
            while listener.accept().await.is_ok() {}
        });

        let mut stalled = TcpStream::connect(addr.as_str()).await.unwrap();
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(5), stalled.read(&mut buf))
            .await
            .expect("listener should hang up on the stalled peer");
        assert!(matches!(read, Ok(0) | Err(_)), "unexpected read {read:?}");
    }
}
