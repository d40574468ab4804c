//! RPC over real WebSocket connections.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use wsrpc::transport::WriteStrategy;
use wsrpc::ws::WebSocketListener;
use wsrpc::{Client, ClientOptions, Server, ServerOptions, ServiceDescriptor};

#[derive(Clone, PartialEq, prost::Message)]
struct TextMessage {
    #[prost(string, tag = "1")]
    text: String,
}

fn echo_service() -> ServiceDescriptor {
    ServiceDescriptor::new("test.EchoService")
        .method::<TextMessage, TextMessage>("Echo")
        .method::<TextMessage, TextMessage>("Shout")
}

async fn start_server() -> (Server, String) {
    let server = Server::new(
        [echo_service()],
        ServerOptions::default().ping_interval(Duration::from_millis(50)),
    )
    .unwrap();

    server
        .implement("Echo", |request: TextMessage, _connection| async move {
            Ok(request)
        })
        .unwrap();
    server
        .implement("Shout", |request: TextMessage, connection| async move {
            connection.send("shouted", None).await?;
            Ok::<_, anyhow::Error>(TextMessage {
                text: format!("{}!", request.text.to_uppercase()),
            })
        })
        .unwrap();

    let listener = WebSocketListener::bind("127.0.0.1:0").await.unwrap();
    let url = listener.url();
    server.listen(listener);

    (server, url)
}

#[tokio::test]
async fn test_websocket_roundtrip() {
    let _ = tracing_subscriber::fmt::try_init();

    let (server, url) = start_server().await;
    let client = Client::new(&url, [echo_service()], ClientOptions::default());
    client.connect().await.unwrap();

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    client.on_event("shouted", move |_| {
        let _ = events_tx.send(());
    });

    let service = client.default_service().unwrap();
    let reply: TextMessage = service
        .call("Echo", &TextMessage {
            text: "hello world".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(reply.text, "hello world");

    let shout: TextMessage = service
        .call("shout", &TextMessage {
            text: "hey".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(shout.text, "HEY!");
    timeout(Duration::from_secs(5), events_rx.recv())
        .await
        .unwrap()
        .unwrap();

    // Survives a few keep-alive pings
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(client.is_connected());
    assert_eq!(server.connection_count(), 1);

    server.close().await;
    assert_eq!(server.connection_count(), 0);
}

#[tokio::test]
async fn test_websocket_fire_and_forget_writes() {
    let _ = tracing_subscriber::fmt::try_init();

    let (server, url) = start_server().await;
    let client = Client::new(
        &url,
        [echo_service()],
        ClientOptions::default().write_strategy(WriteStrategy::FireAndForget),
    );

    let calls: Vec<_> = (0..20)
        .map(|i| {
            let client = &client;
            async move {
                let request = TextMessage {
                    text: format!("message {i}"),
                };
                let reply: TextMessage = client
                    .default_service()
                    .unwrap()
                    .call("Echo", &request)
                    .await
                    .unwrap();
                assert_eq!(reply, request);
            }
        })
        .collect();
    futures::future::join_all(calls).await;

    client.disconnect().await;
    server.close().await;
}
