//! End-to-end tests over the in-memory transport.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use wsrpc::codec;
use wsrpc::memory::{MemoryConnector, MemoryNetwork};
use wsrpc::protocol::{Envelope, Event, Request, Response};
use wsrpc::transport::{Channel, Connector, FrameSink, Listener, TransportError};
use wsrpc::{
    Client, ClientError, ClientEvent, ClientOptions, ClientState, Connection, EventPayload,
    ResolveError, Server, ServerEvent, ServerOptions, ServiceDescriptor,
};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone, PartialEq, prost::Message)]
struct TextMessage {
    #[prost(string, tag = "1")]
    text: String,
}

#[derive(Clone, PartialEq, prost::Message)]
struct NumberMessage {
    #[prost(uint64, tag = "1")]
    value: u64,
}

fn text(value: &str) -> TextMessage {
    TextMessage {
        text: value.to_string(),
    }
}

fn test_service() -> ServiceDescriptor {
    ServiceDescriptor::new("TestService")
        .method::<TextMessage, TextMessage>("Echo")
        .method::<TextMessage, TextMessage>("Upper")
        .method::<TextMessage, TextMessage>("Throw")
        .method::<TextMessage, TextMessage>("ThrowString")
        .method::<TextMessage, TextMessage>("NotImplemented")
}

fn namespaced_service() -> ServiceDescriptor {
    ServiceDescriptor::new("testNamespaceWithSameMethods.TestService")
        .method::<TextMessage, TextMessage>("Upper")
        .method::<TextMessage, TextMessage>("Lower")
}

fn services() -> Vec<ServiceDescriptor> {
    vec![test_service(), namespaced_service()]
}

async fn throw_string(_request: TextMessage, _connection: Connection) -> anyhow::Result<TextMessage> {
    std::panic::panic_any(String::from("Since you asked for it"))
}

fn start_server(network: &MemoryNetwork, address: &str) -> Server {
    let server = Server::new(services(), ServerOptions::default()).unwrap();

    server
        .implement("TestService.Echo", |request: TextMessage, _connection| async move {
            Ok(request)
        })
        .unwrap();
    server
        .implement("TestService.upper", |request: TextMessage, _connection| async move {
            Ok(text(&request.text.to_uppercase()))
        })
        .unwrap();
    server
        .implement("TestService.Throw", |_request: TextMessage, _connection| async move {
            Err::<TextMessage, _>(anyhow::anyhow!("Since you asked for it"))
        })
        .unwrap();
    server
        .implement("TestService.ThrowString", throw_string)
        .unwrap();
    server
        .implement_service(
            "testNamespaceWithSameMethods.TestService",
            "Upper",
            |request: TextMessage, _connection| async move {
                Ok(text(&format!("Upper: {}", request.text.to_uppercase())))
            },
        )
        .unwrap();
    server
        .implement(
            "testNamespaceWithSameMethods.TestService.lower",
            |request: TextMessage, _connection| async move {
                Ok(text(&format!("lower: {}", request.text.to_lowercase())))
            },
        )
        .unwrap();

    server.listen(network.listen(address).unwrap());
    server
}

fn options() -> ClientOptions {
    ClientOptions::default()
        .send_timeout(Duration::from_secs(2))
        .backoff(|_| Duration::from_millis(20))
}

fn start_client(network: &MemoryNetwork, address: &str, options: ClientOptions) -> Client {
    Client::with_connector(address, network.connector(), services(), options)
}

async fn call_text(
    client: &Client,
    service: &str,
    method: &str,
    value: &str,
) -> Result<TextMessage, ClientError> {
    client.service(service)?.call(method, &text(value)).await
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let waited = timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

async fn next_client_error(events: &mut broadcast::Receiver<ClientEvent>) -> Arc<ClientError> {
    timeout(WAIT, async {
        loop {
            if let ClientEvent::Error(e) = events.recv().await.unwrap() {
                return e;
            }
        }
    })
    .await
    .expect("no client error")
}

async fn next_server_error(events: &mut broadcast::Receiver<ServerEvent>) -> String {
    timeout(WAIT, async {
        loop {
            if let ServerEvent::Error(e) = events.recv().await.unwrap() {
                return e.to_string();
            }
        }
    })
    .await
    .expect("no server error")
}

async fn read_request(channel: &mut Channel) -> Request {
    let frame = timeout(WAIT, channel.stream.next())
        .await
        .expect("no request")
        .unwrap()
        .unwrap();

    match Envelope::decode(&frame).unwrap() {
        Envelope::Request(request) => request,
        other => panic!("expected a request, got {other:?}"),
    }
}

async fn respond(channel: &mut Channel, seq: u16, result: Result<Bytes, String>) {
    channel
        .sink
        .send(Envelope::Response(Response { seq, result }).encode())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_echo() {
    let _ = tracing_subscriber::fmt::try_init();

    let network = MemoryNetwork::new();
    let _server = start_server(&network, "echo");
    let client = start_client(&network, "echo", options());

    client.connect().await.unwrap();
    assert!(client.is_connected());

    let reply = call_text(&client, "TestService", "Echo", "hello world")
        .await
        .unwrap();
    assert_eq!(reply.text, "hello world");

    let upper = call_text(&client, "TestService", "upper", "hello world")
        .await
        .unwrap();
    assert_eq!(upper.text, "HELLO WORLD");
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_namespaced_methods_dispatch_independently() {
    let _ = tracing_subscriber::fmt::try_init();

    let network = MemoryNetwork::new();
    let _server = start_server(&network, "namespaced");
    let client = start_client(&network, "namespaced", options());

    let namespace = "testNamespaceWithSameMethods.TestService";
    let upper = call_text(&client, namespace, "Upper", "hello world")
        .await
        .unwrap();
    let lower = call_text(&client, namespace, "lower", "HELLO WORLD")
        .await
        .unwrap();
    let root = call_text(&client, "TestService", "Upper", "hello world")
        .await
        .unwrap();

    assert_eq!(upper.text, "Upper: HELLO WORLD");
    assert_eq!(lower.text, "lower: hello world");
    assert_eq!(root.text, "HELLO WORLD");
}

#[tokio::test]
async fn test_concurrent_calls_correlate() {
    let _ = tracing_subscriber::fmt::try_init();

    let network = MemoryNetwork::new();
    let _server = start_server(&network, "concurrent");
    let client = start_client(&network, "concurrent", options());
    client.connect().await.unwrap();

    let (buzz, fizz) = tokio::join!(
        call_text(&client, "TestService", "Echo", "fizz"),
        call_text(&client, "TestService", "Echo", "buzz"),
    );
    assert_eq!(buzz.unwrap().text, "fizz");
    assert_eq!(fizz.unwrap().text, "buzz");

    let calls: Vec<_> = (0..50)
        .map(|i| {
            let client = &client;
            async move { (i, call_text(client, "TestService", "Echo", &i.to_string()).await) }
        })
        .collect();
    for (i, reply) in futures::future::join_all(calls).await {
        assert_eq!(reply.unwrap().text, i.to_string());
    }
}

#[tokio::test]
async fn test_handler_failures_become_rpc_errors() {
    let _ = tracing_subscriber::fmt::try_init();

    let network = MemoryNetwork::new();
    let server = start_server(&network, "failures");
    let mut server_events = server.subscribe();
    let client = start_client(&network, "failures", options());

    let thrown = call_text(&client, "TestService", "Throw", "").await;
    assert!(matches!(&thrown, Err(ClientError::Rpc(message)) if message == "Since you asked for it"));
    assert_eq!(
        next_server_error(&mut server_events).await,
        "connection error: Since you asked for it"
    );

    let panicked = call_text(&client, "TestService", "ThrowString", "").await;
    assert!(matches!(&panicked, Err(ClientError::Rpc(message)) if message == "Since you asked for it"));

    let missing = call_text(&client, "TestService", "NotImplemented", "").await;
    assert!(matches!(&missing, Err(ClientError::Rpc(message)) if message == "Not implemented"));

    // The connection survives all of the above
    let reply = call_text(&client, "TestService", "Echo", "still here")
        .await
        .unwrap();
    assert_eq!(reply.text, "still here");
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn test_bogus_requests_are_answered() {
    let _ = tracing_subscriber::fmt::try_init();

    let network = MemoryNetwork::new();
    let server = start_server(&network, "bogus");
    let mut server_events = server.subscribe();
    let client = start_client(&network, "bogus", options());

    let invalid_method = client.call("TestService", "Bogus", Bytes::new()).await;
    assert!(matches!(&invalid_method, Err(ClientError::Rpc(message)) if message == "Invalid method"));
    assert_eq!(
        next_server_error(&mut server_events).await,
        "connection error: Invalid method"
    );

    let invalid_service = client.call("NoSuchService", "Echo", Bytes::new()).await;
    assert!(matches!(&invalid_service, Err(ClientError::Rpc(message)) if message == "Invalid service"));

    // Not a TextMessage: field 1 carries a varint instead of a string
    let undecodable = client
        .call("TestService", "Echo", Bytes::from_static(&[0x08, 0x01]))
        .await;
    assert!(matches!(&undecodable, Err(ClientError::Rpc(message)) if message.contains("TextMessage")));
}

#[tokio::test]
async fn test_client_rejects_unknown_methods_and_types_locally() {
    let _ = tracing_subscriber::fmt::try_init();

    let network = MemoryNetwork::new();
    let client = start_client(&network, "local", options().auto_connect(false));

    assert!(matches!(
        client.service("Nope"),
        Err(ClientError::UnknownService(name)) if name == "Nope"
    ));
    assert!(client.default_service().is_none());
    assert_eq!(client.services().count(), 2);

    let service = client.service("TestService").unwrap();
    assert!(matches!(
        service.call::<_, TextMessage>("Missing", &text("")).await,
        Err(ClientError::UnknownMethod(name)) if name == "TestService.Missing"
    ));
    assert!(matches!(
        service
            .call::<_, TextMessage>("Echo", &NumberMessage { value: 1 })
            .await,
        Err(ClientError::TypeMismatch { .. })
    ));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_call_times_out() {
    let _ = tracing_subscriber::fmt::try_init();

    let network = MemoryNetwork::new();
    let listener = network.listen("silent").unwrap();
    let peer = tokio::spawn(async move {
        let mut channel = listener.accept().await.unwrap();
        // Read and never answer
        while channel.stream.next().await.is_some() {}
    });

    let client = start_client(
        &network,
        "silent",
        options().send_timeout(Duration::from_millis(100)),
    );
    client.connect().await.unwrap();

    let started = Instant::now();
    let result = call_text(&client, "TestService", "Echo", "anyone?").await;
    let elapsed = started.elapsed();

    let error = result.unwrap_err();
    assert!(matches!(error, ClientError::Timeout { .. }));
    assert_eq!(error.to_string(), "Timed out after 100ms");
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(1));

    // The connection stays up and the call is forgotten
    assert!(client.is_connected());
    assert_eq!(client.pending_calls(), 0);

    drop(client);
    timeout(WAIT, peer).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_calls_buffered_until_connected() {
    let _ = tracing_subscriber::fmt::try_init();

    let network = MemoryNetwork::new();
    let listener = network.listen("buffered").unwrap();
    let client = start_client(&network, "buffered", options().auto_connect(false));

    let first = call_text(&client, "TestService", "Echo", "first");
    let second = call_text(&client, "TestService", "Echo", "second");

    let peer = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.state(), ClientState::Disconnected);
        assert_eq!(client.pending_calls(), 2);

        client.connect().await.unwrap();
        let mut channel = listener.accept().await.unwrap();

        let mut seqs = Vec::new();
        for expected in ["first", "second"] {
            let request = read_request(&mut channel).await;
            assert_eq!(request.service, "TestService");
            assert_eq!(request.method, "Echo");

            let message: TextMessage = codec::decode(&request.payload).unwrap();
            assert_eq!(message.text, expected);

            seqs.push(request.seq);
            respond(&mut channel, request.seq, Ok(request.payload)).await;
        }
        assert!(seqs[0] < seqs[1]);
        channel
    };

    let (first, second, _channel) = tokio::join!(first, second, peer);
    assert_eq!(first.unwrap().text, "first");
    assert_eq!(second.unwrap().text, "second");
}

#[tokio::test]
async fn test_unknown_seq_is_reported() {
    let _ = tracing_subscriber::fmt::try_init();

    let network = MemoryNetwork::new();
    let listener = network.listen("unknown-seq").unwrap();
    let client = start_client(&network, "unknown-seq", options());
    let mut events = client.subscribe();

    client.connect().await.unwrap();
    let mut channel = listener.accept().await.unwrap();

    let call = call_text(&client, "TestService", "Echo", "pending");
    let peer = async {
        let request = read_request(&mut channel).await;

        respond(&mut channel, request.seq.wrapping_add(999), Ok(Bytes::new())).await;
        let error = next_client_error(&mut events).await;
        assert!(matches!(*error, ClientError::UnknownSeq { .. }));
        assert!(error.to_string().starts_with("Got response for unknown seqNo: "));

        respond(&mut channel, request.seq, Ok(request.payload)).await;
    };

    let (reply, ()) = tokio::join!(call, peer);
    assert_eq!(reply.unwrap().text, "pending");
}

#[tokio::test]
async fn test_rpc_error_from_peer() {
    let _ = tracing_subscriber::fmt::try_init();

    let network = MemoryNetwork::new();
    let listener = network.listen("peer-error").unwrap();
    let client = start_client(&network, "peer-error", options());
    client.connect().await.unwrap();
    let mut channel = listener.accept().await.unwrap();

    let call = call_text(&client, "TestService", "Echo", "");
    let peer = async {
        let request = read_request(&mut channel).await;
        respond(&mut channel, request.seq, Err("Server says no".to_string())).await;
    };

    let (reply, ()) = tokio::join!(call, peer);
    assert!(matches!(reply, Err(ClientError::Rpc(message)) if message == "Server says no"));
}

#[tokio::test]
async fn test_garbled_server_data() {
    let _ = tracing_subscriber::fmt::try_init();

    let network = MemoryNetwork::new();
    let listener = network.listen("garbled-server").unwrap();
    let client = start_client(&network, "garbled-server", options());
    let mut events = client.subscribe();

    client.connect().await.unwrap();
    let mut channel = listener.accept().await.unwrap();

    channel
        .sink
        .send(Bytes::from_static(&[0x0a, 0xff]))
        .await
        .unwrap();
    let error = next_client_error(&mut events).await;
    assert!(matches!(*error, ClientError::Message(_)));
    assert!(error.to_string().starts_with("got invalid message"));

    // Still usable
    let call = call_text(&client, "TestService", "Echo", "after garbage");
    let peer = async {
        let request = read_request(&mut channel).await;
        respond(&mut channel, request.seq, Ok(request.payload)).await;
    };
    let (reply, ()) = tokio::join!(call, peer);
    assert_eq!(reply.unwrap().text, "after garbage");
}

#[tokio::test]
async fn test_garbled_client_data() {
    let _ = tracing_subscriber::fmt::try_init();

    let network = MemoryNetwork::new();
    let server = start_server(&network, "garbled-client");
    let mut server_events = server.subscribe();

    let mut channel = network.connector().connect("garbled-client").await.unwrap();

    channel
        .sink
        .send(Bytes::from_static(&[0x0a, 0xff]))
        .await
        .unwrap();
    let error = next_server_error(&mut server_events).await;
    assert!(error.starts_with("connection error: could not decode message: "));

    let event = Envelope::Event(Event {
        name: "bogus".to_string(),
        payload: None,
    });
    channel.sink.send(event.encode()).await.unwrap();
    assert_eq!(
        next_server_error(&mut server_events).await,
        "connection error: could not decode message: Invalid message type: event"
    );

    // Neither broke the connection
    let request = Envelope::Request(Request {
        seq: 7,
        service: "TestService".to_string(),
        method: "Echo".to_string(),
        payload: codec::encode(&text("valid")),
    });
    channel.sink.send(request.encode()).await.unwrap();

    let frame = timeout(WAIT, channel.stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let Envelope::Response(response) = Envelope::decode(&frame).unwrap() else {
        panic!("expected a response");
    };
    assert_eq!(response.seq, 7);
    let reply: TextMessage = codec::decode(&response.result.unwrap()).unwrap();
    assert_eq!(reply.text, "valid");
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn test_events() {
    let _ = tracing_subscriber::fmt::try_init();

    let network = MemoryNetwork::new();
    let server = start_server(&network, "events");
    let client = start_client(
        &network,
        "events",
        options().event_type::<TextMessage>("typed"),
    );

    let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();
    client.on_event("raw", move |payload| {
        let _ = raw_tx.send(payload.as_bytes().cloned());
    });
    let (typed_tx, mut typed_rx) = mpsc::unbounded_channel();
    client.on_typed("typed", move |message: &TextMessage| {
        let _ = typed_tx.send(message.text.clone());
    });
    let (any_tx, mut any_rx) = mpsc::unbounded_channel();
    let any = client.on_any_event(move |name, _| {
        let _ = any_tx.send(name.to_string());
    });
    let mut events = client.subscribe();

    client.connect().await.unwrap();
    eventually("server connection", || server.connection_count() == 1).await;

    server
        .broadcast("raw", Some(Bytes::from_static(b"\x01\x02")))
        .await;
    assert_eq!(
        timeout(WAIT, raw_rx.recv()).await.unwrap().unwrap(),
        Some(Bytes::from_static(b"\x01\x02"))
    );

    server
        .broadcast("typed", Some(codec::encode(&text("hello events"))))
        .await;
    assert_eq!(
        timeout(WAIT, typed_rx.recv()).await.unwrap().unwrap(),
        "hello events"
    );

    server
        .broadcast("typed", Some(Bytes::from_static(&[0x08, 0x01])))
        .await;
    let error = next_client_error(&mut events).await;
    assert!(matches!(&*error, ClientError::Event { name, .. } if name == "typed"));

    assert!(client.remove_listener(any));
    server.broadcast("empty", None).await;

    let (name, payload) = timeout(WAIT, async {
        loop {
            if let ClientEvent::Event { name, payload } = events.recv().await.unwrap() {
                if name == "empty" {
                    return (name, payload);
                }
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(name, "empty");
    assert!(matches!(payload, EventPayload::Empty));

    let mut seen = Vec::new();
    while let Ok(name) = any_rx.try_recv() {
        seen.push(name);
    }
    assert_eq!(seen, ["raw", "typed"]);
    assert!(typed_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_connection_send_targets_one_peer() {
    let _ = tracing_subscriber::fmt::try_init();

    let network = MemoryNetwork::new();
    let server = start_server(&network, "targeted");

    let first = start_client(&network, "targeted", options());
    first.connect().await.unwrap();
    eventually("first connection", || server.connection_count() == 1).await;

    let second = start_client(&network, "targeted", options());
    second.connect().await.unwrap();
    eventually("second connection", || server.connection_count() == 2).await;

    let (first_tx, mut first_rx) = mpsc::unbounded_channel();
    first.on_any_event(move |name, _| {
        let _ = first_tx.send(name.to_string());
    });
    let (second_tx, mut second_rx) = mpsc::unbounded_channel();
    second.on_any_event(move |name, _| {
        let _ = second_tx.send(name.to_string());
    });

    let connections = server.connections();
    assert!(connections[0].id() < connections[1].id());
    connections[1].send("only-second", None).await.unwrap();
    server.broadcast("everyone", None).await;

    assert_eq!(timeout(WAIT, first_rx.recv()).await.unwrap().unwrap(), "everyone");
    assert_eq!(
        timeout(WAIT, second_rx.recv()).await.unwrap().unwrap(),
        "only-second"
    );
    assert_eq!(timeout(WAIT, second_rx.recv()).await.unwrap().unwrap(), "everyone");
}

#[tokio::test]
async fn test_reconnects_after_server_restart() {
    let _ = tracing_subscriber::fmt::try_init();

    let network = MemoryNetwork::new();
    let server = start_server(&network, "restart");

    let retries = Arc::new(Mutex::new(Vec::new()));
    let recorded = retries.clone();
    let client = start_client(
        &network,
        "restart",
        options().backoff(move |tries| {
            recorded.lock().push(tries);
            Duration::from_millis(20)
        }),
    );
    let mut events = client.subscribe();

    client.connect().await.unwrap();
    call_text(&client, "TestService", "Echo", "before")
        .await
        .unwrap();

    server.close().await;
    assert_eq!(server.connection_count(), 0);
    eventually("client to notice", || !client.is_connected()).await;
    eventually("address release", || !network.is_listening("restart")).await;

    let buzz = call_text(&client, "TestService", "Echo", "fizz");
    let fizz = call_text(&client, "TestService", "Echo", "buzz");
    let restart = async {
        eventually("a few retries", || retries.lock().len() >= 3).await;
        start_server(&network, "restart")
    };

    let (buzz, fizz, _server) = tokio::join!(buzz, fizz, restart);
    assert_eq!(buzz.unwrap().text, "fizz");
    assert_eq!(fizz.unwrap().text, "buzz");

    let mut opens = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ClientEvent::Open) {
            opens += 1;
        }
    }
    assert_eq!(opens, 2);

    let retries = retries.lock().clone();
    assert_eq!(retries[0], 1);
    assert!(retries.windows(2).all(|pair| pair[1] == pair[0] + 1));
}

#[tokio::test]
async fn test_connect_keeps_retrying() {
    let _ = tracing_subscriber::fmt::try_init();

    let network = MemoryNetwork::new();
    let client = start_client(&network, "later", options().auto_connect(false));
    let mut events = client.subscribe();

    assert!(matches!(
        client.connect().await,
        Err(ClientError::NotConnected)
    ));
    let error = next_client_error(&mut events).await;
    assert!(matches!(
        *error,
        ClientError::Transport(TransportError::ConnectionFailed(_))
    ));

    let _server = start_server(&network, "later");
    eventually("reconnect", || client.is_connected()).await;
    let reply = call_text(&client, "TestService", "Echo", "finally")
        .await
        .unwrap();
    assert_eq!(reply.text, "finally");
}

#[tokio::test]
async fn test_disconnect_stops_reconnecting() {
    let _ = tracing_subscriber::fmt::try_init();

    let network = MemoryNetwork::new();
    let server = start_server(&network, "disconnect");
    let client = start_client(&network, "disconnect", options());

    client.connect().await.unwrap();
    eventually("server connection", || server.connection_count() == 1).await;

    client.disconnect().await;
    assert_eq!(client.state(), ClientState::Disconnected);
    eventually("server cleanup", || server.connection_count() == 0).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.state(), ClientState::Disconnected);
    assert_eq!(server.connection_count(), 0);

    client.connect().await.unwrap();
    let reply = call_text(&client, "TestService", "Echo", "again")
        .await
        .unwrap();
    assert_eq!(reply.text, "again");
}

#[tokio::test]
async fn test_connect_while_closing_skips_backoff() {
    let _ = tracing_subscriber::fmt::try_init();

    let network = MemoryNetwork::new();
    let server = start_server(&network, "closing-connect");
    let client = start_client(
        &network,
        "closing-connect",
        options().backoff(|_| Duration::from_secs(30)),
    );

    client.connect().await.unwrap();
    eventually("server connection", || server.connection_count() == 1).await;

    let (_, connected) = timeout(WAIT, async {
        tokio::join!(client.disconnect(), async {
            assert_eq!(client.state(), ClientState::Closing);
            client.connect().await
        })
    })
    .await
    .expect("connect waited out the backoff");
    connected.unwrap();
    assert!(client.is_connected());

    let reply = call_text(&client, "TestService", "Echo", "back")
        .await
        .unwrap();
    assert_eq!(reply.text, "back");
}

#[tokio::test]
async fn test_server_close_disconnects_clients() {
    let _ = tracing_subscriber::fmt::try_init();

    let network = MemoryNetwork::new();
    let server = start_server(&network, "closing");
    let client = start_client(&network, "closing", options());
    let mut events = client.subscribe();

    client.connect().await.unwrap();
    eventually("server connection", || server.connection_count() == 1).await;
    let connection = server.connections().remove(0);

    server.close().await;
    assert!(connection.is_closed());
    assert_eq!(server.connection_count(), 0);

    timeout(WAIT, async {
        while !matches!(events.recv().await.unwrap(), ClientEvent::Close) {}
    })
    .await
    .unwrap();

    let result = connection.send("too-late", None).await;
    assert!(matches!(result, Err(TransportError::ConnectionClosed)));
}

#[tokio::test]
async fn test_server_close_does_not_wait_for_silent_peer() {
    let _ = tracing_subscriber::fmt::try_init();

    let network = MemoryNetwork::new();
    let server = start_server(&network, "silent");

    // Reads nothing and never acknowledges the close
    let (local, _remote) = wsrpc::memory::pair();
    let silent = Channel::new(
        local.sink,
        Box::pin(futures::stream::pending::<Result<Bytes, TransportError>>()),
    );
    let connection = server.accept(silent);
    assert_eq!(server.connection_count(), 1);

    timeout(WAIT, server.close())
        .await
        .expect("server close waited on a silent peer");
    assert!(connection.is_closed());
    assert_eq!(server.connection_count(), 0);
}

#[tokio::test]
async fn test_connection_close_deregisters_silent_peer() {
    let _ = tracing_subscriber::fmt::try_init();

    let network = MemoryNetwork::new();
    let server = start_server(&network, "silent-close");

    let (local, _remote) = wsrpc::memory::pair();
    let silent = Channel::new(
        local.sink,
        Box::pin(futures::stream::pending::<Result<Bytes, TransportError>>()),
    );
    let connection = server.accept(silent);

    connection.close();
    timeout(WAIT, connection.closed())
        .await
        .expect("connection close waited on a silent peer");
    assert_eq!(server.connection_count(), 0);
}

struct FailingSink {
    _inner: Box<dyn FrameSink>,
}

#[async_trait]
impl FrameSink for FailingSink {
    async fn send(&mut self, _data: Bytes) -> Result<(), TransportError> {
        Err(TransportError::Other("boom".to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct FailingConnector {
    inner: MemoryConnector,
}

#[async_trait]
impl Connector for FailingConnector {
    async fn connect(&self, address: &str) -> Result<Channel, TransportError> {
        let channel = self.inner.connect(address).await?;
        Ok(Channel::new(
            Box::new(FailingSink {
                _inner: channel.sink,
            }),
            channel.stream,
        ))
    }
}

#[tokio::test]
async fn test_failed_write_rejects_call() {
    let _ = tracing_subscriber::fmt::try_init();

    let network = MemoryNetwork::new();
    let _server = start_server(&network, "failing");
    let client = Client::with_connector(
        "failing",
        FailingConnector {
            inner: network.connector(),
        },
        services(),
        options(),
    );
    client.connect().await.unwrap();

    let error = call_text(&client, "TestService", "Echo", "lost")
        .await
        .unwrap_err();
    assert!(matches!(error, ClientError::Transport(_)));
    assert_eq!(error.to_string(), "boom");
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_setup_errors() {
    let _ = tracing_subscriber::fmt::try_init();

    assert!(matches!(
        Server::new(Vec::new(), ServerOptions::default()),
        Err(ResolveError::NoServices)
    ));

    let server = Server::new(services(), ServerOptions::default()).unwrap();

    let bare = server.implement("Echo", |request: TextMessage, _connection| async move {
        Ok(request)
    });
    assert_eq!(bare, Err(ResolveError::NoDefaultService));

    let missing = server.implement(
        "TestService.Missing",
        |request: TextMessage, _connection| async move { Ok(request) },
    );
    assert_eq!(
        missing,
        Err(ResolveError::InvalidMethod("TestService.Missing".to_string()))
    );

    let mistyped = server.implement(
        "TestService.Echo",
        |request: NumberMessage, _connection| async move { Ok(request) },
    );
    assert!(matches!(mistyped, Err(ResolveError::TypeMismatch { .. })));

    let single = Server::new([test_service()], ServerOptions::default()).unwrap();
    assert!(
        single
            .implement("echo", |request: TextMessage, _connection| async move { Ok(request) })
            .is_ok()
    );
}
