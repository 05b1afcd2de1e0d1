use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::oneshot,
};

use mux_rpc::{
    Client, CodecType, Compression, Server, ServerHandle, Service, codec,
    error::{DialFailed, NoInstance, RemoteError},
    protocol::{self, Header, Message},
    registry::{DEFAULT_NAMESPACE, Instance, MemoryStore, Registry},
};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Args {
    a: i64,
    b: i64,
}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
struct Reply {
    result: i64,
}

fn arith() -> Service {
    Service::new()
        .method("Add", |args: Args, reply: &mut Reply| {
            reply.result = args.a + args.b;
            Ok(())
        })
        .method("Mul", |args: Args, reply: &mut Reply| {
            reply.result = args.a * args.b;
            Ok(())
        })
}

async fn setup() -> (Arc<Registry>, ServerHandle) {
    let registry = Arc::new(Registry::new(Arc::new(MemoryStore::new())));

    let mut server = Server::builder().build();
    server.register("Arith", arith());
    let handle = server.serve("127.0.0.1:0").await.unwrap();

    registry
        .register("Arith", Instance::new(handle.local_addr().to_string()), 10)
        .await
        .unwrap();

    (registry, handle)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn add_via_json() {
    let (registry, handle) = setup().await;
    let client = Client::builder(registry).build();

    let reply: Reply = client.invoke("Arith", "Add", &Args { a: 2, b: 3 }).await.unwrap();
    assert_eq!(reply, Reply { result: 5 });

    let reply: Reply = client.invoke("Arith", "Mul", &Args { a: 6, b: 7 }).await.unwrap();
    assert_eq!(reply, Reply { result: 42 });

    client.close().await;
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn add_via_bincode() {
    let registry = Arc::new(Registry::new(Arc::new(MemoryStore::new())));

    let mut server = Server::builder().codec(CodecType::Bincode).build();
    server.register("Arith", arith());
    let handle = server.serve("127.0.0.1:0").await.unwrap();

    registry
        .register("Arith", Instance::new(handle.local_addr().to_string()), 10)
        .await
        .unwrap();

    let client = Client::builder(registry).codec(CodecType::Bincode).build();
    let reply: Reply = client.invoke("Arith", "Add", &Args { a: 2, b: 3 }).await.unwrap();
    assert_eq!(reply, Reply { result: 5 });

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_batch_on_one_connection() {
    let (registry, handle) = setup().await;
    let client = Client::builder(registry).build();

    // all hundred requests go out before the first response is awaited, so
    // they share the single pooled connection in flight.
    let mut responses = Vec::new();
    for i in 0..100i64 {
        let response = client.invoke_async("Arith", "Add", &Args { a: i, b: i }).await.unwrap();
        responses.push((i, response));
    }

    for (i, response) in responses {
        let body = response.recv().await.unwrap();
        let reply: Reply = codec::unmarshal(CodecType::Json, &body).unwrap();
        assert_eq!(reply.result, 2 * i, "response crossed over for request {i}");
    }

    client.close().await;
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_method_is_a_remote_error() {
    let (registry, handle) = setup().await;
    let client = Client::builder(registry).build();

    let err = client.invoke::<_, Reply>("Arith", "Unknown", &Args::default()).await.unwrap_err();
    let remote = err.downcast_ref::<RemoteError>().unwrap();
    assert!(remote.0.contains("method not found"), "got: {}", remote.0);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_service_has_no_instance() {
    let registry = Arc::new(Registry::new(Arc::new(MemoryStore::new())));
    let client = Client::builder(registry).build();

    let err = client.invoke::<_, Reply>("Ghost", "Nope", &Args::default()).await.unwrap_err();
    assert!(err.downcast_ref::<NoInstance>().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn breaker_trips_and_probes() {
    let registry = Arc::new(Registry::new(Arc::new(MemoryStore::new())));

    let healthy = Arc::new(AtomicBool::new(false));
    let flag = healthy.clone();

    let mut server = Server::builder().build();
    server.register(
        "Flaky",
        Service::new().method("Ping", move |_: Args, reply: &mut Reply| {
            if flag.load(Ordering::SeqCst) {
                reply.result = 1;
                Ok(())
            } else {
                Err("boom".into())
            }
        }),
    );
    let handle = server.serve("127.0.0.1:0").await.unwrap();

    registry
        .register("Flaky", Instance::new(handle.local_addr().to_string()), 10)
        .await
        .unwrap();

    let client = Client::builder(registry)
        .breaker(10, 0.6, Duration::from_millis(200))
        .build();

    // a full window of failures trips the breaker.
    for _ in 0..10 {
        let err = client.invoke::<_, Reply>("Flaky", "Ping", &Args::default()).await.unwrap_err();
        assert!(err.downcast_ref::<RemoteError>().is_some());
    }

    // now rejected locally, without touching the network.
    let err = client.invoke::<_, Reply>("Flaky", "Ping", &Args::default()).await.unwrap_err();
    assert!(err.is_breaker_open());

    // after the open timeout a single probe goes out; it fails, re-opening.
    tokio::time::sleep(Duration::from_millis(250)).await;
    let err = client.invoke::<_, Reply>("Flaky", "Ping", &Args::default()).await.unwrap_err();
    assert!(err.downcast_ref::<RemoteError>().is_some());
    let err = client.invoke::<_, Reply>("Flaky", "Ping", &Args::default()).await.unwrap_err();
    assert!(err.is_breaker_open());

    // a successful probe closes the breaker and traffic flows again.
    healthy.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(250)).await;
    let reply: Reply = client.invoke("Flaky", "Ping", &Args::default()).await.unwrap();
    assert_eq!(reply.result, 1);
    let reply: Reply = client.invoke("Flaky", "Ping", &Args::default()).await.unwrap();
    assert_eq!(reply.result, 1);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn discovery_follows_churn() {
    let store = MemoryStore::new();
    let registry = Registry::new(Arc::new(store.clone()));

    registry.register("Echo", Instance::new("10.0.0.1:7000"), 10).await.unwrap();
    let instances = registry.discover("Echo").await.unwrap();
    assert_eq!(instances, vec![Instance::new("10.0.0.1:7000")]);

    // the watcher picks up a second registration.
    registry.register("Echo", Instance::new("10.0.0.2:7000"), 10).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut instances = registry.discover("Echo").await.unwrap();
    instances.sort_by(|a, b| a.addr.cmp(&b.addr));
    assert_eq!(
        instances,
        vec![Instance::new("10.0.0.1:7000"), Instance::new("10.0.0.2:7000")]
    );

    // and a delete.
    store.remove(&format!("/{DEFAULT_NAMESPACE}/services/Echo/10.0.0.1:7000"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    let instances = registry.discover("Echo").await.unwrap();
    assert_eq!(instances, vec![Instance::new("10.0.0.2:7000")]);
}

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Message> {
    let mut prefix = [0u8; 10];
    stream.read_exact(&mut prefix).await?;

    let header_len = u32::from_be_bytes([prefix[2], prefix[3], prefix[4], prefix[5]]) as usize;
    let body_len = u32::from_be_bytes([prefix[6], prefix[7], prefix[8], prefix[9]]) as usize;

    let mut rest = vec![0u8; header_len + body_len];
    stream.read_exact(&mut rest).await?;

    let mut frame = prefix.to_vec();
    frame.extend_from_slice(&rest);
    Ok(protocol::decode(&frame).unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connection_death_fails_pending_and_pool_redials() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        // first connection swallows requests until told to die.
        let (mut first, _) = listener.accept().await.unwrap();
        loop {
            tokio::select! {
                res = read_frame(&mut first) => {
                    if res.is_err() {
                        break;
                    }
                }
                _ = &mut kill_rx => break,
            }
        }
        drop(first);

        // the replacement connection behaves like a real server.
        let (mut second, _) = listener.accept().await.unwrap();
        while let Ok(msg) = read_frame(&mut second).await {
            let args: Args = codec::unmarshal(CodecType::Json, &msg.body).unwrap();
            let body = codec::marshal(CodecType::Json, &Reply { result: args.a + args.b }).unwrap();
            let resp = protocol::encode(&Message {
                header: Header {
                    request_id: msg.header.request_id,
                    compression: Compression::Gzip,
                    ..Default::default()
                },
                body,
            })
            .unwrap();
            second.write_all(&resp).await.unwrap();
        }
    });

    let registry = Arc::new(Registry::new(Arc::new(MemoryStore::new())));
    registry.register("Echo", Instance::new(addr), 10).await.unwrap();

    let client = Client::builder(registry).build();

    let mut responses = Vec::new();
    for i in 0..5i64 {
        responses.push(client.invoke_async("Echo", "Add", &Args { a: i, b: i }).await.unwrap());
    }

    kill_tx.send(()).unwrap();

    // every pending request resolves with the connection failure.
    for response in responses {
        let err = response.recv().await.unwrap_err();
        assert!(err.downcast_ref::<std::io::Error>().is_some(), "got: {err}");
    }

    // the next acquisition evicts the dead client and dials a fresh one.
    let reply: Reply = client.invoke("Echo", "Add", &Args { a: 20, b: 22 }).await.unwrap();
    assert_eq!(reply.result, 42);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abandoned_wait_leaves_other_requests_alone() {
    let registry = Arc::new(Registry::new(Arc::new(MemoryStore::new())));

    let mut server = Server::builder().build();
    server.register(
        "Slow",
        Service::new()
            .method("Nap", |_: Args, reply: &mut Reply| {
                std::thread::sleep(Duration::from_millis(200));
                reply.result = 7;
                Ok(())
            })
            .method("Add", |args: Args, reply: &mut Reply| {
                reply.result = args.a + args.b;
                Ok(())
            }),
    );
    let handle = server.serve("127.0.0.1:0").await.unwrap();

    registry
        .register("Slow", Instance::new(handle.local_addr().to_string()), 10)
        .await
        .unwrap();

    let client = Client::builder(registry).build();

    let slow = client.invoke_async("Slow", "Nap", &Args::default()).await.unwrap();
    let add = client.invoke_async("Slow", "Add", &Args { a: 1, b: 2 }).await.unwrap();

    // walk away from the slow call before its response arrives.
    let abandoned = tokio::time::timeout(Duration::from_millis(50), slow.recv()).await;
    assert!(abandoned.is_err());

    // the serial server still answers the second request on the same connection.
    let body = add.recv().await.unwrap();
    let reply: Reply = codec::unmarshal(CodecType::Json, &body).unwrap();
    assert_eq!(reply.result, 3);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn configured_timeout_bounds_the_wait() {
    let registry = Arc::new(Registry::new(Arc::new(MemoryStore::new())));

    let mut server = Server::builder().build();
    server.register(
        "Slow",
        Service::new().method("Nap", |_: Args, reply: &mut Reply| {
            std::thread::sleep(Duration::from_millis(300));
            reply.result = 7;
            Ok(())
        }),
    );
    let handle = server.serve("127.0.0.1:0").await.unwrap();

    registry
        .register("Slow", Instance::new(handle.local_addr().to_string()), 10)
        .await
        .unwrap();

    let client = Client::builder(registry).timeout(Duration::from_millis(100)).build();

    let err = client.invoke::<_, Reply>("Slow", "Nap", &Args::default()).await.unwrap_err();
    assert!(err.is_timeout());

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn local_rate_limit() {
    let (registry, handle) = setup().await;
    let client = Client::builder(registry).rate(2).build();

    client.invoke::<_, Reply>("Arith", "Add", &Args { a: 1, b: 1 }).await.unwrap();
    client.invoke::<_, Reply>("Arith", "Add", &Args { a: 1, b: 1 }).await.unwrap();

    let err = client.invoke::<_, Reply>("Arith", "Add", &Args::default()).await.unwrap_err();
    assert!(err.is_rate_limited());

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_kills_live_connections() {
    let (registry, handle) = setup().await;
    let client = Client::builder(registry).build();

    let reply: Reply = client.invoke("Arith", "Add", &Args { a: 1, b: 1 }).await.unwrap();
    assert_eq!(reply.result, 2);

    handle.shutdown().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // the pooled connection died with the server; redialing is refused.
    let err = client.invoke::<_, Reply>("Arith", "Add", &Args { a: 1, b: 1 }).await.unwrap_err();
    assert!(err.downcast_ref::<DialFailed>().is_some(), "got: {err}");
}
