//! End-to-end conformance tests: two `Endpoint`s wired over an in-process
//! transport pair, exercising all four call shapes plus the error paths.

use std::sync::Arc;
use std::time::Duration;

use conduit::prelude::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Spins up a caller/responder endpoint pair over `MemTransport` and starts both
/// read loops. The responder has no services registered; callers add their own.
fn endpoint_pair() -> (Arc<Endpoint>, Arc<Endpoint>) {
    let (client_transport, server_transport) = MemTransport::pair();
    let client = Endpoint::new(client_transport, Role::Caller, EndpointConfig::default());
    let server = Endpoint::new(server_transport, Role::Responder, EndpointConfig::default());
    (client, server)
}

struct Echo;

impl ServiceContract for Echo {
    fn setup(&self, b: &mut ServiceBuilder) {
        b.add_unary_method::<_, String, String, JsonCodec, _>(
            "Ping",
            |req: String, _ctx: HandlerContext| async move { Ok(req) },
        );
    }
}

#[tokio::test]
async fn s1_unary_echo() {
    init_tracing();
    let (client, server) = endpoint_pair();
    server.register_service("Echo", &Echo).unwrap();
    server.start();
    client.start();

    let resp: String = client
        .call_unary::<String, String, JsonCodec>("Echo", "Ping", "hello".to_string(), None)
        .await
        .unwrap();
    assert_eq!(resp, "hello");

    client.close().await;
    server.close().await;
}

struct CountUp;

impl ServiceContract for CountUp {
    fn setup(&self, b: &mut ServiceBuilder) {
        b.add_server_stream_method::<_, u32, u32, JsonCodec, _>(
            "Upto",
            |n: u32, _ctx, sender| async move {
                for i in 0..n {
                    sender.send(&i).await?;
                }
                Ok(())
            },
        );
    }
}

#[tokio::test]
async fn s2_server_streaming_counter() {
    init_tracing();
    let (client, server) = endpoint_pair();
    server.register_service("CountUp", &CountUp).unwrap();
    server.start();
    client.start();

    let mut call = client
        .call_server_stream::<u32, u32, JsonCodec>("CountUp", "Upto", 5, None)
        .await
        .unwrap();

    let mut received = Vec::new();
    while let Some(item) = call.recv().await {
        received.push(item.unwrap());
    }
    assert_eq!(received, vec![0, 1, 2, 3, 4]);

    client.close().await;
    server.close().await;
}

struct Sum;

impl ServiceContract for Sum {
    fn setup(&self, b: &mut ServiceBuilder) {
        b.add_client_stream_method::<_, i64, i64, JsonCodec, _>(
            "Total",
            |mut reqs: DecodedStream<i64, JsonCodec>, _ctx| async move {
                let mut total = 0i64;
                while let Some(value) = reqs.recv().await {
                    total += value?;
                }
                Ok(total)
            },
        );
    }
}

#[tokio::test]
async fn s3_client_streaming_sum() {
    init_tracing();
    let (client, server) = endpoint_pair();
    server.register_service("Sum", &Sum).unwrap();
    server.start();
    client.start();

    let mut call = client
        .open_client_stream::<i64, i64, JsonCodec>("Sum", "Total", None)
        .await
        .unwrap();
    for value in [1, 2, 3, 4, 5] {
        call.send(value).await.unwrap();
    }
    let total = call.response().await.unwrap();
    assert_eq!(total, 15);

    client.close().await;
    server.close().await;
}

struct Shout;

impl ServiceContract for Shout {
    fn setup(&self, b: &mut ServiceBuilder) {
        b.add_bidi_method::<_, String, String, JsonCodec, _>(
            "Upper",
            |mut reqs: DecodedStream<String, JsonCodec>, _ctx, sender| async move {
                while let Some(value) = reqs.recv().await {
                    sender.send(&value?.to_uppercase()).await?;
                }
                Ok(())
            },
        );
    }
}

#[tokio::test]
async fn s4_bidi_chat() {
    init_tracing();
    let (client, server) = endpoint_pair();
    server.register_service("Shout", &Shout).unwrap();
    server.start();
    client.start();

    let mut call = client
        .open_bidi::<String, String, JsonCodec>("Shout", "Upper", None)
        .await
        .unwrap();

    call.send("one".to_string()).await.unwrap();
    assert_eq!(call.recv().await.unwrap().unwrap(), "ONE");
    call.send("two".to_string()).await.unwrap();
    assert_eq!(call.recv().await.unwrap().unwrap(), "TWO");

    call.finish_sending().await.unwrap();
    assert!(call.recv().await.is_none());

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn s5_unknown_method_is_unimplemented() {
    init_tracing();
    let (client, server) = endpoint_pair();
    server.register_service("Echo", &Echo).unwrap();
    server.start();
    client.start();

    let err = client
        .call_unary::<String, String, JsonCodec>("Echo", "DoesNotExist", "hi".to_string(), None)
        .await
        .unwrap_err();
    assert_eq!(err.code, StatusCode::Unimplemented);

    client.close().await;
    server.close().await;
}

struct SlowEcho;

impl ServiceContract for SlowEcho {
    fn setup(&self, b: &mut ServiceBuilder) {
        b.add_unary_method::<_, String, String, JsonCodec, _>(
            "Ping",
            |req: String, _ctx: HandlerContext| async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(req)
            },
        );
    }
}

#[tokio::test]
async fn s6_deadline_exceeded() {
    init_tracing();
    let (client, server) = endpoint_pair();
    server.register_service("SlowEcho", &SlowEcho).unwrap();
    server.start();
    client.start();

    let started = tokio::time::Instant::now();
    let err = client
        .call_unary::<String, String, JsonCodec>(
            "SlowEcho",
            "Ping",
            "hi".to_string(),
            Some(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, StatusCode::DeadlineExceeded);
    assert!(
        started.elapsed() < Duration::from_millis(150),
        "handler should have been cancelled promptly, took {:?}",
        started.elapsed()
    );

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn s8_bidi_cancel_blocks_further_sends_and_notifies_peer() {
    init_tracing();
    let (client, server) = endpoint_pair();
    server.register_service("Shout", &Shout).unwrap();
    server.start();
    client.start();

    let mut call = client
        .open_bidi::<String, String, JsonCodec>("Shout", "Upper", None)
        .await
        .unwrap();

    call.send("one".to_string()).await.unwrap();
    assert_eq!(call.recv().await.unwrap().unwrap(), "ONE");

    call.cancel().await;

    let err = call.send("two".to_string()).await.unwrap_err();
    assert_eq!(err.code, StatusCode::Cancelled);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn s9_global_high_water_mark_fails_most_recent_offender() {
    init_tracing();
    let (client_transport, server_transport) = MemTransport::pair();
    let caller_config = EndpointConfig {
        global_high_water_mark: 2,
        ..Default::default()
    };
    let client = Endpoint::new(client_transport, Role::Caller, caller_config);
    let responder_config = EndpointConfig {
        close_grace_period: Duration::from_millis(50),
        ..Default::default()
    };
    let server = Endpoint::new(server_transport, Role::Responder, responder_config);
    server.register_service("CountUp", &CountUp).unwrap();
    server.start();
    client.start();

    let mut call = client
        .call_server_stream::<u32, u32, JsonCodec>("CountUp", "Upto", 999, None)
        .await
        .unwrap();

    let mut last = None;
    while let Some(item) = call.recv().await {
        let is_err = item.is_err();
        last = Some(item);
        if is_err {
            break;
        }
    }
    let err = last.expect("breach should surface as an error item").unwrap_err();
    assert_eq!(err.code, StatusCode::ResourceExhausted);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn s7_concurrent_unary_calls() {
    init_tracing();
    let (client, server) = endpoint_pair();
    server.register_service("Echo", &Echo).unwrap();
    server.start();
    client.start();

    let mut calls = Vec::new();
    for i in 0..100 {
        let client = client.clone();
        calls.push(tokio::spawn(async move {
            client
                .call_unary::<String, String, JsonCodec>("Echo", "Ping", format!("msg-{i}"), None)
                .await
        }));
    }

    for (i, call) in calls.into_iter().enumerate() {
        let resp = call.await.unwrap().unwrap();
        assert_eq!(resp, format!("msg-{i}"));
    }

    client.close().await;
    server.close().await;
}
