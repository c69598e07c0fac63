//! Invokers and executors talking through the loopback broker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use mqtt_rpc::cache::{CacheConfig, CommandResponseCache};
use mqtt_rpc::chunking::{ChunkingClient, ChunkingOptions};
use mqtt_rpc::error::ProtocolErrorKind;
use mqtt_rpc::hlc::ApplicationHybridLogicalClock;
use mqtt_rpc::mqtt::loopback::{LoopbackBroker, LoopbackClient};
use mqtt_rpc::mqtt::PubSubClient;
use mqtt_rpc::rpc::executor::{
    self, ApplicationError, Executor, ExecutorRequest, ExecutorResponse,
};
use mqtt_rpc::rpc::invoker::{self, Invoker, Request};
use mqtt_rpc::rpc::payload::Json;

const TIMEOUT: Duration = Duration::from_secs(10);

fn reverse(request: ExecutorRequest<Bytes>) -> Result<ExecutorResponse<Bytes>, ApplicationError> {
    if request.payload.is_empty() {
        return Err(ApplicationError {
            message: "nothing to reverse".into(),
            property_name: Some("payload".into()),
            property_value: None,
        });
    }

    let mut reversed = request.payload.to_vec();
    reversed.reverse();

    Ok(ExecutorResponse {
        payload: reversed.into(),
        custom_user_data: request.custom_user_data,
    })
}

fn chunking(client: LoopbackClient) -> ChunkingClient<LoopbackClient> {
    ChunkingClient::new(
        client,
        ChunkingOptions {
            static_overhead: 512,
            ..Default::default()
        },
    )
    .unwrap()
}

#[tokio::test]
async fn large_payloads_are_chunked_both_ways() {
    let broker = LoopbackBroker::with_max_packet_size(2048);
    let hlc = Arc::new(ApplicationHybridLogicalClock::default());

    let executor = Executor::new(
        chunking(broker.connect(Some("executor"))),
        CommandResponseCache::new(CacheConfig::default()),
        hlc.clone(),
        executor::Options::new("reverse", "rpc/reverse"),
        |request: ExecutorRequest<Bytes>| async move { reverse(request) },
    )
    .unwrap();
    executor.start().await.unwrap();

    let invoker: Invoker<Bytes, Bytes, _> = Invoker::new(
        chunking(broker.connect(Some("invoker"))),
        hlc,
        invoker::Options::new("reverse", "rpc/reverse"),
    )
    .unwrap();

    let payload: Bytes = (0..20_000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>().into();

    let response = invoker
        .invoke(Request::new(payload.clone(), TIMEOUT).with_user_data("trace", "abc"))
        .await
        .unwrap();

    let mut expected = payload.to_vec();
    expected.reverse();

    assert_eq!(response.payload, expected);
    assert_eq!(
        response.custom_user_data,
        vec![("trace".to_owned(), "abc".to_owned())]
    );
    assert!(response.timestamp.is_some());

    // Too big for the broker without chunking.
    let unchunked: Invoker<Bytes, Bytes, _> = Invoker::new(
        broker.connect(Some("unchunked")),
        Arc::default(),
        invoker::Options::new("reverse", "rpc/reverse"),
    )
    .unwrap();

    let err = unchunked
        .invoke(Request::new(payload, TIMEOUT))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ProtocolErrorKind::ClientError);

    invoker.shutdown().await;
    unchunked.shutdown().await;
    executor.shutdown().await;
}

#[tokio::test]
async fn application_errors_reach_the_invoker() {
    let broker = LoopbackBroker::new();

    let executor = Executor::new(
        broker.connect(Some("executor")),
        CommandResponseCache::new(CacheConfig::default()),
        Arc::default(),
        executor::Options::new("reverse", "rpc/reverse"),
        |request: ExecutorRequest<Bytes>| async move { reverse(request) },
    )
    .unwrap();
    executor.start().await.unwrap();

    let invoker: Invoker<Bytes, Bytes, _> = Invoker::new(
        broker.connect(Some("invoker")),
        Arc::default(),
        invoker::Options::new("reverse", "rpc/reverse"),
    )
    .unwrap();

    let err = invoker
        .invoke(Request::new(Bytes::new(), TIMEOUT))
        .await
        .unwrap_err();

    assert_eq!(
        err.kind,
        ProtocolErrorKind::ExecutionException {
            property_name: Some("payload".into()),
            property_value: None,
        }
    );
    assert!(err.is_remote);
    assert_eq!(err.message.as_deref(), Some("nothing to reverse"));
    assert_eq!(err.command_name.as_deref(), Some("reverse"));

    executor.shutdown().await;
}

#[tokio::test]
async fn unsupported_content_type() {
    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    struct Sum {
        total: u64,
    }

    let broker = LoopbackBroker::new();

    let executor = Executor::new(
        broker.connect(Some("executor")),
        CommandResponseCache::new(CacheConfig::default()),
        Arc::default(),
        executor::Options::new("sum", "rpc/sum"),
        |request: ExecutorRequest<Json<Vec<u64>>>| async move {
            Ok(ExecutorResponse::new(Json(Sum {
                total: request.payload.0.iter().sum(),
            })))
        },
    )
    .unwrap();
    executor.start().await.unwrap();

    let invoker: Invoker<Json<Vec<u64>>, Json<Sum>, _> = Invoker::new(
        broker.connect(Some("invoker")),
        Arc::default(),
        invoker::Options::new("sum", "rpc/sum"),
    )
    .unwrap();

    let response = invoker
        .invoke(Request::new(Json(vec![1, 2, 3]), TIMEOUT))
        .await
        .unwrap();
    assert_eq!(response.payload.0.total, 6);
    assert_eq!(response.content_type.as_deref(), Some("application/json"));

    let raw: Invoker<Bytes, Json<Sum>, _> = Invoker::new(
        broker.connect(Some("raw")),
        Arc::default(),
        invoker::Options::new("sum", "rpc/sum"),
    )
    .unwrap();

    let err = raw
        .invoke(Request::new(Bytes::from_static(b"[1, 2, 3]"), TIMEOUT))
        .await
        .unwrap_err();

    assert_eq!(
        err.kind,
        ProtocolErrorKind::HeaderInvalid {
            header_name: "Content Type".into(),
            header_value: "application/octet-stream".into(),
        }
    );

    executor.shutdown().await;
}

#[tokio::test]
async fn idempotent_responses_are_reused_across_invokers() {
    let broker = LoopbackBroker::new();
    let executions = Arc::new(AtomicUsize::new(0));
    let counter = executions.clone();

    let executor = Executor::new(
        broker.connect(Some("executor")),
        CommandResponseCache::new(CacheConfig::default()),
        Arc::default(),
        executor::Options {
            is_idempotent: true,
            cacheable_duration: Duration::from_secs(60),
            reuse_across_invokers: true,
            ..executor::Options::new("reverse", "rpc/reverse")
        },
        move |request: ExecutorRequest<Bytes>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { reverse(request) }
        },
    )
    .unwrap();
    executor.start().await.unwrap();

    let invokers: Vec<Invoker<Bytes, Bytes, _>> = ["first", "second"]
        .into_iter()
        .map(|client_id| {
            Invoker::new(
                broker.connect(Some(client_id)),
                Arc::default(),
                invoker::Options::new("reverse", "rpc/reverse"),
            )
            .unwrap()
        })
        .collect();

    for invoker in &invokers {
        let response = invoker
            .invoke(Request::new(Bytes::from_static(b"abc"), TIMEOUT))
            .await
            .unwrap();
        assert_eq!(response.payload, "cba");
    }

    assert_eq!(executions.load(Ordering::SeqCst), 1);

    // A different payload isn't the same request.
    invokers[0]
        .invoke(Request::new(Bytes::from_static(b"abcd"), TIMEOUT))
        .await
        .unwrap();
    assert_eq!(executions.load(Ordering::SeqCst), 2);

    executor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn slow_executor_times_out() {
    let broker = LoopbackBroker::new();
    let client = broker.connect(Some("executor"));

    let executor = Executor::new(
        client.clone(),
        CommandResponseCache::new(CacheConfig::default()),
        Arc::default(),
        executor::Options {
            shutdown_client: true,
            ..executor::Options::new("reverse", "rpc/reverse")
        },
        |request: ExecutorRequest<Bytes>| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            reverse(request)
        },
    )
    .unwrap();
    executor.start().await.unwrap();

    let invoker: Invoker<Bytes, Bytes, _> = Invoker::new(
        broker.connect(Some("invoker")),
        Arc::default(),
        invoker::Options::new("reverse", "rpc/reverse"),
    )
    .unwrap();

    let err = invoker
        .invoke(Request::new(
            Bytes::from_static(b"abc"),
            Duration::from_secs(2),
        ))
        .await
        .unwrap_err();

    assert_eq!(
        err.kind,
        ProtocolErrorKind::Timeout {
            timeout_name: "command".into(),
            timeout_value: Some(Duration::from_secs(2)),
        }
    );

    executor.shutdown().await;
    assert!(!client.is_connected());
}
