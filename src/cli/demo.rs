use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use color_eyre::eyre::{self, WrapErr};
use rand::Rng;

use crate::cache::CommandResponseCache;
use crate::checksum;
use crate::chunking::ChunkingClient;
use crate::cli::LogFormat;
use crate::config::{self, Config};
use crate::hlc::ApplicationHybridLogicalClock;
use crate::mqtt::loopback::{LoopbackBroker, LoopbackClient};
use crate::rpc::executor::{self, ApplicationError, Executor, ExecutorRequest, ExecutorResponse};
use crate::rpc::invoker::{self, Invoker, Request};
use crate::rpc::payload::Json;

const COMMAND_NAME: &str = "digest";
const REQUEST_TOPIC: &str = "demo/{executorId}/digest";
const EXECUTOR_ID: &str = "demo-executor";

#[derive(clap::Args, Clone, Debug)]
pub struct DemoArgs {
    /// Set the format of log output.
    #[clap(short, long, default_value = "full")]
    pub log: LogFormat,

    /// Read settings from this TOML file, or `-` for stdin.
    #[clap(short, long, env = "MQTT_RPC_CONFIG")]
    pub config: Option<PathBuf>,

    /// The maximum packet size the in-memory broker accepts.
    #[clap(long, default_value = "4096")]
    pub max_packet_size: u32,

    /// The size of the large request, in bytes.
    #[clap(long, default_value = "65536")]
    pub large_payload_size: usize,
}

/// What the executor reports about a request payload.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Digest {
    pub len: usize,
    pub sha256: String,
}

type Client = ChunkingClient<LoopbackClient>;

pub fn main(args: DemoArgs) -> crate::Result<()> {
    // File and stdio aren't truly async in Tokio so we might as well do that before we even start the runtime
    let config = match &args.config {
        Some(path) => config::read(path)?,
        None => Config::default(),
    };

    main_async(args, config)
}

// `#[tokio::main]` doesn't have to be attached to the actual `main()`, and it can accept args
#[tokio::main]
async fn main_async(args: DemoArgs, config: Config) -> crate::Result<()> {
    let broker = LoopbackBroker::with_max_packet_size(args.max_packet_size);
    let hlc = Arc::new(ApplicationHybridLogicalClock::default());
    let cache = CommandResponseCache::new(config.cache.clone());
    let executions = Arc::new(AtomicUsize::new(0));

    let executor_client = ChunkingClient::new(broker.connect(Some(EXECUTOR_ID)), config.chunking.clone())
        .wrap_err("error creating executor client")?;
    let invoker_client = ChunkingClient::new(broker.connect(Some("demo-invoker")), config.chunking.clone())
        .wrap_err("error creating invoker client")?;

    let counter = executions.clone();

    let executor = Executor::<Bytes, Json<Digest>, Client, _>::new(
        executor_client,
        cache.clone(),
        hlc.clone(),
        executor::Options {
            is_idempotent: true,
            cacheable_duration: Duration::from_secs(30),
            topic_token_map: [("executorId".to_owned(), EXECUTOR_ID.to_owned())]
                .into_iter()
                .collect(),
            ..executor::Options::new(COMMAND_NAME, REQUEST_TOPIC)
        },
        move |request: ExecutorRequest<Bytes>| {
            counter.fetch_add(1, Ordering::Relaxed);

            async move {
                tracing::info!(
                    invoker_id = request.invoker_id.as_deref().unwrap_or("unknown"),
                    len = request.payload.len(),
                    "digesting request"
                );

                if request.payload.is_empty() {
                    return Err(ApplicationError::new("nothing to digest"));
                }

                Ok(ExecutorResponse::new(Json(Digest {
                    len: request.payload.len(),
                    sha256: checksum::calculate(&request.payload, checksum::ChecksumAlgorithm::Sha256),
                })))
            }
        },
    )
    .wrap_err("error creating executor")?;

    executor.start().await.wrap_err("error starting executor")?;

    let invoker = Invoker::<Bytes, Json<Digest>, Client>::new(
        invoker_client,
        hlc,
        invoker::Options::new(COMMAND_NAME, REQUEST_TOPIC),
    )
    .wrap_err("error creating invoker")?;

    let mut large = vec![0u8; args.large_payload_size];
    rand::thread_rng().fill(&mut large[..]);

    let requests = [
        ("small", Bytes::from_static(b"hello, world")),
        ("large", Bytes::from(large)),
        ("repeated", Bytes::from_static(b"hello, world")),
    ];

    let timeout = config.invoker.default_timeout();

    for (name, payload) in requests {
        let expected = checksum::calculate(&payload, checksum::ChecksumAlgorithm::Sha256);

        let response = invoker
            .invoke(
                Request::new(payload, timeout)
                    .with_topic_token("executorId", EXECUTOR_ID),
            )
            .await
            .wrap_err_with(|| format!("error invoking {name} request"))?;

        let Json(digest) = response.payload;

        if digest.sha256 != expected {
            eyre::bail!(
                "{name} request digest mismatch: expected {expected}, got {}",
                digest.sha256
            );
        }

        tracing::info!(name, len = digest.len, sha256 = digest.sha256, "request digested");
    }

    // The repeated request is answered from the cache.
    tracing::info!(
        executions = executions.load(Ordering::Relaxed),
        cached_responses = cache.len().await,
        "demo finished"
    );

    invoker.shutdown().await;
    executor.shutdown().await;
    cache.stop().await;

    Ok(())
}
