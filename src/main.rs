use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::header;
use axum::response::IntoResponse;
use clap::Parser;
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use idempotency::cache::IdempotencyCache;
use idempotency::cli::{self, Cli, Commands};
use idempotency::config::{self, Config, StoreBackend};
use idempotency::engine::DecisionEngine;
use idempotency::fingerprint::FingerprintBuilder;
use idempotency::models::BodyArgument;
use idempotency::store::{MemoryStore, RecordStore, RedisStore, TieredStore};
use idempotency::{api, jobs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "idempotency-gateway"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .expect("failed to install OpenTelemetry tracer");
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "idempotency=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .init();

    let cfg = config::load()?;
    let args = Cli::parse();

    let result = match args.command {
        Some(Commands::Serve { port }) => {
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port).await
        }
        Some(Commands::Fingerprint {
            key,
            headers,
            excludes,
            body,
        }) => print_fingerprint(&cfg, &key, cli::header_map(headers), excludes, &body),
        None => {
            let port = cfg.port;
            run_server(cfg, port).await
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

async fn run_server(cfg: Config, port: u16) -> anyhow::Result<()> {
    let store = build_store(&cfg).await?;
    let cache = IdempotencyCache::new(store, cfg.idempotency.key_prefix.clone(), cfg.idempotency.ttl);
    tracing::info!(
        backend = cache.backend(),
        ttl_secs = cfg.idempotency.ttl.as_secs(),
        header = %cfg.idempotency.header_name,
        "idempotency store ready"
    );

    let max_body_bytes = cfg.idempotency.max_body_bytes;
    let engine = Arc::new(DecisionEngine::new(cache, cfg.idempotency));

    let app = axum::Router::new()
        .route("/healthz", axum::routing::get(|| async { "ok" }))
        .route(
            "/metrics",
            axum::routing::get(metrics_handler).with_state(engine.clone()),
        )
        .merge(api::router(engine))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(request_id_middleware));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("idempotency gateway listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn build_store(cfg: &Config) -> anyhow::Result<Arc<dyn RecordStore>> {
    let store: Arc<dyn RecordStore> = match cfg.store {
        StoreBackend::Memory => {
            let local = MemoryStore::new(cfg.memory_max_entries);
            jobs::sweep::spawn(local.clone(), cfg.sweep_interval);
            Arc::new(local)
        }
        StoreBackend::Redis => {
            tracing::info!("Connecting to Redis...");
            Arc::new(RedisStore::connect(&cfg.redis_url).await?)
        }
        StoreBackend::Tiered => {
            tracing::info!("Connecting to Redis...");
            let remote = RedisStore::connect(&cfg.redis_url).await?;
            let local = MemoryStore::new(cfg.memory_max_entries);
            jobs::sweep::spawn(local.clone(), cfg.sweep_interval);
            Arc::new(TieredStore::new(local, Arc::new(remote), cfg.local_ttl))
        }
    };
    if matches!(cfg.store, StoreBackend::Memory | StoreBackend::Tiered) {
        tracing::info!(
            every_secs = cfg.sweep_interval.as_secs(),
            "Background sweep job started"
        );
    }
    Ok(store)
}

async fn metrics_handler(State(engine): State<Arc<DecisionEngine>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        engine.metrics().render(),
    )
}

fn print_fingerprint(
    cfg: &Config,
    key: &str,
    headers: axum::http::HeaderMap,
    excludes: Vec<String>,
    body: &str,
) -> anyhow::Result<()> {
    let body: Value = serde_json::from_str(body)
        .map_err(|e| anyhow::anyhow!("body must be valid JSON: {}", e))?;
    let builder = FingerprintBuilder::new(&cfg.idempotency.include_headers);
    let arguments = [BodyArgument::new("body", body).excluding(excludes)];
    println!("{}", builder.build(key, &headers, &arguments));
    Ok(())
}

/// Middleware: injects a unique X-Request-Id into every response.
async fn request_id_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let req_id = uuid::Uuid::new_v4().to_string();
    let mut resp = next.run(req).await;
    if let Ok(val) = axum::http::HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp
}
