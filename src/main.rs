//! Echo service on the service runtime.
//!
//! ```text
//!   plain listener (8443)     GET /echo, POST /echo, GET /guarded/{status}
//!   rpc listener (50050)      POST /rpc/echo
//!   metrics listener (8080)   /metrics, /hystrix, /debug/vars, /healthz/{live,ready}
//! ```
//!
//! Settings come from the TOML file named by `SERVICE_RUNTIME_CONFIG`, or
//! defaults. The process exits with the shutdown outcome's code.

use std::path::Path;

use axum::{
    body::Bytes,
    extract::Path as UrlPath,
    http::StatusCode,
    middleware,
    routing::{get, post},
    Router,
};

use service_runtime::config::{self, load_settings, RuntimeConfigBuilder, RuntimeSettings};
use service_runtime::health::HealthChecks;
use service_runtime::http::middleware::{breaker_middleware, BreakerRoute};
use service_runtime::http::RequestContextExt;
use service_runtime::observability::init_logging;
use service_runtime::{RuntimeContext, ServiceRuntime, TaskGroup};

const CONFIG_ENV: &str = "SERVICE_RUNTIME_CONFIG";
const TASK_THRESHOLD: usize = 10_000;

#[tokio::main]
async fn main() {
    let settings = match std::env::var(CONFIG_ENV) {
        Ok(path) => match load_settings(Path::new(&path)) {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("failed to load {path}: {e}");
                std::process::exit(2);
            }
        },
        Err(_) => RuntimeSettings::default(),
    };
    init_logging(&settings.logging);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "service-runtime starting");

    let ctx = RuntimeContext::new(
        settings.service_name.clone(),
        TaskGroup::new(),
        settings.breaker.defaults.to_command_config(),
    );
    let health = HealthChecks::with_task_threshold(ctx.tasks().clone(), TASK_THRESHOLD);

    let built = RuntimeConfigBuilder::from_settings(settings)
        .apply(vec![
            config::with_plain_listener(echo_router(&ctx)),
            config::with_rpc_listener(|router: Router| Ok(router.route("/rpc/echo", post(echo_body)))),
            config::with_metrics_listener(health.router()),
        ])
        .and_then(|builder| builder.build());
    let config = match built {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            std::process::exit(2);
        }
    };

    let report = match ServiceRuntime::with_context(config, ctx).run().await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(error = %e, "Service failed to start");
            std::process::exit(2);
        }
    };
    std::process::exit(report.exit_code());
}

fn echo_router(ctx: &RuntimeContext) -> Router {
    let guarded = Router::new()
        .route("/guarded/{status}", get(status_of))
        .layer(middleware::from_fn_with_state(
            BreakerRoute::new(ctx.breakers().clone(), "guarded"),
            breaker_middleware,
        ));

    Router::new()
        .route("/echo", get(echo_context).post(echo_body))
        .merge(guarded)
}

async fn echo_context(request: axum::extract::Request) -> String {
    let user = request
        .context()
        .and_then(|ctx| ctx.remote_user.clone())
        .unwrap_or_else(|| "anonymous".to_string());
    format!("hello {user}, request {}\n", request.correlation_id().unwrap_or_default())
}

async fn echo_body(body: Bytes) -> Bytes {
    body
}

async fn status_of(UrlPath(status): UrlPath<u16>) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_REQUEST)
}
