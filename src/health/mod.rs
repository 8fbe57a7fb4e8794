//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! GET …/live   → liveness checks
//! GET …/ready  → readiness checks + liveness checks
//!     → every failing check turns the status into 503
//!     → body is "{}\n" unless ?full=1 asks for per-check results
//! ```
//!
//! # Design Decisions
//! - Endpoints match on path suffix, so the router can be mounted anywhere
//!   (typically merged into the metrics listener under `/healthz`)
//! - Checks are async closures registered by name; names are unique per kind
//! - Kubernetes only reads the status code, so the body is empty by default

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::lifecycle::TaskGroup;

const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";
const LIVE_PATH: &str = "/healthz/live";
const READY_PATH: &str = "/healthz/ready";

/// Why a check failed; shown in the `?full=1` body.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct CheckFailure(pub String);

impl From<String> for CheckFailure {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for CheckFailure {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

pub type Check = Arc<dyn Fn() -> BoxFuture<'static, Result<(), CheckFailure>> + Send + Sync>;

/// Wrap an async closure as a [`Check`].
pub fn check<F, Fut>(f: F) -> Check
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), CheckFailure>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// Fails once more than `max` runtime tasks are in flight.
pub fn task_count_check(tasks: TaskGroup, max: usize) -> Check {
    check(move || {
        let count = tasks.count();
        async move {
            if count > max {
                Err(CheckFailure(format!("too many tasks ({count} > {max})")))
            } else {
                Ok(())
            }
        }
    })
}

#[derive(Default)]
struct Registered {
    liveness: BTreeMap<String, Check>,
    readiness: BTreeMap<String, Check>,
}

/// Named liveness and readiness checks.
#[derive(Clone, Default)]
pub struct HealthChecks {
    inner: Arc<RwLock<Registered>>,
}

/// Aggregated outcome of one health check run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub healthy: bool,
    pub results: BTreeMap<String, String>,
}

impl CheckReport {
    pub fn status(&self) -> StatusCode {
        if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

impl HealthChecks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks with the stock liveness check on the runtime's task count.
    pub fn with_task_threshold(tasks: TaskGroup, max: usize) -> Self {
        let checks = Self::new();
        checks.add_liveness_check("task-threshold", task_count_check(tasks, max));
        checks
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Registered> {
        self.inner.write().expect("health checks lock poisoned")
    }

    pub fn add_liveness_check(&self, name: impl Into<String>, check: Check) {
        self.write().liveness.insert(name.into(), check);
    }

    pub fn add_readiness_check(&self, name: impl Into<String>, check: Check) {
        self.write().readiness.insert(name.into(), check);
    }

    pub async fn liveness(&self) -> CheckReport {
        let checks: Vec<(String, Check)> = {
            let registered = self.inner.read().expect("health checks lock poisoned");
            clone_checks(&registered.liveness)
        };
        run_checks(checks).await
    }

    /// Readiness checks plus liveness checks.
    pub async fn readiness(&self) -> CheckReport {
        let checks: Vec<(String, Check)> = {
            let registered = self.inner.read().expect("health checks lock poisoned");
            let mut checks = clone_checks(&registered.readiness);
            checks.extend(clone_checks(&registered.liveness));
            checks
        };
        run_checks(checks).await
    }

    /// A router answering every path with the suffix-matched health handler.
    /// The standard paths are real routes so metrics label them by route.
    pub fn router(&self) -> Router {
        Router::new()
            .route(LIVE_PATH, any(health_handler))
            .route(READY_PATH, any(health_handler))
            .fallback(health_handler)
            .with_state(self.clone())
    }
}

impl std::fmt::Debug for HealthChecks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registered = self.inner.read().expect("health checks lock poisoned");
        f.debug_struct("HealthChecks")
            .field("liveness", &registered.liveness.keys().collect::<Vec<_>>())
            .field("readiness", &registered.readiness.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn clone_checks(checks: &BTreeMap<String, Check>) -> Vec<(String, Check)> {
    checks.iter().map(|(name, c)| (name.clone(), Arc::clone(c))).collect()
}

async fn run_checks(checks: Vec<(String, Check)>) -> CheckReport {
    let mut report = CheckReport {
        healthy: true,
        results: BTreeMap::new(),
    };
    for (name, check) in checks {
        match check().await {
            Ok(()) => {
                report.results.insert(name, "OK".to_string());
            }
            Err(failure) => {
                tracing::warn!(check = %name, error = %failure, "Health check failed");
                report.healthy = false;
                report.results.insert(name, failure.to_string());
            }
        }
    }
    report
}

#[derive(Debug, Default, Deserialize)]
struct HealthQuery {
    full: Option<String>,
}

async fn health_handler(
    State(checks): State<HealthChecks>,
    method: Method,
    uri: Uri,
    Query(query): Query<HealthQuery>,
) -> Response {
    let path = uri.path();
    let ready = if path.ends_with("/live") {
        false
    } else if path.ends_with("/ready") {
        true
    } else {
        return (
            StatusCode::NOT_FOUND,
            "valid health check endpoints are /healthz/live and /healthz/ready\n",
        )
            .into_response();
    };

    if method != Method::GET {
        return (StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n").into_response();
    }

    let report = if ready {
        checks.readiness().await
    } else {
        checks.liveness().await
    };

    let body = if query.full.as_deref() == Some("1") {
        full_body(&report.results)
    } else {
        "{}\n".to_string()
    };

    Response::builder()
        .status(report.status())
        .header(header::CONTENT_TYPE, JSON_CONTENT_TYPE)
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn full_body(results: &BTreeMap<String, String>) -> String {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    if results.serialize(&mut serializer).is_err() {
        return "{}\n".to_string();
    }
    out.push(b'\n');
    String::from_utf8(out).unwrap_or_else(|_| "{}\n".to_string())
}
