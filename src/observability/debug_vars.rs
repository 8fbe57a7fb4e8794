//! `GET /debug/vars`: process and runtime state as JSON.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::runtime::RuntimeContext;

pub fn debug_vars(ctx: &RuntimeContext) -> Value {
    let cmdline: Vec<String> = std::env::args().collect();
    json!({
        "cmdline": cmdline,
        "service": ctx.service_name(),
        "version": env!("CARGO_PKG_VERSION"),
        "pid": std::process::id(),
        "uptime_secs": ctx.uptime().as_secs_f64(),
        "tasks": ctx.tasks().count(),
        "connections": ctx.connections().snapshot(),
        "breakers": ctx.breakers().snapshot(),
    })
}

pub async fn debug_vars_handler(State(ctx): State<RuntimeContext>) -> Json<Value> {
    Json(debug_vars(&ctx))
}
