//! The management API under `/admin/`.

use std::collections::BTreeMap;
use std::path::Path;

use nano_runtime::{HttpResponse, ResponseBody};
use serde::Deserialize;
use serde_json::json;

use super::http::ParsedRequest;
use crate::config::{resolve_record, AppConfig, Config, Defaults};
use crate::registry::Registry;

pub fn json_response(status: u16, value: &serde_json::Value) -> HttpResponse {
    HttpResponse {
        status,
        status_text: nano_runtime::reason_phrase(status),
        headers: vec![("content-type".to_string(), "application/json".to_string())],
        body: ResponseBody::Full(value.to_string().into_bytes()),
    }
}

fn error_response(status: u16, message: impl Into<String>) -> HttpResponse {
    json_response(status, &json!({ "error": message.into() }))
}

/// The POST /admin/apps document.
#[derive(Debug, Deserialize)]
struct AddAppRequest {
    hostname: String,
    path: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    memory_mb: Option<usize>,
    #[serde(default)]
    env: Option<BTreeMap<String, String>>,
    #[serde(default)]
    max_buffer_size_mb: Option<usize>,
}

pub fn handle(
    registry: &mut Registry,
    defaults: &Defaults,
    config_path: Option<&Path>,
    request: &ParsedRequest,
) -> HttpResponse {
    let (path, query) = request.path_and_query();
    match (request.method.as_str(), path) {
        ("GET", "/admin/health") => json_response(200, &json!({ "status": "ok" })),
        ("GET", "/admin/apps") => list_apps(registry),
        ("POST", "/admin/apps") => add_app(registry, defaults, &request.body),
        ("DELETE", "/admin/apps") => remove_app(registry, query),
        ("POST", "/admin/reload") => reload(registry, config_path),
        ("GET" | "POST" | "DELETE" | "PUT" | "PATCH", "/admin/apps" | "/admin/health" | "/admin/reload") => {
            error_response(405, "method not allowed")
        }
        _ => error_response(404, "unknown admin endpoint"),
    }
}

fn list_apps(registry: &Registry) -> HttpResponse {
    let apps: Vec<serde_json::Value> = registry
        .tenants()
        .map(|tenant| {
            json!({
                "hostname": tenant.hostname(),
                "path": tenant.record().path.display().to_string(),
                "memory_percent": tenant.memory_percent(),
                "timeout_ms": tenant.timeout_ms(),
            })
        })
        .collect();
    json_response(200, &json!({ "apps": apps }))
}

fn add_app(registry: &mut Registry, defaults: &Defaults, body: &[u8]) -> HttpResponse {
    let request: AddAppRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(err) => return error_response(400, format!("invalid request body: {err}")),
    };
    if request.hostname.trim().is_empty() {
        return error_response(400, "hostname must not be empty");
    }
    if request.path.trim().is_empty() {
        return error_response(400, "path must not be empty");
    }

    let app = AppConfig {
        name: request.name.unwrap_or_else(|| request.hostname.clone()),
        path: request.path,
        hostname: Some(request.hostname),
        port: None,
        timeout_ms: request.timeout_ms,
        memory_mb: request.memory_mb,
        env: request.env.unwrap_or_default(),
        max_buffer_size_mb: request.max_buffer_size_mb,
    };
    let record = resolve_record(&app, defaults);
    let hostname = record.hostname.clone();

    if registry.get(&hostname).is_some() {
        return error_response(409, format!("hostname already exists: {hostname}"));
    }
    match registry.add(record) {
        Ok(()) => json_response(201, &json!({ "hostname": hostname, "status": "loaded" })),
        Err(err) => error_response(500, format!("failed to load app: {err:#}")),
    }
}

fn remove_app(registry: &mut Registry, query: Option<&str>) -> HttpResponse {
    let hostname = query.and_then(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(name, _)| name == "hostname")
            .map(|(_, value)| value.into_owned())
    });
    let Some(hostname) = hostname else {
        return error_response(400, "missing hostname query parameter");
    };

    if registry.get(&hostname).is_none() {
        return error_response(404, format!("not found: {hostname}"));
    }
    match registry.remove(&hostname) {
        Ok(()) => json_response(200, &json!({ "hostname": hostname, "status": "draining" })),
        Err(err) => error_response(400, format!("{err:#}")),
    }
}

fn reload(registry: &mut Registry, config_path: Option<&Path>) -> HttpResponse {
    let Some(path) = config_path else {
        return error_response(400, "server was started without a config file");
    };
    let config = match Config::load(path) {
        Ok(config) => config,
        Err(err) => return error_response(400, format!("config reload failed: {err:#}")),
    };
    let summary = registry.reconcile(config.records());
    json_response(
        200,
        &json!({
            "added": summary.added,
            "removed": summary.removed,
            "kept": summary.kept,
            "failed": summary.failed,
        }),
    )
}
