//! The HTTP front end: a single-threaded accept loop that interleaves
//! connection handling with event-loop ticks, fetch-completion dispatch,
//! deferred config reloads and drain sweeps.
//!
//! Registry mutation happens only here, between request dispatches. The
//! config watcher's timer merely raises a flag; the reconcile itself runs
//! on this loop so it can never race a request spin.

pub mod admin;
pub mod http;

use std::cell::Cell;
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _};
use nano_runtime::{dispatch_completions, HttpRequest, HttpResponse, LoopHandle};
use tracing::instrument;

use crate::config::{Config, Defaults};
use crate::registry::Registry;
use crate::tenant::{TenantState, DRAIN_DEADLINE};

const ACCEPT_PARK: Duration = Duration::from_millis(10);

pub struct Server {
    port: u16,
    defaults: Defaults,
    config_path: Option<PathBuf>,
    registry: Registry,
    events: LoopHandle,
    stop: Arc<AtomicBool>,
    reload_requested: Rc<Cell<bool>>,
}

impl Server {
    /// Load every configured tenant. Individual load failures are logged
    /// and skipped; a server with zero loadable apps is a startup error.
    pub fn new(
        config: Config,
        config_path: Option<PathBuf>,
        stop: Arc<AtomicBool>,
    ) -> anyhow::Result<Self> {
        let events = LoopHandle::new();
        let mut registry = Registry::new(events.clone());

        for record in config.records() {
            let hostname = record.hostname.clone();
            if let Err(err) = registry.add(record) {
                tracing::error!(hostname = %hostname, error = %format!("{err:#}"), "failed to load app");
            }
        }
        if registry.is_empty() {
            bail!("no app could be loaded");
        }

        Ok(Self {
            port: config.port,
            defaults: config.defaults,
            config_path,
            registry,
            events,
            stop,
            reload_requested: Rc::new(Cell::new(false)),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Accept loop. Returns once a stop is requested and every tenant has
    /// drained (or the global shutdown deadline has passed).
    #[instrument(skip_all, fields(port = self.port), level = "info")]
    pub fn run(&mut self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .with_context(|| format!("Binding port {}", self.port))?;
        listener
            .set_nonblocking(true)
            .context("Setting the listener non-blocking")?;
        tracing::info!(port = self.port, apps = self.registry.len(), "serving");

        if let Some(path) = self.config_path.clone() {
            let flag = Rc::clone(&self.reload_requested);
            crate::watcher::install(&self.events, path, Box::new(move || flag.set(true)));
        }

        while !self.stop.load(Ordering::SeqCst) {
            self.events.tick();
            dispatch_completions(&self.events);
            self.registry.sweep();
            self.apply_pending_reload();

            match listener.accept() {
                Ok((stream, _addr)) => self.handle_connection(stream),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    self.events.run_once(Some(ACCEPT_PARK));
                }
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                }
            }
        }

        drop(listener);
        self.shutdown();
        Ok(())
    }

    /// Reconcile against the config file if the watcher flagged a change.
    /// Parse failures leave the registry untouched.
    fn apply_pending_reload(&mut self) {
        if !self.reload_requested.replace(false) {
            return;
        }
        let Some(path) = self.config_path.as_deref() else {
            return;
        };
        match Config::load(path) {
            Ok(config) => {
                if config.port != self.port {
                    tracing::warn!(
                        old = self.port,
                        new = config.port,
                        "port changes require a restart; keeping the old port"
                    );
                }
                let summary = self.registry.reconcile(config.records());
                tracing::info!(
                    added = summary.added,
                    removed = summary.removed,
                    kept = summary.kept,
                    failed = summary.failed,
                    "config reload applied"
                );
            }
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "config reload failed, keeping previous registry");
            }
        }
    }

    fn handle_connection(&mut self, mut stream: TcpStream) {
        let request = match http::read_request(&mut stream) {
            Ok(request) => request,
            Err(err) => {
                tracing::debug!(error = %format!("{err:#}"), "bad request");
                let response = HttpResponse::plain(400, "Bad Request");
                let _ = http::write_response(&mut stream, &response);
                return;
            }
        };

        let response = self.dispatch(&request);

        // A client that went away mid-response is logged and swallowed.
        if let Err(err) = http::write_response(&mut stream, &response) {
            tracing::debug!(error = %err, "client disconnected mid-response");
        }
    }

    fn dispatch(&mut self, request: &http::ParsedRequest) -> HttpResponse {
        let (path, _query) = request.path_and_query();
        if path == "/admin" || path.starts_with("/admin/") {
            return admin::handle(
                &mut self.registry,
                &self.defaults,
                self.config_path.as_deref(),
                request,
            );
        }

        let host = request.host().unwrap_or("").to_string();
        let Some(tenant) = self.registry.lookup_mut(&host) else {
            return HttpResponse::plain(404, "no application for this host");
        };
        if tenant.state() != TenantState::Active {
            return HttpResponse::plain(503, "Service Unavailable");
        }

        let authority = if host.is_empty() {
            "localhost".to_string()
        } else {
            host
        };
        let http_request = HttpRequest {
            method: request.method.clone(),
            url: format!("http://{authority}{}", request.path),
            headers: request.headers.clone(),
            body: request.body.clone(),
        };
        tenant.serve(http_request)
    }

    /// Mark everything draining and wait for the counters to hit zero or
    /// the global deadline to pass, then release the tenants.
    fn shutdown(&mut self) {
        tracing::info!("shutting down, draining tenants");
        self.registry.drain_all();
        let deadline = Instant::now() + DRAIN_DEADLINE;
        while !self.registry.all_drained() && Instant::now() < deadline {
            self.events.tick();
            dispatch_completions(&self.events);
            self.registry.sweep();
            std::thread::sleep(Duration::from_millis(10));
        }
        self.registry.sweep();
        tracing::info!("shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn write_app(dir: &Path, name: &str, label: &str) -> String {
        let app_dir = dir.join(name);
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(
            app_dir.join("index.js"),
            format!(
                r#"export default {{ async fetch() {{ return Response.json({{ app: "{label}" }}); }} }};"#
            ),
        )
        .unwrap();
        app_dir.to_string_lossy().into_owned()
    }

    fn test_server(dir: &Path) -> Server {
        let app_a = write_app(dir, "a", "app-a");
        let app_b = write_app(dir, "b", "app-b");
        let config = Config::from_str(&format!(
            r#"{{
                "apps": [
                    {{ "name": "a", "path": "{app_a}", "hostname": "a.local" }},
                    {{ "name": "b", "path": "{app_b}", "hostname": "b.local" }}
                ]
            }}"#
        ))
        .unwrap();
        Server::new(config, None, Arc::new(AtomicBool::new(false))).unwrap()
    }

    fn get(host: &str) -> http::ParsedRequest {
        http::ParsedRequest {
            method: "GET".to_string(),
            path: "/".to_string(),
            headers: vec![("host".to_string(), host.to_string())],
            body: Vec::new(),
        }
    }

    fn body_of(response: &HttpResponse) -> String {
        match &response.body {
            nano_runtime::ResponseBody::Full(bytes) => {
                String::from_utf8_lossy(bytes).into_owned()
            }
            nano_runtime::ResponseBody::Chunks(chunks) => chunks
                .iter()
                .map(|c| String::from_utf8_lossy(c).into_owned())
                .collect(),
        }
    }

    #[test]
    fn draining_tenant_answers_503_until_swept() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = test_server(dir.path());

        server.registry.remove("b.local").unwrap();
        let response = server.dispatch(&get("b.local"));
        assert_eq!(response.status, 503);
        assert_eq!(body_of(&response), "Service Unavailable");

        // Once the drain completes and the sweep runs, the hostname falls
        // through to the default tenant.
        server.registry.sweep();
        let response = server.dispatch(&get("b.local"));
        assert_eq!(response.status, 200);
        assert!(body_of(&response).contains("app-a"));
    }

    #[test]
    fn missing_host_header_routes_to_the_default_tenant() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = test_server(dir.path());
        let request = http::ParsedRequest {
            method: "GET".to_string(),
            path: "/".to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        };
        let response = server.dispatch(&request);
        assert_eq!(response.status, 200);
        assert!(body_of(&response).contains("app-a"));
    }

    #[test]
    fn admin_paths_bypass_host_routing() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = test_server(dir.path());
        let request = http::ParsedRequest {
            method: "GET".to_string(),
            path: "/admin/health".to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        };
        let response = server.dispatch(&request);
        assert_eq!(response.status, 200);
        assert!(body_of(&response).contains("ok"));
    }
}
