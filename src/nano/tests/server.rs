//! End-to-end tests over a real socket: virtual-host routing, the admin
//! API, removal draining, and streaming responses.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nano::config::Config;
use nano::server::Server;

fn free_port() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    listener.local_addr().unwrap().port()
}

fn write_app(dir: &Path, name: &str, source: &str) -> String {
    let app_dir = dir.join(name);
    std::fs::create_dir_all(&app_dir).unwrap();
    std::fs::write(app_dir.join("index.js"), source).unwrap();
    app_dir.to_string_lossy().into_owned()
}

fn json_app(name: &str) -> String {
    format!(
        r#"
        export default {{
            async fetch(request, env) {{
                return Response.json({{ app: "{name}", path: new URL(request.url).pathname }});
            }}
        }};
        "#
    )
}

struct TestServer {
    port: u16,
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl TestServer {
    fn start(config_text: String, config_dir: &Path) -> Self {
        let config_path = config_dir.join("nano.json");
        std::fs::write(&config_path, &config_text).unwrap();
        let config = Config::from_str(&config_text).unwrap();
        let port = config.port;

        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = Arc::clone(&stop);
            let config_path = config_path.clone();
            std::thread::spawn(move || {
                let mut server = Server::new(config, Some(config_path), stop).unwrap();
                server.run().unwrap();
            })
        };

        // Wait for the listener to come up.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if TcpStream::connect(("127.0.0.1", port)).is_ok() {
                break;
            }
            assert!(Instant::now() < deadline, "server did not start listening");
            std::thread::sleep(Duration::from_millis(10));
        }

        Self {
            port,
            stop,
            thread: Some(thread),
        }
    }

    fn request(&self, method: &str, path: &str, host: &str, body: Option<&str>) -> Response {
        let mut stream = TcpStream::connect(("127.0.0.1", self.port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        let body = body.unwrap_or("");
        let raw = format!(
            "{method} {path} HTTP/1.1\r\nhost: {host}\r\ncontent-length: {}\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(raw.as_bytes()).unwrap();

        let mut buffer = Vec::new();
        stream.read_to_end(&mut buffer).unwrap();
        parse_response(&buffer)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl Response {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

fn parse_response(raw: &[u8]) -> Response {
    let text = String::from_utf8_lossy(raw).into_owned();
    let (head, body) = text
        .split_once("\r\n\r\n")
        .expect("response without header terminator");
    let mut lines = head.lines();
    let status_line = lines.next().expect("missing status line");
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .expect("malformed status line")
        .parse()
        .unwrap();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(": "))
        .map(|(n, v)| (n.to_ascii_lowercase(), v.to_string()))
        .collect();

    let body = if headers
        .iter()
        .any(|(n, v)| n == "transfer-encoding" && v == "chunked")
    {
        decode_chunked(body)
    } else {
        body.to_string()
    };

    Response {
        status,
        headers,
        body,
    }
}

fn decode_chunked(raw: &str) -> String {
    let mut out = String::new();
    let mut rest = raw;
    loop {
        let Some((size_line, tail)) = rest.split_once("\r\n") else {
            break;
        };
        let size = usize::from_str_radix(size_line.trim(), 16).unwrap_or(0);
        if size == 0 {
            break;
        }
        out.push_str(&tail[..size]);
        rest = &tail[size + 2..];
    }
    out
}

fn two_app_config(dir: &Path, port: u16) -> String {
    let app_a = write_app(dir, "app-a", &json_app("app-a"));
    let app_b = write_app(dir, "app-b", &json_app("app-b"));
    format!(
        r#"{{
            "port": {port},
            "apps": [
                {{ "name": "app-a", "path": "{app_a}", "hostname": "a.local" }},
                {{ "name": "app-b", "path": "{app_b}", "hostname": "b.local" }}
            ]
        }}"#
    )
}

#[test]
fn routes_by_host_header_with_default_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(two_app_config(dir.path(), free_port()), dir.path());

    let a = server.request("GET", "/", "a.local", None);
    assert_eq!(a.status, 200);
    assert_eq!(a.json()["app"], "app-a");

    let b = server.request("GET", "/x", &format!("b.local:{}", server.port), None);
    assert_eq!(b.status, 200);
    assert_eq!(b.json()["app"], "app-b");
    assert_eq!(b.json()["path"], "/x");

    // Unknown hosts fall through to the first-inserted app.
    let unknown = server.request("GET", "/", "unknown.example", None);
    assert_eq!(unknown.status, 200);
    assert_eq!(unknown.json()["app"], "app-a");
}

#[test]
fn admin_health_list_add_and_remove() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(two_app_config(dir.path(), free_port()), dir.path());

    let health = server.request("GET", "/admin/health", "x", None);
    assert_eq!(health.status, 200);
    assert_eq!(health.json()["status"], "ok");

    let listed = server.request("GET", "/admin/apps", "x", None);
    assert_eq!(listed.status, 200);
    let apps = listed.json();
    let apps = apps["apps"].as_array().unwrap();
    assert_eq!(apps.len(), 2);
    assert_eq!(apps[0]["hostname"], "a.local");
    assert!(apps[0]["timeout_ms"].is_number());

    // Add a third app at runtime.
    let app_c = write_app(dir.path(), "app-c", &json_app("app-c"));
    let added = server.request(
        "POST",
        "/admin/apps",
        "x",
        Some(&format!(
            r#"{{ "hostname": "c.local", "path": "{app_c}" }}"#
        )),
    );
    assert_eq!(added.status, 201);
    let c = server.request("GET", "/", "c.local", None);
    assert_eq!(c.json()["app"], "app-c");

    // Conflicting hostname.
    let conflict = server.request(
        "POST",
        "/admin/apps",
        "x",
        Some(&format!(
            r#"{{ "hostname": "c.local", "path": "{app_c}" }}"#
        )),
    );
    assert_eq!(conflict.status, 409);

    // Bad request bodies.
    let invalid = server.request("POST", "/admin/apps", "x", Some("{not json"));
    assert_eq!(invalid.status, 400);
    let missing = server.request(
        "POST",
        "/admin/apps",
        "x",
        Some(r#"{ "hostname": "", "path": "/tmp/nope" }"#),
    );
    assert_eq!(missing.status, 400);

    // Nonexistent path fails the load.
    let unloadable = server.request(
        "POST",
        "/admin/apps",
        "x",
        Some(r#"{ "hostname": "d.local", "path": "/definitely/not/here" }"#),
    );
    assert_eq!(unloadable.status, 500);

    // Remove and confirm the hostname stops routing to it.
    let removed = server.request("DELETE", "/admin/apps?hostname=c.local", "x", None);
    assert_eq!(removed.status, 200);
    assert_eq!(removed.json()["status"], "draining");
    let after = server.request("GET", "/", "c.local", None);
    assert_ne!(after.json().get("app"), Some(&serde_json::json!("app-c")));

    let gone = server.request("DELETE", "/admin/apps?hostname=nope.local", "x", None);
    assert_eq!(gone.status, 404);

    let unmatched = server.request("GET", "/admin/whatever", "x", None);
    assert_eq!(unmatched.status, 404);

    let wrong_method = server.request("PUT", "/admin/apps", "x", None);
    assert_eq!(wrong_method.status, 405);
}

#[test]
fn the_last_app_is_undeletable() {
    let dir = tempfile::tempdir().unwrap();
    let app = write_app(dir.path(), "solo", &json_app("solo"));
    let port = free_port();
    let config = format!(
        r#"{{ "port": {port}, "apps": [ {{ "name": "solo", "path": "{app}", "hostname": "solo.local" }} ] }}"#
    );
    let server = TestServer::start(config, dir.path());

    let refused = server.request("DELETE", "/admin/apps?hostname=solo.local", "x", None);
    assert_eq!(refused.status, 400);
    let body = refused.json();
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("last tenant"));

    // Still serving.
    let ok = server.request("GET", "/", "solo.local", None);
    assert_eq!(ok.status, 200);
}

#[test]
fn admin_reload_reconciles_against_the_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let server = TestServer::start(two_app_config(dir.path(), port), dir.path());

    // Rewrite the config with a third app and trigger a reload.
    let app_a = dir.path().join("app-a").to_string_lossy().into_owned();
    let app_b = dir.path().join("app-b").to_string_lossy().into_owned();
    let app_c = write_app(dir.path(), "app-c", &json_app("app-c"));
    let updated = format!(
        r#"{{
            "port": {port},
            "apps": [
                {{ "name": "app-a", "path": "{app_a}", "hostname": "a.local" }},
                {{ "name": "app-b", "path": "{app_b}", "hostname": "b.local" }},
                {{ "name": "app-c", "path": "{app_c}", "hostname": "c.local" }}
            ]
        }}"#
    );
    std::fs::write(dir.path().join("nano.json"), updated).unwrap();

    let reloaded = server.request("POST", "/admin/reload", "x", None);
    assert_eq!(reloaded.status, 200);
    assert_eq!(reloaded.json()["added"], 1);
    assert_eq!(reloaded.json()["kept"], 2);

    let c = server.request("GET", "/", "c.local", None);
    assert_eq!(c.json()["app"], "app-c");
    // The previously-loaded apps kept serving throughout.
    let a = server.request("GET", "/", "a.local", None);
    assert_eq!(a.json()["app"], "app-a");
}

#[test]
fn streaming_bodies_arrive_chunked() {
    let dir = tempfile::tempdir().unwrap();
    let app = write_app(
        dir.path(),
        "streamer",
        r#"
        export default {
            async fetch(request, env) {
                const stream = new ReadableStream({
                    start(controller) {
                        controller.enqueue("chunk-one ");
                        controller.enqueue("chunk-two");
                        controller.close();
                    }
                });
                return new Response(stream);
            }
        };
        "#,
    );
    let port = free_port();
    let config = format!(
        r#"{{ "port": {port}, "apps": [ {{ "name": "streamer", "path": "{app}", "hostname": "s.local" }} ] }}"#
    );
    let server = TestServer::start(config, dir.path());

    let response = server.request("GET", "/", "s.local", None);
    assert_eq!(response.status, 200);
    assert_eq!(response.header("transfer-encoding"), Some("chunked"));
    assert_eq!(response.body, "chunk-one chunk-two");
}

/// A one-shot blocking origin the app's `fetch()` worker can reach while
/// the nano server itself is busy spinning the request.
fn spawn_origin(body: &'static str) -> (u16, std::thread::JoinHandle<()>) {
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    let thread = std::thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut discard = [0u8; 4096];
            let _ = stream.read(&mut discard);
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes());
        }
    });
    (port, thread)
}

#[test]
fn outbound_fetch_round_trips_through_a_worker_thread() {
    let (origin_port, origin_thread) = spawn_origin(r#"{"hello":"from-origin"}"#);

    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let proxy = write_app(
        dir.path(),
        "proxy",
        r#"
        export default {
            async fetch(request, env) {
                const upstream = await fetch(`http://127.0.0.1:${env.ORIGIN_PORT}/`);
                const payload = await upstream.json();
                return Response.json({ via: "proxy", upstream: payload, status: upstream.status });
            }
        };
        "#,
    );
    let config = format!(
        r#"{{
            "port": {port},
            "apps": [
                {{ "name": "proxy", "path": "{proxy}", "hostname": "proxy.local",
                   "env": {{ "ORIGIN_PORT": "{origin_port}" }} }}
            ]
        }}"#
    );
    let server = TestServer::start(config, dir.path());

    let response = server.request("GET", "/", "proxy.local", None);
    assert_eq!(response.status, 200);
    let body = response.json();
    assert_eq!(body["via"], "proxy");
    assert_eq!(body["status"], 200);
    assert_eq!(body["upstream"]["hello"], "from-origin");

    origin_thread.join().unwrap();
}

#[test]
fn stop_flag_drains_and_exits_promptly() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(two_app_config(dir.path(), free_port()), dir.path());

    let ok = server.request("GET", "/", "a.local", None);
    assert_eq!(ok.status, 200);

    let started = Instant::now();
    server.stop.store(true, Ordering::SeqCst);
    // Drop joins the server thread; it must exit well inside the drain
    // deadline since nothing is in flight.
    drop(server);
    assert!(started.elapsed() < Duration::from_secs(5));
}
