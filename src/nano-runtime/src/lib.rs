//! nano-runtime embeds QuickJS (via rquickjs) and provides everything one
//! hosted app needs to execute: its own engine runtime and context with the
//! web-platform globals installed, the cooperative event loop, the CPU
//! watchdog, and the request engine that binds an HTTP exchange to the app's
//! exported `fetch(request, env)` handler.

pub mod event_loop;
pub mod globals;
pub(crate) mod utils;
pub mod watchdog;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context as _};
use rquickjs::loader::{Loader, Resolver};
use rquickjs::object::Property;
use rquickjs::promise::PromiseState;
use rquickjs::{
    Class, Coerced, Context, Ctx, Function, JsLifetime, Module, Object, Persistent, Promise,
    Runtime, Value,
};
use tracing::instrument;

pub use event_loop::{CompletedFetch, FetchResponse, LoopHandle};
pub use globals::fetch::dispatch_completions;
pub use globals::response::reason_phrase;
use globals::request::Request;
use globals::response::Response;
use watchdog::Watchdog;

/// Per-context state reachable from native callbacks. Installed as context
/// userdata at app construction and removed when the app is destroyed
/// (the state holds the `Context`, so leaving it installed would keep the
/// context alive forever).
#[derive(Clone, JsLifetime)]
pub struct RuntimeState {
    pub context: Context,
    pub runtime: Rc<Runtime>,
    pub events: LoopHandle,
    pub max_stream_buffer: usize,
    /// Loop timer ids created by this context, cancelled on teardown.
    pub timers: Rc<RefCell<HashSet<u64>>>,
}

/// Resource limits for one app.
#[derive(Debug, Clone)]
pub struct AppLimits {
    pub timeout: Duration,
    pub memory_cap_bytes: usize,
    pub max_stream_buffer_bytes: usize,
}

impl Default for AppLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            memory_cap_bytes: 128 * 1024 * 1024,
            max_stream_buffer_bytes: 64 * 1024 * 1024,
        }
    }
}

/// A parsed inbound HTTP request, ready to hand to a handler.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// The body of a serialisable response: fully materialised, or the chunk
/// sequence of a drained stream (written with chunked transfer encoding).
#[derive(Debug)]
pub enum ResponseBody {
    Full(Vec<u8>),
    Chunks(Vec<Vec<u8>>),
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: ResponseBody,
}

impl HttpResponse {
    /// A plain-text response, for error paths.
    pub fn plain(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            status_text: reason_phrase(status),
            headers: vec![(
                "content-type".to_string(),
                "text/plain;charset=UTF-8".to_string(),
            )],
            body: ResponseBody::Full(body.into().into_bytes()),
        }
    }
}

enum RequestError {
    /// Deadline or watchdog expiry.
    Timeout,
    /// An uncaught JS exception or rejection, formatted for the 500 body.
    Js(String),
    /// Engine-side failure.
    Internal(String),
}

/// Run the engine's microtask queue to completion. A job that raises is
/// dropped by the engine; draining continues.
pub fn drain_microtasks(runtime: &Runtime) {
    loop {
        match runtime.execute_pending_job() {
            Ok(true) => continue,
            Ok(false) => break,
            Err(_) => {
                tracing::debug!("a queued microtask raised an uncaught exception");
                continue;
            }
        }
    }
}

/// One loaded application: an isolate (engine runtime) and context of its
/// own, the compiled `index.js` module, the persistent `default.fetch`
/// handler, and the frozen `env` object.
pub struct AppRuntime {
    handler: Persistent<Function<'static>>,
    env: Persistent<Object<'static>>,
    context: Context,
    runtime: Rc<Runtime>,
    terminate: Arc<AtomicBool>,
    events: LoopHandle,
    limits: AppLimits,
    timers: Rc<RefCell<HashSet<u64>>>,
}

impl AppRuntime {
    /// Create the isolate with the configured memory cap, install the
    /// globals, compile and evaluate `<dir>/index.js` as an ES module, and
    /// promote `default.fetch` and the env object to persistent handles.
    #[instrument(skip_all, fields(dir = %dir.display()), level = "info")]
    pub fn new(
        dir: &Path,
        env_vars: &BTreeMap<String, String>,
        limits: AppLimits,
        events: LoopHandle,
    ) -> anyhow::Result<Self> {
        let root = dir
            .canonicalize()
            .with_context(|| format!("Resolving app directory {:?}", dir))?;

        let runtime = Rc::new(Runtime::new().context("Unable to initialize the JS runtime")?);
        runtime.set_memory_limit(limits.memory_cap_bytes);
        runtime.set_max_stack_size(512 * 1024);

        let terminate = Arc::new(AtomicBool::new(false));
        {
            let terminate = Arc::clone(&terminate);
            runtime.set_interrupt_handler(Some(Box::new(move || {
                terminate.load(Ordering::SeqCst)
            })));
        }

        runtime.set_loader(AppResolver::new(root.clone()), AppLoader);

        let context = Context::full(&runtime).context("Unable to create the JS context")?;
        let timers = Rc::new(RefCell::new(HashSet::new()));
        let state = RuntimeState {
            context: context.clone(),
            runtime: Rc::clone(&runtime),
            events: events.clone(),
            max_stream_buffer: limits.max_stream_buffer_bytes,
            timers: Rc::clone(&timers),
        };

        let loaded = context.with(|ctx| -> anyhow::Result<_> {
            let Ok(None) = ctx.store_userdata(state) else {
                return Err(anyhow!("Failed to install the runtime state"));
            };
            globals::setup(&ctx).catch(&ctx)?;

            let entry = root.join("index.js");
            let source = std::fs::read_to_string(&entry)
                .with_context(|| format!("Reading app entry {:?}", entry))?;
            let entry_name = entry.to_string_lossy().replace('\\', "/");

            let module = Module::declare(ctx.clone(), entry_name, source).catch(&ctx)?;
            let (module, promise) = module.eval().catch(&ctx)?;
            promise.finish::<()>().catch(&ctx)?;

            let default: Object = module
                .get("default")
                .catch(&ctx)
                .context("the app module must have a default export")?;
            let handler: Function = default
                .get("fetch")
                .catch(&ctx)
                .context("the default export must provide a fetch handler")?;

            let env = Object::new(ctx.clone())?;
            for (key, value) in env_vars {
                env.prop(key.as_str(), Property::from(value.as_str()))?;
            }

            Ok((
                Persistent::save(&ctx, handler),
                Persistent::save(&ctx, env),
            ))
        });

        let (handler, env) = match loaded {
            Ok(parts) => parts,
            Err(err) => {
                // The userdata holds the Context; remove it so the failed
                // isolate is actually released.
                remove_state(&context);
                return Err(err);
            }
        };

        Ok(Self {
            handler,
            env,
            context,
            runtime,
            terminate,
            events,
            limits,
            timers,
        })
    }

    pub fn limits(&self) -> &AppLimits {
        &self.limits
    }

    /// Engine-reported heap usage for this app.
    pub fn memory_used_bytes(&self) -> usize {
        self.runtime.memory_usage().memory_used_size.max(0) as usize
    }

    /// Serve one request: build the `Request` object, invoke the handler,
    /// spin the event loop until the returned promise settles or the
    /// deadline expires, and materialise the `Response`.
    #[instrument(skip_all, fields(method = %request.method, url = %request.url), level = "debug")]
    pub fn handle_request(&self, request: HttpRequest) -> HttpResponse {
        let deadline = Instant::now() + self.limits.timeout;
        let watchdog = Watchdog::arm(Arc::clone(&self.terminate), self.limits.timeout);

        let outcome = self.run_handler(request, deadline);

        let timed_out = watchdog.disarm();
        let response = match outcome {
            Ok(response) => response,
            Err(RequestError::Timeout) => HttpResponse::plain(
                504,
                format!(
                    "request timed out after {} ms",
                    self.limits.timeout.as_millis()
                ),
            ),
            Err(RequestError::Js(message)) if timed_out => HttpResponse::plain(
                504,
                format!(
                    "request timed out after {} ms: {message}",
                    self.limits.timeout.as_millis()
                ),
            ),
            Err(RequestError::Js(message)) => {
                HttpResponse::plain(500, format!("handler failed: {message}"))
            }
            Err(RequestError::Internal(message)) => {
                tracing::error!(error = %message, "request engine failure");
                HttpResponse::plain(500, "internal runtime error")
            }
        };

        self.context.with(|ctx| ctx.run_gc());
        response
    }

    fn run_handler(
        &self,
        request: HttpRequest,
        deadline: Instant,
    ) -> Result<HttpResponse, RequestError> {
        let invoked = self.context.with(|ctx| -> Result<_, RequestError> {
            let handler = self
                .handler
                .clone()
                .restore(&ctx)
                .map_err(internal_error)?;
            let env = self.env.clone().restore(&ctx).map_err(internal_error)?;
            let request_object = Class::instance(
                ctx.clone(),
                Request::from_http(request.method, request.url, request.headers, request.body),
            )
            .map_err(internal_error)?;

            let result: Result<Value, rquickjs::Error> = handler.call((request_object, env));
            match result {
                Ok(value) => match value.as_promise() {
                    Some(promise) => Ok(Settled::Pending(Persistent::save(&ctx, promise.clone()))),
                    None => Ok(Settled::Value(Persistent::save(&ctx, value))),
                },
                Err(_) => {
                    let caught = ctx.catch();
                    Err(RequestError::Js(describe_exception(&ctx, caught)))
                }
            }
        })?;

        let value = match invoked {
            Settled::Value(value) => value,
            Settled::Pending(promise) => {
                spin_until_settled(&self.context, &self.runtime, &self.events, promise, deadline)?
            }
        };

        self.materialise(value, deadline)
    }

    /// Turn the settled handler value into a serialisable response,
    /// draining a stream body through a second spin when needed.
    fn materialise(
        &self,
        value: Persistent<Value<'static>>,
        deadline: Instant,
    ) -> Result<HttpResponse, RequestError> {
        enum BodyPlan {
            Ready(ResponseBody),
            Stream(Persistent<Promise<'static>>),
        }

        let (status, status_text, headers, plan) =
            self.context.with(|ctx| -> Result<_, RequestError> {
                let value = value.restore(&ctx).map_err(internal_error)?;
                let Some(response) = utils::try_class::<Response>(&ctx, &value) else {
                    return Err(RequestError::Js(
                        "the handler did not return a Response".to_string(),
                    ));
                };
                let response = response.borrow();
                let status = response.status_code();
                let status_text = response.status_text_value();
                let headers = response.header_pairs();

                let body = response.shared_body();
                let plan = match globals::body::bytes_for_transport(&body) {
                    Some(bytes) => BodyPlan::Ready(ResponseBody::Full(bytes)),
                    None => {
                        let stream = globals::body::stream_value(&ctx, &body)
                            .map_err(internal_error)?
                            .ok_or_else(|| {
                                internal_error(anyhow!("stream body without a stream"))
                            })?;
                        let collect: Function = ctx
                            .globals()
                            .get("__nanoCollectChunks")
                            .map_err(internal_error)?;
                        let promise: Promise =
                            collect.call((stream,)).map_err(internal_error)?;
                        BodyPlan::Stream(Persistent::save(&ctx, promise))
                    }
                };
                Ok((status, status_text, headers, plan))
            })?;

        let body = match plan {
            BodyPlan::Ready(body) => body,
            BodyPlan::Stream(promise) => {
                let chunks = spin_until_settled(
                    &self.context,
                    &self.runtime,
                    &self.events,
                    promise,
                    deadline,
                )?;
                self.context.with(|ctx| -> Result<_, RequestError> {
                    let chunks = chunks.restore(&ctx).map_err(internal_error)?;
                    let Some(array) = chunks.as_array() else {
                        return Err(internal_error(anyhow!("chunk collection was not an array")));
                    };
                    let mut out = Vec::with_capacity(array.len());
                    for chunk in array.iter::<Value>() {
                        let chunk = chunk.map_err(internal_error)?;
                        out.push(utils::as_bytes(chunk).map_err(internal_error)?);
                    }
                    Ok(ResponseBody::Chunks(out))
                })?
            }
        };

        Ok(HttpResponse {
            status,
            status_text,
            headers,
            body,
        })
    }
}

impl Drop for AppRuntime {
    fn drop(&mut self) {
        // Outstanding timers hold persistent callbacks and a Context clone;
        // cancelling them is their release path.
        for id in self.timers.borrow().iter() {
            self.events.cancel_timer(*id);
        }
        remove_state(&self.context);
        self.runtime.set_interrupt_handler(None);
    }
}

enum Settled {
    Value(Persistent<Value<'static>>),
    Pending(Persistent<Promise<'static>>),
}

fn remove_state(context: &Context) {
    context.with(|ctx| {
        let _ = ctx.remove_userdata::<RuntimeState>();
    });
}

fn internal_error(err: impl std::fmt::Display) -> RequestError {
    RequestError::Internal(err.to_string())
}

/// The request spin: drain microtasks, dispatch fetch completions, park in
/// the event loop while work is pending, and give up at the deadline. A
/// pending promise with no timers, no fetches and no queued jobs can never
/// settle, so that fails fast instead of burning the whole budget.
fn spin_until_settled(
    context: &Context,
    runtime: &Rc<Runtime>,
    events: &LoopHandle,
    promise: Persistent<Promise<'static>>,
    deadline: Instant,
) -> Result<Persistent<Value<'static>>, RequestError> {
    loop {
        drain_microtasks(runtime);

        let state = context.with(|ctx| -> Result<_, RequestError> {
            let promise = promise.clone().restore(&ctx).map_err(internal_error)?;
            match promise.state() {
                PromiseState::Pending => Ok(None),
                PromiseState::Resolved => {
                    let value: Value = promise.result::<Value>().and_then(|r| r.ok()).ok_or_else(
                        || internal_error(anyhow!("resolved promise had no result value")),
                    )?;
                    Ok(Some(Ok(Persistent::save(&ctx, value))))
                }
                PromiseState::Rejected => {
                    let _ = promise.result::<Value>();
                    let caught = ctx.catch();
                    Ok(Some(Err(RequestError::Js(describe_exception(
                        &ctx, caught,
                    )))))
                }
            }
        })?;

        match state {
            Some(Ok(value)) => return Ok(value),
            Some(Err(err)) => return Err(err),
            None => {}
        }

        dispatch_completions(events);

        let now = Instant::now();
        if now >= deadline {
            return Err(RequestError::Timeout);
        }
        if events.has_pending_work() {
            events.run_once(Some(deadline - now));
        } else if runtime.is_job_pending() {
            continue;
        } else {
            return Err(RequestError::Js(
                "the handler returned a promise that can never settle".to_string(),
            ));
        }
    }
}

fn describe_exception<'a>(ctx: &Ctx<'a>, value: Value<'a>) -> String {
    if value.is_error() {
        if let Some(obj) = value.as_object() {
            let message = obj
                .get::<_, Coerced<String>>("message")
                .map(|c| c.0)
                .unwrap_or_default();
            let stack = obj
                .get::<_, Coerced<String>>("stack")
                .map(|c| c.0)
                .unwrap_or_default();
            return if stack.is_empty() {
                message
            } else {
                format!("{message}\n{stack}")
            };
        }
    }
    Coerced::<String>::from_js(ctx, value)
        .map(|c| c.0)
        .unwrap_or_else(|_| "unknown error".to_string())
}

use rquickjs::FromJs;

/// A bare context for `nano eval` and the REPL: same globals, no app
/// module, short watchdog budget.
pub struct ScriptContext {
    context: Context,
    runtime: Rc<Runtime>,
    terminate: Arc<AtomicBool>,
    events: LoopHandle,
}

impl ScriptContext {
    pub fn new(events: LoopHandle) -> anyhow::Result<Self> {
        let runtime = Rc::new(Runtime::new().context("Unable to initialize the JS runtime")?);
        let terminate = Arc::new(AtomicBool::new(false));
        {
            let terminate = Arc::clone(&terminate);
            runtime.set_interrupt_handler(Some(Box::new(move || {
                terminate.load(Ordering::SeqCst)
            })));
        }
        let context = Context::full(&runtime).context("Unable to create the JS context")?;
        let state = RuntimeState {
            context: context.clone(),
            runtime: Rc::clone(&runtime),
            events: events.clone(),
            max_stream_buffer: AppLimits::default().max_stream_buffer_bytes,
            timers: Rc::new(RefCell::new(HashSet::new())),
        };
        let installed = context.with(|ctx| -> anyhow::Result<()> {
            let Ok(None) = ctx.store_userdata(state) else {
                return Err(anyhow!("Failed to install the runtime state"));
            };
            globals::setup(&ctx).catch(&ctx)
        });
        if let Err(err) = installed {
            remove_state(&context);
            return Err(err);
        }
        Ok(Self {
            context,
            runtime,
            terminate,
            events,
        })
    }

    /// Evaluate an expression under a watchdog budget and render the result
    /// as a display string. Promises are driven to settlement within the
    /// same budget.
    pub fn eval(&self, source: &str, budget: Duration) -> anyhow::Result<String> {
        let deadline = Instant::now() + budget;
        let watchdog = Watchdog::arm(Arc::clone(&self.terminate), budget);

        let evaluated = self.context.with(|ctx| -> anyhow::Result<_> {
            let value: Value = ctx.eval(source).catch(&ctx)?;
            match value.as_promise() {
                Some(promise) => Ok(Settled::Pending(Persistent::save(&ctx, promise.clone()))),
                None => Ok(Settled::Value(Persistent::save(&ctx, value))),
            }
        });

        let result = evaluated.and_then(|settled| {
            let value = match settled {
                Settled::Value(value) => {
                    drain_microtasks(&self.runtime);
                    value
                }
                Settled::Pending(promise) => spin_until_settled(
                    &self.context,
                    &self.runtime,
                    &self.events,
                    promise,
                    deadline,
                )
                .map_err(|err| match err {
                    RequestError::Timeout => anyhow!("evaluation timed out"),
                    RequestError::Js(message) => anyhow!("{message}"),
                    RequestError::Internal(message) => anyhow!("{message}"),
                })?,
            };
            self.context.with(|ctx| -> anyhow::Result<String> {
                let value = value.restore(&ctx)?;
                render_value(&ctx, value)
            })
        });

        let timed_out = watchdog.disarm();
        match result {
            Err(_) if timed_out => Err(anyhow!("evaluation timed out after {budget:?}")),
            other => other,
        }
    }
}

impl Drop for ScriptContext {
    fn drop(&mut self) {
        remove_state(&self.context);
        self.runtime.set_interrupt_handler(None);
    }
}

fn render_value<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> anyhow::Result<String> {
    if value.is_undefined() {
        return Ok("undefined".to_string());
    }
    if let Some(text) = value.as_string() {
        return Ok(format!("{:?}", text.to_string()?));
    }
    if let Ok(Some(json)) = ctx.json_stringify(value.clone()) {
        return Ok(json.to_string()?);
    }
    Ok(Coerced::<String>::from_js(ctx, value)
        .map(|c| c.0)
        .unwrap_or_else(|_| "undefined".to_string()))
}

// A resolver/loader pair for relative imports inside the app directory.
// Escapes past the app root are refused; one tenant's modules can never
// read another's.
struct AppResolver {
    root: PathBuf,
}

impl AppResolver {
    fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

impl Resolver for AppResolver {
    fn resolve(&mut self, _ctx: &Ctx<'_>, base: &str, name: &str) -> rquickjs::Result<String> {
        // quickjs uses the importing module's path as the base; imports are
        // resolved against its directory.
        let (dir, _) = base.rsplit_once('/').unwrap_or((".", ""));
        let candidate = Path::new(dir).join(name);

        let path = candidate
            .canonicalize()
            .map_err(|_| rquickjs::Error::new_resolving(base, name))?;
        if !path.starts_with(&self.root) {
            return Err(rquickjs::Error::new_resolving(base, name));
        }
        Ok(path.to_string_lossy().replace('\\', "/"))
    }
}

struct AppLoader;

impl Loader for AppLoader {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Module<'js>> {
        let source =
            std::fs::read_to_string(name).map_err(|_| rquickjs::Error::new_loading(name))?;
        Module::declare(ctx.clone(), name, source)
    }
}

pub(crate) trait CatchJsErrorExt {
    type Ok;
    fn catch(self, ctx: &Ctx<'_>) -> anyhow::Result<Self::Ok>;
}

impl<T> CatchJsErrorExt for rquickjs::Result<T> {
    type Ok = T;
    fn catch(self, ctx: &Ctx<'_>) -> anyhow::Result<T> {
        match rquickjs::CatchResultExt::catch(self, ctx) {
            Ok(value) => Ok(value),
            Err(e) => Err(anyhow!("Runtime error: {e:#?}")),
        }
    }
}
