//! `fetch()`: promise registration on the main thread, blocking HTTP on a
//! worker thread, reconciliation through the event loop's completion queue.
//!
//! Worker threads never see engine handles. They receive the request data
//! and the loop's completion queue, and post back an opaque record keyed by
//! resolver id. The main thread owns the id→resolver table and re-enters
//! the originating context to settle the promise.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Read;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rquickjs::function::Opt;
use rquickjs::{
    Context, Ctx, Exception, Function, Object, Persistent, Promise, Result, Runtime, Value,
};

use super::abort::AbortSignal;
use super::request::Request;
use super::response::Response;
use crate::event_loop::{CompletedFetch, FetchResponse, LoopHandle};
use crate::utils::{rejected_promise_with, saved_promise, try_class};
use crate::RuntimeState;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RESPONSE_BYTES: u64 = 64 * 1024 * 1024;

static NEXT_RESOLVER_ID: AtomicU64 = AtomicU64::new(1);

struct PendingFetch {
    context: Context,
    runtime: Rc<Runtime>,
    resolve: Persistent<Function<'static>>,
    reject: Persistent<Function<'static>>,
    url: String,
}

thread_local! {
    static PENDING: RefCell<HashMap<u64, PendingFetch>> = RefCell::new(HashMap::new());
}

fn take_pending(resolver_id: u64) -> Option<PendingFetch> {
    PENDING.with(|pending| pending.borrow_mut().remove(&resolver_id))
}

struct OutboundRequest {
    method: String,
    url: String,
    headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
}

/// The worker-thread half: one blocking HTTP/1.1 round trip.
fn perform(request: OutboundRequest) -> std::result::Result<FetchResponse, String> {
    let mut call = ureq::request(&request.method, &request.url).timeout(FETCH_TIMEOUT);
    for (name, value) in &request.headers {
        call = call.set(name, value);
    }

    let outcome = match request.body {
        Some(body) => call.send_bytes(&body),
        None => call.call(),
    };
    let response = match outcome {
        Ok(response) => response,
        // HTTP error statuses are responses, not failures.
        Err(ureq::Error::Status(_, response)) => response,
        Err(err) => return Err(err.to_string()),
    };

    let status = response.status();
    let headers = response
        .headers_names()
        .into_iter()
        .filter_map(|name| {
            response
                .header(&name)
                .map(|value| (name.to_ascii_lowercase(), value.to_string()))
        })
        .collect();

    let mut body = Vec::new();
    response
        .into_reader()
        .take(MAX_RESPONSE_BYTES)
        .read_to_end(&mut body)
        .map_err(|e| format!("reading response body: {e}"))?;

    Ok(FetchResponse {
        status,
        headers,
        body,
    })
}

fn fetch<'js>(ctx: Ctx<'js>, input: Value<'js>, init: Opt<Object<'js>>) -> Result<Promise<'js>> {
    let state = ctx
        .userdata::<RuntimeState>()
        .map(|state| state.clone())
        .ok_or_else(|| Exception::throw_internal(&ctx, "runtime state not installed"))?;

    let request = Request::new(ctx.clone(), input, init)?;
    let url = request.target_url();
    let parsed = url::Url::parse(&url)
        .map_err(|e| Exception::throw_type(&ctx, &format!("fetch: invalid URL: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(Exception::throw_type(
            &ctx,
            &format!("fetch: unsupported scheme {:?}", parsed.scheme()),
        ));
    }

    let Some(body) = request.transport_bytes() else {
        return Err(Exception::throw_type(
            &ctx,
            "fetch: streaming request bodies are not supported",
        ));
    };

    // An already-aborted signal never reaches the network.
    let signal = match request.abort_signal() {
        Some(saved) => {
            let value = saved.restore(&ctx)?;
            try_class::<AbortSignal>(&ctx, &value)
        }
        None => None,
    };
    if let Some(signal) = &signal {
        if signal.borrow().is_aborted() {
            let reason: Value = signal.borrow().reason(ctx.clone())?;
            return rejected_promise_with(&ctx, reason);
        }
    }

    let (promise, (resolve, reject)) = saved_promise(&ctx)?;
    let resolver_id = NEXT_RESOLVER_ID.fetch_add(1, Ordering::SeqCst);
    PENDING.with(|pending| {
        pending.borrow_mut().insert(
            resolver_id,
            PendingFetch {
                context: state.context.clone(),
                runtime: state.runtime.clone(),
                resolve,
                reject,
                url: url.clone(),
            },
        )
    });

    // Abort rejects the promise right away; the worker's late completion
    // finds its resolver gone and is dropped.
    if let Some(signal) = &signal {
        let listener = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, event: Object<'js>| -> Result<()> {
                if let Some(pending) = take_pending(resolver_id) {
                    let reason: Value = event.get("reason")?;
                    pending.reject.restore(&ctx)?.call::<_, ()>((reason,))?;
                }
                Ok(())
            },
        )?;
        signal.borrow().add_native_listener(&ctx, listener);
    }

    let outbound = OutboundRequest {
        method: request.method_name(),
        url,
        headers: request.header_pairs(),
        body: (!body.is_empty()).then_some(body),
    };

    let queue = state.events.fetch_queue();
    queue.register();
    std::thread::spawn(move || {
        let result = perform(outbound);
        queue.post(CompletedFetch {
            resolver_id,
            result,
        });
    });

    Ok(promise)
}

/// Drain the loop's completion queue and settle each promise in its
/// originating context. Main thread only.
pub fn dispatch_completions(events: &LoopHandle) {
    for completion in events.drain_fetch_completions() {
        let Some(pending) = take_pending(completion.resolver_id) else {
            // Aborted while in flight.
            continue;
        };
        let PendingFetch {
            context,
            runtime,
            resolve,
            reject,
            url,
        } = pending;

        let outcome = context.with(|ctx| -> Result<()> {
            match completion.result {
                Ok(fetched) => {
                    let response = Response::from_fetch(&ctx, fetched, url)?;
                    resolve.restore(&ctx)?.call::<_, ()>((response,))?;
                }
                Err(message) => {
                    let error =
                        Exception::from_message(ctx.clone(), &format!("fetch failed: {message}"))?;
                    reject.restore(&ctx)?.call::<_, ()>((error,))?;
                }
            }
            Ok(())
        });
        if let Err(err) = outcome {
            tracing::warn!("dispatching fetch completion failed: {err}");
        }
        crate::drain_microtasks(&runtime);
    }
}

pub fn setup<'a>(ctx: &Ctx<'a>, globals: &Object<'a>) -> Result<()> {
    globals.set("fetch", Function::new(ctx.clone(), fetch)?.with_name("fetch")?)?;
    Ok(())
}
