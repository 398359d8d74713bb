//! `AbortController` / `AbortSignal`.
//!
//! `AbortSignal.timeout` is layered on in the bootstrap, composing a
//! controller with `setTimeout`.

use std::cell::RefCell;
use std::rc::Rc;

use rquickjs::class::Trace;
use rquickjs::function::Opt;
use rquickjs::{Class, Ctx, Exception, Function, JsLifetime, Object, Persistent, Result, Value};

#[derive(Default)]
pub struct SignalInner {
    aborted: bool,
    reason: Option<Persistent<Value<'static>>>,
    listeners: Vec<Persistent<Function<'static>>>,
}

pub type SharedSignal = Rc<RefCell<SignalInner>>;

/// Mark the signal aborted and dispatch the single `abort` event. A signal
/// aborts at most once; later calls are ignored.
pub fn abort_signal<'js>(
    ctx: &Ctx<'js>,
    signal: &SharedSignal,
    reason: Option<Value<'js>>,
) -> Result<()> {
    let listeners = {
        let mut inner = signal.borrow_mut();
        if inner.aborted {
            return Ok(());
        }
        inner.aborted = true;
        let reason = match reason {
            Some(reason) if !reason.is_undefined() => reason,
            _ => Exception::from_message(ctx.clone(), "The operation was aborted")?
                .into_value(),
        };
        inner.reason = Some(Persistent::save(ctx, reason));
        std::mem::take(&mut inner.listeners)
    };

    let reason = stored_reason(ctx, signal)?;
    let event = Object::new(ctx.clone())?;
    event.set("type", "abort")?;
    event.set("reason", reason)?;

    for listener in listeners {
        let listener = listener.restore(ctx)?;
        if let Err(err) = listener.call::<_, ()>((event.clone(),)) {
            let caught = ctx.catch();
            tracing::warn!(error = ?caught, "abort listener raised: {err}");
        }
    }
    Ok(())
}

fn stored_reason<'js>(ctx: &Ctx<'js>, signal: &SharedSignal) -> Result<Value<'js>> {
    match &signal.borrow().reason {
        Some(reason) => reason.clone().restore(ctx),
        None => Ok(Value::new_undefined(ctx.clone())),
    }
}

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct AbortSignal {
    #[qjs(skip_trace)]
    inner: SharedSignal,
}

impl AbortSignal {
    pub fn from_inner(inner: SharedSignal) -> Self {
        Self { inner }
    }

    pub fn shared(&self) -> SharedSignal {
        Rc::clone(&self.inner)
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.borrow().aborted
    }

    /// Register a native observer; invoked like any JS listener.
    pub fn add_native_listener<'js>(&self, ctx: &Ctx<'js>, listener: Function<'js>) {
        self.inner
            .borrow_mut()
            .listeners
            .push(Persistent::save(ctx, listener));
    }
}

#[rquickjs::methods]
impl AbortSignal {
    #[qjs(get)]
    pub fn aborted(&self) -> bool {
        self.inner.borrow().aborted
    }

    #[qjs(get)]
    pub fn reason<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        stored_reason(&ctx, &self.inner)
    }

    #[qjs(rename = "throwIfAborted")]
    pub fn throw_if_aborted(&self, ctx: Ctx<'_>) -> Result<()> {
        if self.inner.borrow().aborted {
            let reason = stored_reason(&ctx, &self.inner)?;
            return Err(ctx.throw(reason));
        }
        Ok(())
    }

    #[qjs(rename = "addEventListener")]
    pub fn add_event_listener<'js>(
        &self,
        ctx: Ctx<'js>,
        event_type: String,
        listener: Function<'js>,
    ) -> Result<()> {
        if event_type == "abort" {
            // A listener added after abort never fires, matching the
            // single-dispatch contract.
            if !self.inner.borrow().aborted {
                self.inner
                    .borrow_mut()
                    .listeners
                    .push(Persistent::save(&ctx, listener));
            }
        }
        Ok(())
    }

    #[qjs(rename = "removeEventListener")]
    pub fn remove_event_listener<'js>(
        &self,
        ctx: Ctx<'js>,
        event_type: String,
        listener: Function<'js>,
    ) -> Result<()> {
        if event_type != "abort" {
            return Ok(());
        }
        let same: Function = ctx.eval("Object.is")?;
        let stored = std::mem::take(&mut self.inner.borrow_mut().listeners);
        let mut kept = Vec::with_capacity(stored.len());
        for entry in stored {
            let current = entry.clone().restore(&ctx)?;
            let matches: bool = same.call((current, listener.clone()))?;
            if !matches {
                kept.push(entry);
            }
        }
        self.inner.borrow_mut().listeners = kept;
        Ok(())
    }
}

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct AbortController {
    #[qjs(skip_trace)]
    inner: SharedSignal,
}

#[rquickjs::methods]
impl AbortController {
    #[qjs(constructor)]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(SignalInner::default())),
        }
    }

    #[qjs(get)]
    pub fn signal(&self) -> AbortSignal {
        AbortSignal::from_inner(Rc::clone(&self.inner))
    }

    pub fn abort<'js>(&self, ctx: Ctx<'js>, reason: Opt<Value<'js>>) -> Result<()> {
        abort_signal(&ctx, &self.inner, reason.0)
    }
}

pub fn setup(_ctx: &Ctx<'_>, globals: &Object<'_>) -> Result<()> {
    Class::<AbortController>::define(globals)?;
    Class::<AbortSignal>::define(globals)?;
    Ok(())
}
