//! WHATWG Streams: `ReadableStream`, `WritableStream`, `TransformStream`.
//!
//! The state machines live here in Rust: chunk queues with byte accounting,
//! lock flags, FIFO pending-read/-write resolver lists, and the
//! {readable, closed, errored} / {writable, closing, closed, errored}
//! transitions. The pure-composition surface (`pipeTo`, `pipeThrough`,
//! `ReadableStream.from`, async iteration, the text codec streams) is layered
//! on top in `bootstrap.js`, in terms of the reader/writer API exposed here.
//!
//! Chunks are strings or byte buffers; a chunk's size is its byte length
//! (strings measured as UTF-8). The accumulated queued bytes of a stream are
//! capped by the owning app's `max_stream_buffer_bytes` and an enqueue past
//! the ceiling errors the stream with a quota exception.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use rquickjs::class::Trace;
use rquickjs::function::{Opt, This};
use rquickjs::prelude::{FromJs, IntoJs};
use rquickjs::{
    Array, Class, Ctx, Exception, Function, JsLifetime, Object, Persistent, Promise, Result,
    TypedArray, Value,
};

use crate::utils::{
    on_settled, read_result, rejected_promise, rejected_promise_with, resolved_promise,
    saved_promise, SavedResolver,
};
use crate::RuntimeState;

const DEFAULT_HIGH_WATER_MARK: usize = 16 * 1024;
const DEFAULT_MAX_BUFFER: usize = 64 * 1024 * 1024;

/// A queued chunk. Strings round-trip as strings, anything binary as a
/// `Uint8Array`.
#[derive(Debug, Clone)]
pub enum ChunkData {
    Text(String),
    Bytes(Vec<u8>),
}

impl ChunkData {
    pub fn from_value<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> Result<Self> {
        if let Some(text) = value.as_string() {
            return Ok(ChunkData::Text(text.to_string()?));
        }
        if let Some(obj) = value.as_object() {
            if let Some(array) = obj.as_typed_array::<u8>() {
                if let Some(bytes) = array.as_bytes() {
                    return Ok(ChunkData::Bytes(bytes.to_vec()));
                }
            }
            if let Ok(buffer) = rquickjs::ArrayBuffer::from_js(ctx, value.clone()) {
                if let Some(bytes) = buffer.as_bytes() {
                    return Ok(ChunkData::Bytes(bytes.to_vec()));
                }
            }
        }
        Err(Exception::throw_type(
            ctx,
            "stream chunks must be strings or binary data",
        ))
    }

    pub fn byte_len(&self) -> usize {
        match self {
            ChunkData::Text(text) => text.len(),
            ChunkData::Bytes(bytes) => bytes.len(),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            ChunkData::Text(text) => text.into_bytes(),
            ChunkData::Bytes(bytes) => bytes,
        }
    }

    pub fn into_js<'js>(self, ctx: &Ctx<'js>) -> Result<Value<'js>> {
        match self {
            ChunkData::Text(text) => text.into_js(ctx),
            ChunkData::Bytes(bytes) => {
                TypedArray::<u8>::new(ctx.clone(), bytes)?.into_js(ctx)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Readable,
    Closed,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    Writable,
    Closing,
    Closed,
    Errored,
}

type SharedReadable = Rc<RefCell<ReadableInner>>;

pub struct ReadableInner {
    state: ReadState,
    stored_error: Option<Persistent<Value<'static>>>,
    queue: VecDeque<ChunkData>,
    queued_bytes: usize,
    high_water_mark: usize,
    max_buffer: usize,
    locked: bool,
    pulling: bool,
    started: bool,
    source: Option<Persistent<Object<'static>>>,
    pull_fn: Option<Persistent<Function<'static>>>,
    cancel_fn: Option<Persistent<Function<'static>>>,
    pending_reads: VecDeque<SavedResolver>,
    // Set once `tee()` has split this stream; enqueues are mirrored into
    // both branches instead of the local queue.
    tee: Option<TeeState>,
    // For a tee branch: back-reference used to cancel the parent once both
    // branches are cancelled.
    tee_parent: Option<(Weak<RefCell<ReadableInner>>, usize)>,
}

struct TeeState {
    branches: [SharedReadable; 2],
    cancelled: [bool; 2],
}

impl ReadableInner {
    fn new(max_buffer: usize, high_water_mark: usize) -> SharedReadable {
        Rc::new(RefCell::new(Self {
            state: ReadState::Readable,
            stored_error: None,
            queue: VecDeque::new(),
            queued_bytes: 0,
            high_water_mark,
            max_buffer,
            locked: false,
            pulling: false,
            started: false,
            source: None,
            pull_fn: None,
            cancel_fn: None,
            pending_reads: VecDeque::new(),
            tee: None,
            tee_parent: None,
        }))
    }

    fn desired_size(&self) -> Option<f64> {
        match self.state {
            ReadState::Readable => {
                Some(self.high_water_mark as f64 - self.queued_bytes as f64)
            }
            ReadState::Closed => Some(0.0),
            ReadState::Errored => None,
        }
    }
}

fn stored_reason<'js>(
    ctx: &Ctx<'js>,
    stored: &Option<Persistent<Value<'static>>>,
) -> Result<Value<'js>> {
    match stored {
        Some(reason) => reason.clone().restore(ctx),
        None => Ok(Value::new_undefined(ctx.clone())),
    }
}

/// Deliver a chunk to one inner queue: a pending read wins, otherwise the
/// chunk is queued and counted against the buffer ceiling.
fn deliver_chunk<'js>(ctx: &Ctx<'js>, inner: &SharedReadable, chunk: ChunkData) -> Result<()> {
    let waiting = inner.borrow_mut().pending_reads.pop_front();
    if let Some((resolve, _reject)) = waiting {
        let value = chunk.into_js(ctx)?;
        let result = read_result(ctx, value, false)?;
        resolve.restore(ctx)?.call::<_, ()>((result,))?;
        return Ok(());
    }

    let over_quota = {
        let mut inner = inner.borrow_mut();
        inner.queued_bytes += chunk.byte_len();
        inner.queue.push_back(chunk);
        inner.queued_bytes > inner.max_buffer
    };
    if over_quota {
        let quota = Exception::from_message(
            ctx.clone(),
            "stream buffer quota exceeded",
        )?;
        error_readable(ctx, inner, quota.clone().into_value())?;
        return Err(ctx.throw(quota.into_value()));
    }
    Ok(())
}

pub(crate) fn enqueue_readable<'js>(
    ctx: &Ctx<'js>,
    inner: &SharedReadable,
    value: Value<'js>,
) -> Result<()> {
    {
        let state = inner.borrow();
        if state.state != ReadState::Readable {
            return Err(Exception::throw_type(ctx, "cannot enqueue on a closed stream"));
        }
    }
    let chunk = ChunkData::from_value(ctx, &value)?;

    let branches = inner
        .borrow()
        .tee
        .as_ref()
        .map(|tee| [Rc::clone(&tee.branches[0]), Rc::clone(&tee.branches[1])]);
    match branches {
        Some([first, second]) => {
            // Mirror into each branch's own queue; a quota error in one
            // branch does not stop the other.
            let a = deliver_chunk(ctx, &first, chunk.clone());
            let b = deliver_chunk(ctx, &second, chunk);
            a.and(b)
        }
        None => deliver_chunk(ctx, inner, chunk),
    }
}

pub(crate) fn close_readable<'js>(ctx: &Ctx<'js>, inner: &SharedReadable) -> Result<()> {
    let (reads, branches) = {
        let mut state = inner.borrow_mut();
        if state.state != ReadState::Readable {
            return Ok(());
        }
        state.state = ReadState::Closed;
        let reads = std::mem::take(&mut state.pending_reads);
        let branches = state
            .tee
            .as_ref()
            .map(|tee| [Rc::clone(&tee.branches[0]), Rc::clone(&tee.branches[1])]);
        (reads, branches)
    };
    for (resolve, _reject) in reads {
        let result = read_result(ctx, Value::new_undefined(ctx.clone()), true)?;
        resolve.restore(ctx)?.call::<_, ()>((result,))?;
    }
    if let Some(branches) = branches {
        for branch in branches {
            close_readable(ctx, &branch)?;
        }
    }
    Ok(())
}

pub(crate) fn error_readable<'js>(
    ctx: &Ctx<'js>,
    inner: &SharedReadable,
    reason: Value<'js>,
) -> Result<()> {
    let (reads, branches) = {
        let mut state = inner.borrow_mut();
        if state.state == ReadState::Errored {
            return Ok(());
        }
        state.state = ReadState::Errored;
        state.stored_error = Some(Persistent::save(ctx, reason.clone()));
        state.queue.clear();
        state.queued_bytes = 0;
        let reads = std::mem::take(&mut state.pending_reads);
        let branches = state
            .tee
            .as_ref()
            .map(|tee| [Rc::clone(&tee.branches[0]), Rc::clone(&tee.branches[1])]);
        (reads, branches)
    };
    for (_resolve, reject) in reads {
        reject.restore(ctx)?.call::<_, ()>((reason.clone(),))?;
    }
    if let Some(branches) = branches {
        for branch in branches {
            error_readable(ctx, &branch, reason.clone())?;
        }
    }
    Ok(())
}

/// Invoke the underlying source's `pull` when the queue has drained below
/// the high-water mark. Pulls are never overlapped.
fn maybe_pull<'js>(ctx: &Ctx<'js>, inner: &SharedReadable) -> Result<()> {
    let (pull, source) = {
        let mut state = inner.borrow_mut();
        if state.pulling
            || !state.started
            || state.state != ReadState::Readable
            || state.queued_bytes >= state.high_water_mark
        {
            return Ok(());
        }
        let Some(pull) = state.pull_fn.clone() else {
            return Ok(());
        };
        state.pulling = true;
        (pull, state.source.clone())
    };

    let controller = Class::instance(
        ctx.clone(),
        ReadableStreamDefaultController {
            inner: Rc::clone(inner),
        },
    )?;
    let pull = pull.restore(ctx)?;
    let this = match source {
        Some(source) => source.restore(ctx)?,
        None => Object::new(ctx.clone())?,
    };

    let outcome: Result<Value> = pull.call((This(this), controller));
    match outcome {
        Ok(result) => {
            if let Some(promise) = result.as_promise() {
                let ok_inner = Rc::clone(inner);
                let err_inner = Rc::clone(inner);
                let on_ok = Function::new(ctx.clone(), move |ctx: Ctx| -> Result<()> {
                    ok_inner.borrow_mut().pulling = false;
                    maybe_pull(&ctx, &ok_inner)
                })?;
                let on_err = Function::new(
                    ctx.clone(),
                    move |ctx: Ctx<'js>, reason: Value<'js>| -> Result<()> {
                        err_inner.borrow_mut().pulling = false;
                        error_readable(&ctx, &err_inner, reason)
                    },
                )?;
                on_settled(promise, on_ok, on_err)?;
            } else {
                inner.borrow_mut().pulling = false;
            }
            Ok(())
        }
        Err(err) => {
            inner.borrow_mut().pulling = false;
            let reason = ctx.catch();
            error_readable(ctx, inner, reason)?;
            Err(err)
        }
    }
}

fn cancel_inner<'js>(
    ctx: &Ctx<'js>,
    inner: &SharedReadable,
    reason: Value<'js>,
) -> Result<Promise<'js>> {
    let (cancel_fn, source, parent) = {
        let mut state = inner.borrow_mut();
        state.state = ReadState::Closed;
        state.queue.clear();
        state.queued_bytes = 0;
        (
            state.cancel_fn.clone(),
            state.source.clone(),
            state.tee_parent.clone(),
        )
    };

    // Resolve outstanding reads as done.
    close_pending_reads(ctx, inner)?;

    // A tee branch cancels its parent only when the sibling is gone too.
    if let Some((parent, index)) = parent {
        if let Some(parent) = parent.upgrade() {
            let both = {
                let mut state = parent.borrow_mut();
                if let Some(tee) = state.tee.as_mut() {
                    tee.cancelled[index] = true;
                    tee.cancelled[0] && tee.cancelled[1]
                } else {
                    false
                }
            };
            if both {
                return cancel_inner(ctx, &parent, reason);
            }
        }
        return resolved_promise(ctx, Value::new_undefined(ctx.clone()));
    }

    if let Some(cancel) = cancel_fn {
        let cancel = cancel.restore(ctx)?;
        let this = match source {
            Some(source) => source.restore(ctx)?,
            None => Object::new(ctx.clone())?,
        };
        let result: Value = cancel.call((This(this), reason))?;
        if let Some(promise) = result.as_promise() {
            return Ok(promise.clone());
        }
    }
    resolved_promise(ctx, Value::new_undefined(ctx.clone()))
}

fn close_pending_reads<'js>(ctx: &Ctx<'js>, inner: &SharedReadable) -> Result<()> {
    let reads = std::mem::take(&mut inner.borrow_mut().pending_reads);
    for (resolve, _reject) in reads {
        let result = read_result(ctx, Value::new_undefined(ctx.clone()), true)?;
        resolve.restore(ctx)?.call::<_, ()>((result,))?;
    }
    Ok(())
}

fn strategy_high_water_mark(strategy: &Opt<Object<'_>>, default: usize) -> usize {
    strategy
        .0
        .as_ref()
        .and_then(|s| s.get::<_, Option<f64>>("highWaterMark").ok().flatten())
        .map(|hwm| hwm.max(0.0) as usize)
        .unwrap_or(default)
}

fn max_buffer_of(ctx: &Ctx<'_>) -> usize {
    ctx.userdata::<RuntimeState>()
        .map(|state| state.max_stream_buffer)
        .unwrap_or(DEFAULT_MAX_BUFFER)
}

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct ReadableStream {
    #[qjs(skip_trace)]
    inner: SharedReadable,
}

impl ReadableStream {
    pub fn from_inner(inner: SharedReadable) -> Self {
        Self { inner }
    }

    pub fn shared(&self) -> SharedReadable {
        Rc::clone(&self.inner)
    }
}

#[rquickjs::methods]
impl ReadableStream {
    #[qjs(constructor)]
    pub fn new<'js>(
        ctx: Ctx<'js>,
        source: Opt<Object<'js>>,
        strategy: Opt<Object<'js>>,
    ) -> Result<Self> {
        let high_water_mark = strategy_high_water_mark(&strategy, DEFAULT_HIGH_WATER_MARK);
        let inner = ReadableInner::new(max_buffer_of(&ctx), high_water_mark);

        let start_fn = if let Some(source) = source.0 {
            let start: Option<Function> = source.get("start").ok().flatten();
            let pull: Option<Function> = source.get("pull").ok().flatten();
            let cancel: Option<Function> = source.get("cancel").ok().flatten();
            {
                let mut state = inner.borrow_mut();
                state.pull_fn = pull.map(|f| Persistent::save(&ctx, f));
                state.cancel_fn = cancel.map(|f| Persistent::save(&ctx, f));
                state.source = Some(Persistent::save(&ctx, source.clone()));
            }
            start.map(|f| (f, source))
        } else {
            None
        };

        match start_fn {
            Some((start, source)) => {
                let controller = Class::instance(
                    ctx.clone(),
                    ReadableStreamDefaultController {
                        inner: Rc::clone(&inner),
                    },
                )?;
                let result: Value = start.call((This(source), controller))?;
                if let Some(promise) = result.as_promise() {
                    let ok_inner = Rc::clone(&inner);
                    let err_inner = Rc::clone(&inner);
                    let on_ok = Function::new(ctx.clone(), move |ctx: Ctx| -> Result<()> {
                        ok_inner.borrow_mut().started = true;
                        maybe_pull(&ctx, &ok_inner)
                    })?;
                    let on_err = Function::new(
                        ctx.clone(),
                        move |ctx: Ctx<'js>, reason: Value<'js>| -> Result<()> {
                            error_readable(&ctx, &err_inner, reason)
                        },
                    )?;
                    on_settled(promise, on_ok, on_err)?;
                } else {
                    inner.borrow_mut().started = true;
                    maybe_pull(&ctx, &inner)?;
                }
            }
            None => {
                inner.borrow_mut().started = true;
                maybe_pull(&ctx, &inner)?;
            }
        }

        Ok(Self { inner })
    }

    #[qjs(get)]
    pub fn locked(&self) -> bool {
        self.inner.borrow().locked
    }

    #[qjs(rename = "getReader")]
    pub fn get_reader(&self, ctx: Ctx<'_>) -> Result<ReadableStreamDefaultReader> {
        let mut state = self.inner.borrow_mut();
        if state.locked {
            return Err(Exception::throw_type(&ctx, "ReadableStream is locked"));
        }
        state.locked = true;
        Ok(ReadableStreamDefaultReader {
            inner: Rc::clone(&self.inner),
        })
    }

    pub fn cancel<'js>(&self, ctx: Ctx<'js>, reason: Opt<Value<'js>>) -> Result<Promise<'js>> {
        if self.inner.borrow().locked {
            return rejected_promise(&ctx, "cannot cancel a locked stream");
        }
        let reason = reason
            .0
            .unwrap_or_else(|| Value::new_undefined(ctx.clone()));
        cancel_inner(&ctx, &self.inner, reason)
    }

    /// Split into two independent branches; chunks already queued and every
    /// later enqueue are mirrored into both.
    pub fn tee<'js>(&self, ctx: Ctx<'js>) -> Result<Array<'js>> {
        let (first, second) = {
            let mut state = self.inner.borrow_mut();
            if state.locked {
                return Err(Exception::throw_type(&ctx, "ReadableStream is locked"));
            }
            state.locked = true;

            let first = ReadableInner::new(state.max_buffer, state.high_water_mark);
            let second = ReadableInner::new(state.max_buffer, state.high_water_mark);
            for branch in [&first, &second] {
                let mut b = branch.borrow_mut();
                b.started = true;
                b.state = state.state;
                b.queue = state.queue.clone();
                b.queued_bytes = state.queued_bytes;
                b.stored_error = state.stored_error.clone();
            }
            first.borrow_mut().tee_parent = Some((Rc::downgrade(&self.inner), 0));
            second.borrow_mut().tee_parent = Some((Rc::downgrade(&self.inner), 1));

            state.queue.clear();
            state.queued_bytes = 0;
            state.tee = Some(TeeState {
                branches: [Rc::clone(&first), Rc::clone(&second)],
                cancelled: [false, false],
            });
            (first, second)
        };

        maybe_pull(&ctx, &self.inner)?;

        let branches = Array::new(ctx.clone())?;
        branches.set(0, Class::instance(ctx.clone(), Self { inner: first })?)?;
        branches.set(1, Class::instance(ctx.clone(), Self { inner: second })?)?;
        Ok(branches)
    }
}

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct ReadableStreamDefaultController {
    #[qjs(skip_trace)]
    inner: SharedReadable,
}

#[rquickjs::methods]
impl ReadableStreamDefaultController {
    pub fn enqueue<'js>(&self, ctx: Ctx<'js>, chunk: Value<'js>) -> Result<()> {
        enqueue_readable(&ctx, &self.inner, chunk)
    }

    pub fn close(&self, ctx: Ctx<'_>) -> Result<()> {
        close_readable(&ctx, &self.inner)
    }

    pub fn error<'js>(&self, ctx: Ctx<'js>, reason: Opt<Value<'js>>) -> Result<()> {
        let reason = reason
            .0
            .unwrap_or_else(|| Value::new_undefined(ctx.clone()));
        error_readable(&ctx, &self.inner, reason)
    }

    #[qjs(get, rename = "desiredSize")]
    pub fn desired_size(&self) -> Option<f64> {
        self.inner.borrow().desired_size()
    }
}

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct ReadableStreamDefaultReader {
    #[qjs(skip_trace)]
    inner: SharedReadable,
}

#[rquickjs::methods]
impl ReadableStreamDefaultReader {
    /// Resolve with `{value, done}`. When the queue is empty and the stream
    /// is still readable the promise parks in the FIFO wait-queue and a
    /// future enqueue or close settles it in order.
    pub fn read<'js>(&self, ctx: Ctx<'js>) -> Result<Promise<'js>> {
        let next = {
            let mut state = self.inner.borrow_mut();
            match state.queue.pop_front() {
                Some(chunk) => {
                    state.queued_bytes -= chunk.byte_len();
                    Some(chunk)
                }
                None => None,
            }
        };

        if let Some(chunk) = next {
            maybe_pull(&ctx, &self.inner)?;
            let value = chunk.into_js(&ctx)?;
            let result = read_result(&ctx, value, false)?;
            return resolved_promise(&ctx, result);
        }

        let state = self.inner.borrow().state;
        match state {
            ReadState::Closed => {
                let result = read_result(&ctx, Value::new_undefined(ctx.clone()), true)?;
                resolved_promise(&ctx, result)
            }
            ReadState::Errored => {
                let reason = stored_reason(&ctx, &self.inner.borrow().stored_error)?;
                rejected_promise_with(&ctx, reason)
            }
            ReadState::Readable => {
                let (promise, resolver) = saved_promise(&ctx)?;
                self.inner.borrow_mut().pending_reads.push_back(resolver);
                maybe_pull(&ctx, &self.inner)?;
                Ok(promise)
            }
        }
    }

    pub fn cancel<'js>(&self, ctx: Ctx<'js>, reason: Opt<Value<'js>>) -> Result<Promise<'js>> {
        let reason = reason
            .0
            .unwrap_or_else(|| Value::new_undefined(ctx.clone()));
        cancel_inner(&ctx, &self.inner, reason)
    }

    #[qjs(rename = "releaseLock")]
    pub fn release_lock(&self) {
        self.inner.borrow_mut().locked = false;
    }
}

// ---------------------------------------------------------------------------
// WritableStream
// ---------------------------------------------------------------------------

type SharedWritable = Rc<RefCell<WritableInner>>;

struct QueuedWrite {
    chunk: ChunkData,
    resolver: SavedResolver,
}

pub struct WritableInner {
    state: WriteState,
    stored_error: Option<Persistent<Value<'static>>>,
    locked: bool,
    writing: bool,
    queued_bytes: usize,
    high_water_mark: usize,
    sink: Option<Persistent<Object<'static>>>,
    write_fn: Option<Persistent<Function<'static>>>,
    close_fn: Option<Persistent<Function<'static>>>,
    abort_fn: Option<Persistent<Function<'static>>>,
    queue: VecDeque<QueuedWrite>,
    ready_waiters: Vec<SavedResolver>,
    close_waiter: Option<SavedResolver>,
}

impl WritableInner {
    fn new(high_water_mark: usize) -> SharedWritable {
        Rc::new(RefCell::new(Self {
            state: WriteState::Writable,
            stored_error: None,
            locked: false,
            writing: false,
            queued_bytes: 0,
            high_water_mark,
            sink: None,
            write_fn: None,
            close_fn: None,
            abort_fn: None,
            queue: VecDeque::new(),
            ready_waiters: Vec::new(),
            close_waiter: None,
        }))
    }
}

fn sink_this<'js>(
    ctx: &Ctx<'js>,
    sink: &Option<Persistent<Object<'static>>>,
) -> Result<Object<'js>> {
    match sink {
        Some(sink) => sink.clone().restore(ctx),
        None => Object::new(ctx.clone()),
    }
}

pub(crate) fn error_writable<'js>(
    ctx: &Ctx<'js>,
    inner: &SharedWritable,
    reason: Value<'js>,
) -> Result<()> {
    let (writes, ready, close) = {
        let mut state = inner.borrow_mut();
        if state.state == WriteState::Errored {
            return Ok(());
        }
        state.state = WriteState::Errored;
        state.stored_error = Some(Persistent::save(ctx, reason.clone()));
        state.queued_bytes = 0;
        (
            std::mem::take(&mut state.queue),
            std::mem::take(&mut state.ready_waiters),
            state.close_waiter.take(),
        )
    };
    for write in writes {
        let (_resolve, reject) = write.resolver;
        reject.restore(ctx)?.call::<_, ()>((reason.clone(),))?;
    }
    for (_resolve, reject) in ready {
        reject.restore(ctx)?.call::<_, ()>((reason.clone(),))?;
    }
    if let Some((_resolve, reject)) = close {
        reject.restore(ctx)?.call::<_, ()>((reason.clone(),))?;
    }
    Ok(())
}

fn notify_ready<'js>(ctx: &Ctx<'js>, inner: &SharedWritable) -> Result<()> {
    let waiters = {
        let mut state = inner.borrow_mut();
        if state.state == WriteState::Writable && state.queued_bytes < state.high_water_mark {
            std::mem::take(&mut state.ready_waiters)
        } else {
            Vec::new()
        }
    };
    for (resolve, _reject) in waiters {
        resolve
            .restore(ctx)?
            .call::<_, ()>((Value::new_undefined(ctx.clone()),))?;
    }
    Ok(())
}

/// Advance the write queue. Serialises sink writes: when `sink.write`
/// returns a promise, subsequent writes wait on it.
fn process_writes<'js>(ctx: &Ctx<'js>, inner: &SharedWritable) -> Result<()> {
    loop {
        let action = {
            let mut state = inner.borrow_mut();
            if state.writing || state.state == WriteState::Errored {
                return Ok(());
            }
            match state.queue.pop_front() {
                Some(write) => {
                    state.queued_bytes -= write.chunk.byte_len();
                    let write_fn = state.write_fn.clone();
                    let sink = state.sink.clone();
                    Some((write, write_fn, sink))
                }
                None => {
                    if state.state == WriteState::Closing {
                        state.state = WriteState::Closed;
                        let close_fn = state.close_fn.clone();
                        let sink = state.sink.clone();
                        let waiter = state.close_waiter.take();
                        drop(state);
                        if let Some(close_fn) = close_fn {
                            let close_fn = close_fn.restore(ctx)?;
                            let this = sink_this(ctx, &sink)?;
                            let _: Value = close_fn.call((This(this),))?;
                        }
                        if let Some((resolve, _reject)) = waiter {
                            resolve
                                .restore(ctx)?
                                .call::<_, ()>((Value::new_undefined(ctx.clone()),))?;
                        }
                    }
                    return Ok(());
                }
            }
        };

        let Some((write, write_fn, sink)) = action else {
            return Ok(());
        };
        let QueuedWrite { chunk, resolver } = write;
        let (resolve, reject) = resolver;

        match write_fn {
            None => {
                resolve
                    .restore(ctx)?
                    .call::<_, ()>((Value::new_undefined(ctx.clone()),))?;
                notify_ready(ctx, inner)?;
            }
            Some(write_fn) => {
                let write_fn = write_fn.restore(ctx)?;
                let this = sink_this(ctx, &sink)?;
                let controller = Class::instance(
                    ctx.clone(),
                    WritableStreamDefaultController {
                        inner: Rc::clone(inner),
                    },
                )?;
                let chunk_value = chunk.into_js(ctx)?;
                let outcome: Result<Value> = write_fn.call((This(this), chunk_value, controller));
                match outcome {
                    Ok(result) => {
                        if let Some(promise) = result.as_promise() {
                            inner.borrow_mut().writing = true;
                            let ok_inner = Rc::clone(inner);
                            let err_inner = Rc::clone(inner);
                            let on_ok =
                                Function::new(ctx.clone(), move |ctx: Ctx| -> Result<()> {
                                    ok_inner.borrow_mut().writing = false;
                                    resolve
                                        .clone()
                                        .restore(&ctx)?
                                        .call::<_, ()>((Value::new_undefined(ctx.clone()),))?;
                                    notify_ready(&ctx, &ok_inner)?;
                                    process_writes(&ctx, &ok_inner)
                                })?;
                            let on_err = Function::new(
                                ctx.clone(),
                                move |ctx: Ctx<'js>, reason: Value<'js>| -> Result<()> {
                                    err_inner.borrow_mut().writing = false;
                                    reject
                                        .clone()
                                        .restore(&ctx)?
                                        .call::<_, ()>((reason.clone(),))?;
                                    error_writable(&ctx, &err_inner, reason)
                                },
                            )?;
                            on_settled(promise, on_ok, on_err)?;
                            return Ok(());
                        }
                        resolve
                            .restore(ctx)?
                            .call::<_, ()>((Value::new_undefined(ctx.clone()),))?;
                        notify_ready(ctx, inner)?;
                    }
                    Err(err) => {
                        let reason = ctx.catch();
                        reject.restore(ctx)?.call::<_, ()>((reason.clone(),))?;
                        error_writable(ctx, inner, reason)?;
                        return Err(err);
                    }
                }
            }
        }
    }
}

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct WritableStream {
    #[qjs(skip_trace)]
    inner: SharedWritable,
}

impl WritableStream {
    pub fn from_parts<'js>(
        ctx: &Ctx<'js>,
        sink: Option<Object<'js>>,
        high_water_mark: usize,
    ) -> Result<Self> {
        let inner = WritableInner::new(high_water_mark);
        if let Some(sink) = sink {
            let start: Option<Function> = sink.get("start").ok().flatten();
            let write: Option<Function> = sink.get("write").ok().flatten();
            let close: Option<Function> = sink.get("close").ok().flatten();
            let abort: Option<Function> = sink.get("abort").ok().flatten();
            {
                let mut state = inner.borrow_mut();
                state.write_fn = write.map(|f| Persistent::save(ctx, f));
                state.close_fn = close.map(|f| Persistent::save(ctx, f));
                state.abort_fn = abort.map(|f| Persistent::save(ctx, f));
                state.sink = Some(Persistent::save(ctx, sink.clone()));
            }
            if let Some(start) = start {
                let controller = Class::instance(
                    ctx.clone(),
                    WritableStreamDefaultController {
                        inner: Rc::clone(&inner),
                    },
                )?;
                let _: Value = start.call((This(sink), controller))?;
            }
        }
        Ok(Self { inner })
    }

    pub fn shared(&self) -> SharedWritable {
        Rc::clone(&self.inner)
    }
}

#[rquickjs::methods]
impl WritableStream {
    #[qjs(constructor)]
    pub fn new<'js>(
        ctx: Ctx<'js>,
        sink: Opt<Object<'js>>,
        strategy: Opt<Object<'js>>,
    ) -> Result<Self> {
        let high_water_mark = strategy_high_water_mark(&strategy, DEFAULT_HIGH_WATER_MARK);
        Self::from_parts(&ctx, sink.0, high_water_mark)
    }

    #[qjs(get)]
    pub fn locked(&self) -> bool {
        self.inner.borrow().locked
    }

    #[qjs(rename = "getWriter")]
    pub fn get_writer(&self, ctx: Ctx<'_>) -> Result<WritableStreamDefaultWriter> {
        let mut state = self.inner.borrow_mut();
        if state.locked {
            return Err(Exception::throw_type(&ctx, "WritableStream is locked"));
        }
        state.locked = true;
        Ok(WritableStreamDefaultWriter {
            inner: Rc::clone(&self.inner),
        })
    }

    pub fn abort<'js>(&self, ctx: Ctx<'js>, reason: Opt<Value<'js>>) -> Result<Promise<'js>> {
        let reason = reason
            .0
            .unwrap_or_else(|| Value::new_undefined(ctx.clone()));
        abort_writable(&ctx, &self.inner, reason)
    }
}

fn abort_writable<'js>(
    ctx: &Ctx<'js>,
    inner: &SharedWritable,
    reason: Value<'js>,
) -> Result<Promise<'js>> {
    let (abort_fn, sink) = {
        let state = inner.borrow();
        (state.abort_fn.clone(), state.sink.clone())
    };
    error_writable(ctx, inner, reason.clone())?;
    if let Some(abort_fn) = abort_fn {
        let abort_fn = abort_fn.restore(ctx)?;
        let this = sink_this(ctx, &sink)?;
        let _: Value = abort_fn.call((This(this), reason))?;
    }
    resolved_promise(ctx, Value::new_undefined(ctx.clone()))
}

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct WritableStreamDefaultController {
    #[qjs(skip_trace)]
    inner: SharedWritable,
}

#[rquickjs::methods]
impl WritableStreamDefaultController {
    pub fn error<'js>(&self, ctx: Ctx<'js>, reason: Opt<Value<'js>>) -> Result<()> {
        let reason = reason
            .0
            .unwrap_or_else(|| Value::new_undefined(ctx.clone()));
        error_writable(&ctx, &self.inner, reason)
    }
}

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct WritableStreamDefaultWriter {
    #[qjs(skip_trace)]
    inner: SharedWritable,
}

#[rquickjs::methods]
impl WritableStreamDefaultWriter {
    pub fn write<'js>(&self, ctx: Ctx<'js>, chunk: Value<'js>) -> Result<Promise<'js>> {
        {
            let state = self.inner.borrow();
            match state.state {
                WriteState::Errored => {
                    let reason = stored_reason(&ctx, &state.stored_error)?;
                    drop(state);
                    return rejected_promise_with(&ctx, reason);
                }
                WriteState::Closing | WriteState::Closed => {
                    drop(state);
                    return rejected_promise(&ctx, "cannot write to a closing stream");
                }
                WriteState::Writable => {}
            }
        }
        let chunk = ChunkData::from_value(&ctx, &chunk)?;
        let (promise, resolver) = saved_promise(&ctx)?;
        {
            let mut state = self.inner.borrow_mut();
            state.queued_bytes += chunk.byte_len();
            state.queue.push_back(QueuedWrite { chunk, resolver });
        }
        process_writes(&ctx, &self.inner)?;
        Ok(promise)
    }

    /// Resolves when the stream is willing to accept more data.
    #[qjs(get)]
    pub fn ready<'js>(&self, ctx: Ctx<'js>) -> Result<Promise<'js>> {
        let state = self.inner.borrow();
        match state.state {
            WriteState::Errored => {
                let reason = stored_reason(&ctx, &state.stored_error)?;
                drop(state);
                rejected_promise_with(&ctx, reason)
            }
            _ if state.queued_bytes < state.high_water_mark => {
                drop(state);
                resolved_promise(&ctx, Value::new_undefined(ctx.clone()))
            }
            _ => {
                drop(state);
                let (promise, resolver) = saved_promise(&ctx)?;
                self.inner.borrow_mut().ready_waiters.push(resolver);
                Ok(promise)
            }
        }
    }

    pub fn close<'js>(&self, ctx: Ctx<'js>) -> Result<Promise<'js>> {
        {
            let state = self.inner.borrow();
            match state.state {
                WriteState::Errored => {
                    let reason = stored_reason(&ctx, &state.stored_error)?;
                    drop(state);
                    return rejected_promise_with(&ctx, reason);
                }
                WriteState::Closing | WriteState::Closed => {
                    drop(state);
                    return rejected_promise(&ctx, "stream is already closing");
                }
                WriteState::Writable => {}
            }
        }
        let (promise, resolver) = saved_promise(&ctx)?;
        {
            let mut state = self.inner.borrow_mut();
            state.state = WriteState::Closing;
            state.close_waiter = Some(resolver);
        }
        process_writes(&ctx, &self.inner)?;
        Ok(promise)
    }

    pub fn abort<'js>(&self, ctx: Ctx<'js>, reason: Opt<Value<'js>>) -> Result<Promise<'js>> {
        let reason = reason
            .0
            .unwrap_or_else(|| Value::new_undefined(ctx.clone()));
        abort_writable(&ctx, &self.inner, reason)
    }

    #[qjs(rename = "releaseLock")]
    pub fn release_lock(&self) {
        self.inner.borrow_mut().locked = false;
    }

    #[qjs(get, rename = "desiredSize")]
    pub fn desired_size(&self) -> Option<f64> {
        let state = self.inner.borrow();
        match state.state {
            WriteState::Writable | WriteState::Closing => {
                Some(state.high_water_mark as f64 - state.queued_bytes as f64)
            }
            WriteState::Closed => Some(0.0),
            WriteState::Errored => None,
        }
    }
}

// ---------------------------------------------------------------------------
// TransformStream
// ---------------------------------------------------------------------------

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct TransformStreamDefaultController {
    #[qjs(skip_trace)]
    readable: SharedReadable,
}

#[rquickjs::methods]
impl TransformStreamDefaultController {
    pub fn enqueue<'js>(&self, ctx: Ctx<'js>, chunk: Value<'js>) -> Result<()> {
        enqueue_readable(&ctx, &self.readable, chunk)
    }

    pub fn error<'js>(&self, ctx: Ctx<'js>, reason: Opt<Value<'js>>) -> Result<()> {
        let reason = reason
            .0
            .unwrap_or_else(|| Value::new_undefined(ctx.clone()));
        error_readable(&ctx, &self.readable, reason)
    }

    pub fn terminate(&self, ctx: Ctx<'_>) -> Result<()> {
        close_readable(&ctx, &self.readable)
    }

    #[qjs(get, rename = "desiredSize")]
    pub fn desired_size(&self) -> Option<f64> {
        self.readable.borrow().desired_size()
    }
}

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct TransformStream {
    #[qjs(skip_trace)]
    readable: Persistent<Value<'static>>,
    #[qjs(skip_trace)]
    writable: Persistent<Value<'static>>,
}

#[rquickjs::methods]
impl TransformStream {
    #[qjs(constructor)]
    pub fn new<'js>(
        ctx: Ctx<'js>,
        transformer: Opt<Object<'js>>,
        writable_strategy: Opt<Object<'js>>,
        readable_strategy: Opt<Object<'js>>,
    ) -> Result<Self> {
        let readable_hwm = strategy_high_water_mark(&readable_strategy, DEFAULT_HIGH_WATER_MARK);
        let writable_hwm = strategy_high_water_mark(&writable_strategy, DEFAULT_HIGH_WATER_MARK);

        let readable_inner = ReadableInner::new(max_buffer_of(&ctx), readable_hwm);
        readable_inner.borrow_mut().started = true;
        let readable = ReadableStream::from_inner(Rc::clone(&readable_inner));

        let transform_fn: Option<Persistent<Function<'static>>> = transformer
            .0
            .as_ref()
            .and_then(|t| t.get::<_, Option<Function>>("transform").ok().flatten())
            .map(|f| Persistent::save(&ctx, f));
        let flush_fn: Option<Persistent<Function<'static>>> = transformer
            .0
            .as_ref()
            .and_then(|t| t.get::<_, Option<Function>>("flush").ok().flatten())
            .map(|f| Persistent::save(&ctx, f));
        let transformer_obj: Option<Persistent<Object<'static>>> =
            transformer.0.map(|t| Persistent::save(&ctx, t));

        // The returned Value must share the Ctx argument's lifetime; the
        // closure's signature is pinned the way the engine expects it.
        fn coerce_sink_signature<F>(f: F) -> F
        where
            F: for<'a> Fn(Ctx<'a>, Value<'a>) -> Result<Value<'a>>,
        {
            f
        }

        // The writable side's sink is native: each accepted chunk either
        // runs the transformer or passes straight through into the readable
        // queue.
        let write_sink = {
            let readable_inner = Rc::clone(&readable_inner);
            let transform_fn = transform_fn.clone();
            let transformer_obj = transformer_obj.clone();
            Function::new(
                ctx.clone(),
                coerce_sink_signature(move |ctx: Ctx, chunk: Value| -> Result<Value> {
                    let controller = Class::instance(
                        ctx.clone(),
                        TransformStreamDefaultController {
                            readable: Rc::clone(&readable_inner),
                        },
                    )?;
                    match &transform_fn {
                        Some(transform) => {
                            let transform = transform.clone().restore(&ctx)?;
                            let this = match &transformer_obj {
                                Some(obj) => obj.clone().restore(&ctx)?,
                                None => Object::new(ctx.clone())?,
                            };
                            transform.call((This(this), chunk, controller))
                        }
                        None => {
                            enqueue_readable(&ctx, &readable_inner, chunk)?;
                            Ok(Value::new_undefined(ctx.clone()))
                        }
                    }
                }),
            )?
        };

        let close_sink = {
            let readable_inner = Rc::clone(&readable_inner);
            let flush_fn = flush_fn.clone();
            let transformer_obj = transformer_obj.clone();
            Function::new(ctx.clone(), move |ctx: Ctx| -> Result<()> {
                if let Some(flush) = &flush_fn {
                    let flush = flush.clone().restore(&ctx)?;
                    let this = match &transformer_obj {
                        Some(obj) => obj.clone().restore(&ctx)?,
                        None => Object::new(ctx.clone())?,
                    };
                    let controller = Class::instance(
                        ctx.clone(),
                        TransformStreamDefaultController {
                            readable: Rc::clone(&readable_inner),
                        },
                    )?;
                    let _: Value = flush.call((This(this), controller))?;
                }
                close_readable(&ctx, &readable_inner)
            })?
        };

        let abort_sink = {
            let readable_inner = Rc::clone(&readable_inner);
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, reason: Value<'js>| -> Result<()> {
                    error_readable(&ctx, &readable_inner, reason)
                },
            )?
        };

        let writable = WritableStream::from_parts(&ctx, None, writable_hwm)?;
        {
            let mut state = writable.inner.borrow_mut();
            state.write_fn = Some(Persistent::save(&ctx, write_sink));
            state.close_fn = Some(Persistent::save(&ctx, close_sink));
            state.abort_fn = Some(Persistent::save(&ctx, abort_sink));
        }

        let readable_value = Class::instance(ctx.clone(), readable)?.into_js(&ctx)?;
        let writable_value = Class::instance(ctx.clone(), writable)?.into_js(&ctx)?;
        Ok(Self {
            readable: Persistent::save(&ctx, readable_value),
            writable: Persistent::save(&ctx, writable_value),
        })
    }

    #[qjs(get)]
    pub fn readable<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        self.readable.clone().restore(&ctx)
    }

    #[qjs(get)]
    pub fn writable<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        self.writable.clone().restore(&ctx)
    }
}

/// A closed-after-one-chunk stream over a byte buffer (`Blob.stream()`,
/// materialised bodies).
pub fn readable_from_bytes<'js>(ctx: &Ctx<'js>, bytes: Vec<u8>) -> Result<Value<'js>> {
    let inner = ReadableInner::new(max_buffer_of(ctx).max(bytes.len()), DEFAULT_HIGH_WATER_MARK);
    {
        let mut state = inner.borrow_mut();
        state.started = true;
        state.state = ReadState::Closed;
        if !bytes.is_empty() {
            state.queued_bytes = bytes.len();
            state.queue.push_back(ChunkData::Bytes(bytes));
        }
    }
    Class::instance(ctx.clone(), ReadableStream::from_inner(inner))?.into_js(ctx)
}

pub fn setup(_ctx: &Ctx<'_>, globals: &Object<'_>) -> Result<()> {
    Class::<ReadableStream>::define(globals)?;
    Class::<WritableStream>::define(globals)?;
    Class::<TransformStream>::define(globals)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_sizes_are_byte_lengths() {
        assert_eq!(ChunkData::Text("héllo".into()).byte_len(), 6);
        assert_eq!(ChunkData::Bytes(vec![0; 42]).byte_len(), 42);
    }

    #[test]
    fn chunk_into_bytes_encodes_text_as_utf8() {
        assert_eq!(ChunkData::Text("hé".into()).into_bytes(), vec![0x68, 0xc3, 0xa9]);
    }
}
