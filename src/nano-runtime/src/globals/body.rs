//! The polymorphic body shared by `Request`, `Response` and `Blob`
//! consumers: none, materialised bytes, form entries, or a readable stream.
//! A body is consumed at most once; a second consumer rejects with a
//! "body used" error.

use std::cell::RefCell;
use std::rc::Rc;

use rquickjs::{Class, Ctx, Function, Persistent, Promise, Result, Value};

use super::blob::{Blob, File, FormData, FormValue};
use super::headers::HeaderMap;
use super::streams;
use crate::utils::{
    as_bytes, bytes_to_array_buffer, rejected_promise, resolved_promise, try_class,
};

#[derive(Clone)]
pub enum BodyKind {
    None,
    Bytes(Vec<u8>),
    Form(Vec<(String, FormValue)>),
    Stream(Persistent<Value<'static>>),
}

pub struct Body {
    kind: BodyKind,
    used: bool,
}

pub type SharedBody = Rc<RefCell<Body>>;

pub fn shared(kind: BodyKind) -> SharedBody {
    Rc::new(RefCell::new(Body { kind, used: false }))
}

pub fn is_used(body: &SharedBody) -> bool {
    body.borrow().used
}

pub fn clone_kind(body: &SharedBody) -> BodyKind {
    body.borrow().kind.clone()
}

/// Interpret a JS body-init value. Returns the body and, when the value
/// implies one, a content type for the owning message's headers.
pub fn from_init<'js>(
    ctx: &Ctx<'js>,
    value: Value<'js>,
) -> Result<(BodyKind, Option<String>)> {
    if value.is_undefined() || value.is_null() {
        return Ok((BodyKind::None, None));
    }
    if let Some(text) = value.as_string() {
        return Ok((
            BodyKind::Bytes(text.to_string()?.into_bytes()),
            Some("text/plain;charset=UTF-8".to_string()),
        ));
    }
    if let Some(blob) = try_class::<Blob>(ctx, &value) {
        let blob = blob.borrow();
        let mime = blob.mime();
        let mime = (!mime.is_empty()).then_some(mime);
        return Ok((BodyKind::Bytes(blob.bytes()), mime));
    }
    if let Some(file) = try_class::<File>(ctx, &value) {
        return Ok((BodyKind::Bytes(file.borrow().bytes()), None));
    }
    if let Some(form) = try_class::<FormData>(ctx, &value) {
        return Ok((
            BodyKind::Form(form.borrow().snapshot()),
            Some("application/x-www-form-urlencoded".to_string()),
        ));
    }
    if let Some(stream) = try_class::<streams::ReadableStream>(ctx, &value) {
        drop(stream);
        return Ok((BodyKind::Stream(Persistent::save(ctx, value)), None));
    }
    // Typed arrays and ArrayBuffers.
    Ok((BodyKind::Bytes(as_bytes(value)?), None))
}

/// Take the body for consumption, or hand back the "body used" rejection.
fn consume<'js>(
    ctx: &Ctx<'js>,
    body: &SharedBody,
) -> Result<std::result::Result<BodyKind, Promise<'js>>> {
    let mut body = body.borrow_mut();
    if body.used {
        return Ok(Err(rejected_promise(ctx, "body used")?));
    }
    body.used = true;
    Ok(Ok(std::mem::replace(&mut body.kind, BodyKind::None)))
}

fn form_to_bytes(entries: &[(String, FormValue)]) -> Vec<u8> {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (name, value) in entries {
        match value {
            FormValue::Text(text) => serializer.append_pair(name, text),
            FormValue::File { name: file, .. } => serializer.append_pair(name, file),
        };
    }
    serializer.finish().into_bytes()
}

fn drain_with<'js>(ctx: &Ctx<'js>, helper: &str, stream: Value<'js>) -> Result<Promise<'js>> {
    let drain: Function = ctx.globals().get(helper)?;
    drain.call((stream,))
}

pub fn text<'js>(ctx: &Ctx<'js>, body: &SharedBody) -> Result<Promise<'js>> {
    match consume(ctx, body)? {
        Err(rejected) => Ok(rejected),
        Ok(BodyKind::None) => resolved_promise(ctx, String::new()),
        Ok(BodyKind::Bytes(bytes)) => {
            resolved_promise(ctx, String::from_utf8_lossy(&bytes).into_owned())
        }
        Ok(BodyKind::Form(entries)) => resolved_promise(
            ctx,
            String::from_utf8_lossy(&form_to_bytes(&entries)).into_owned(),
        ),
        Ok(BodyKind::Stream(stream)) => {
            drain_with(ctx, "__nanoDrainText", stream.restore(ctx)?)
        }
    }
}

pub fn json<'js>(ctx: &Ctx<'js>, body: &SharedBody) -> Result<Promise<'js>> {
    match consume(ctx, body)? {
        Err(rejected) => Ok(rejected),
        Ok(BodyKind::Bytes(bytes)) => {
            let parsed = ctx.json_parse(bytes)?;
            resolved_promise(ctx, parsed)
        }
        Ok(BodyKind::Form(entries)) => {
            let parsed = ctx.json_parse(form_to_bytes(&entries))?;
            resolved_promise(ctx, parsed)
        }
        Ok(BodyKind::None) => rejected_promise(ctx, "unexpected end of JSON input"),
        Ok(BodyKind::Stream(stream)) => {
            drain_with(ctx, "__nanoDrainJson", stream.restore(ctx)?)
        }
    }
}

pub fn array_buffer<'js>(ctx: &Ctx<'js>, body: &SharedBody) -> Result<Promise<'js>> {
    match consume(ctx, body)? {
        Err(rejected) => Ok(rejected),
        Ok(BodyKind::None) => resolved_promise(ctx, bytes_to_array_buffer(ctx, &[])?),
        Ok(BodyKind::Bytes(bytes)) => resolved_promise(ctx, bytes_to_array_buffer(ctx, &bytes)?),
        Ok(BodyKind::Form(entries)) => {
            resolved_promise(ctx, bytes_to_array_buffer(ctx, &form_to_bytes(&entries))?)
        }
        Ok(BodyKind::Stream(stream)) => {
            drain_with(ctx, "__nanoDrainArrayBuffer", stream.restore(ctx)?)
        }
    }
}

pub fn blob<'js>(
    ctx: &Ctx<'js>,
    body: &SharedBody,
    headers: &Rc<RefCell<HeaderMap>>,
) -> Result<Promise<'js>> {
    let mime = headers
        .borrow()
        .get("content-type")
        .unwrap_or_default();
    match consume(ctx, body)? {
        Err(rejected) => Ok(rejected),
        Ok(BodyKind::None) => {
            let blob = Class::instance(ctx.clone(), Blob::from_bytes(Vec::new(), mime))?;
            resolved_promise(ctx, blob)
        }
        Ok(BodyKind::Bytes(bytes)) => {
            let blob = Class::instance(ctx.clone(), Blob::from_bytes(bytes, mime))?;
            resolved_promise(ctx, blob)
        }
        Ok(BodyKind::Form(entries)) => {
            let blob =
                Class::instance(ctx.clone(), Blob::from_bytes(form_to_bytes(&entries), mime))?;
            resolved_promise(ctx, blob)
        }
        Ok(BodyKind::Stream(stream)) => {
            let drain: Function = ctx.globals().get("__nanoDrainBlob")?;
            drain.call((stream.restore(ctx)?, mime))
        }
    }
}

pub fn form_data<'js>(
    ctx: &Ctx<'js>,
    body: &SharedBody,
    headers: &Rc<RefCell<HeaderMap>>,
) -> Result<Promise<'js>> {
    let content_type = headers
        .borrow()
        .get("content-type")
        .unwrap_or_default();
    if content_type.starts_with("multipart/form-data") {
        return rejected_promise(ctx, "multipart/form-data bodies are not supported");
    }
    match consume(ctx, body)? {
        Err(rejected) => Ok(rejected),
        Ok(BodyKind::Form(entries)) => {
            let form = Class::instance(ctx.clone(), FormData::from_entries(entries))?;
            resolved_promise(ctx, form)
        }
        Ok(BodyKind::None) => {
            let form = Class::instance(ctx.clone(), FormData::from_entries(Vec::new()))?;
            resolved_promise(ctx, form)
        }
        Ok(BodyKind::Bytes(bytes)) => {
            let entries = url::form_urlencoded::parse(&bytes)
                .map(|(name, value)| (name.into_owned(), FormValue::Text(value.into_owned())))
                .collect();
            let form = Class::instance(ctx.clone(), FormData::from_entries(entries))?;
            resolved_promise(ctx, form)
        }
        Ok(BodyKind::Stream(_)) => {
            rejected_promise(ctx, "cannot parse a streaming body as form data")
        }
    }
}

/// The `body` getter: `null` when absent, the stream when streaming, and a
/// fresh single-chunk stream view over materialised bytes otherwise.
pub fn body_value<'js>(ctx: &Ctx<'js>, body: &SharedBody) -> Result<Value<'js>> {
    let kind = body.borrow().kind.clone();
    match kind {
        BodyKind::None => Ok(Value::new_null(ctx.clone())),
        BodyKind::Stream(stream) => stream.restore(ctx),
        BodyKind::Bytes(bytes) => streams::readable_from_bytes(ctx, bytes),
        BodyKind::Form(entries) => streams::readable_from_bytes(ctx, form_to_bytes(&entries)),
    }
}

/// Materialise a body into raw bytes without JS involvement. Streams cannot
/// be materialised synchronously and report `None`.
pub fn bytes_for_transport(body: &SharedBody) -> Option<Vec<u8>> {
    match &body.borrow().kind {
        BodyKind::None => Some(Vec::new()),
        BodyKind::Bytes(bytes) => Some(bytes.clone()),
        BodyKind::Form(entries) => Some(form_to_bytes(entries)),
        BodyKind::Stream(_) => None,
    }
}

/// The stream value, when this body is a stream.
pub fn stream_value<'js>(ctx: &Ctx<'js>, body: &SharedBody) -> Result<Option<Value<'js>>> {
    match &body.borrow().kind {
        BodyKind::Stream(stream) => Ok(Some(stream.clone().restore(ctx)?)),
        _ => Ok(None),
    }
}
