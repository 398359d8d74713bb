//! The `Request` global (Workers-style handler input).

use std::cell::RefCell;
use std::rc::Rc;

use rquickjs::class::Trace;
use rquickjs::function::Opt;
use rquickjs::{Class, Ctx, Exception, JsLifetime, Object, Persistent, Promise, Result, Value};

use super::body::{self, BodyKind, SharedBody};
use super::headers::{HeaderMap, Headers};
use crate::utils::try_class;

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct Request {
    #[qjs(skip_trace)]
    method: String,
    #[qjs(skip_trace)]
    url: String,
    #[qjs(skip_trace)]
    headers: Rc<RefCell<HeaderMap>>,
    #[qjs(skip_trace)]
    body: SharedBody,
    #[qjs(skip_trace)]
    signal: Option<Persistent<Value<'static>>>,
}

impl Request {
    /// Build the handler-facing request from a parsed HTTP request.
    pub fn from_http(
        method: String,
        url: String,
        headers: Vec<(String, String)>,
        body_bytes: Vec<u8>,
    ) -> Self {
        let kind = if body_bytes.is_empty() {
            BodyKind::None
        } else {
            BodyKind::Bytes(body_bytes)
        };
        Self {
            method,
            url,
            headers: Rc::new(RefCell::new(HeaderMap::from_pairs(headers))),
            body: body::shared(kind),
            signal: None,
        }
    }

    pub fn method_name(&self) -> String {
        self.method.clone()
    }

    pub fn target_url(&self) -> String {
        self.url.clone()
    }

    pub fn header_pairs(&self) -> Vec<(String, String)> {
        self.headers.borrow().entries().to_vec()
    }

    /// The body as transport bytes, when it is not a stream.
    pub fn transport_bytes(&self) -> Option<Vec<u8>> {
        body::bytes_for_transport(&self.body)
    }

    pub fn abort_signal(&self) -> Option<Persistent<Value<'static>>> {
        self.signal.clone()
    }
}

#[rquickjs::methods]
impl Request {
    #[qjs(constructor)]
    pub fn new<'js>(ctx: Ctx<'js>, input: Value<'js>, init: Opt<Object<'js>>) -> Result<Self> {
        let mut request = if let Some(text) = input.as_string() {
            Self {
                method: "GET".to_string(),
                url: text.to_string()?,
                headers: Rc::new(RefCell::new(HeaderMap::default())),
                body: body::shared(BodyKind::None),
                signal: None,
            }
        } else if let Some(other) = try_class::<Request>(&ctx, &input) {
            let other = other.borrow();
            Self {
                method: other.method.clone(),
                url: other.url.clone(),
                headers: Rc::new(RefCell::new(other.headers.borrow().clone())),
                body: body::shared(body::clone_kind(&other.body)),
                signal: other.signal.clone(),
            }
        } else {
            return Err(Exception::throw_type(
                &ctx,
                "Request input must be a URL string or a Request",
            ));
        };

        if let Some(init) = init.0 {
            if let Some(method) = init.get::<_, Option<String>>("method").ok().flatten() {
                request.method = method.to_ascii_uppercase();
            }
            if let Some(headers) = init.get::<_, Option<Value>>("headers").ok().flatten() {
                if !headers.is_undefined() && !headers.is_null() {
                    request.headers =
                        Rc::new(RefCell::new(HeaderMap::from_value(&ctx, &headers)?));
                }
            }
            if let Some(body_init) = init.get::<_, Option<Value>>("body").ok().flatten() {
                let (kind, content_type) = body::from_init(&ctx, body_init)?;
                if let Some(content_type) = content_type {
                    let mut headers = request.headers.borrow_mut();
                    if !headers.has("content-type") {
                        headers.set("content-type", &content_type);
                    }
                }
                request.body = body::shared(kind);
            }
            if let Some(signal) = init.get::<_, Option<Value>>("signal").ok().flatten() {
                if !signal.is_undefined() && !signal.is_null() {
                    request.signal = Some(Persistent::save(&ctx, signal));
                }
            }
        }

        Ok(request)
    }

    #[qjs(get)]
    pub fn url(&self) -> String {
        self.url.clone()
    }

    #[qjs(get)]
    pub fn method(&self) -> String {
        self.method.clone()
    }

    #[qjs(get)]
    pub fn headers(&self) -> Headers {
        Headers::from_map(Rc::clone(&self.headers))
    }

    #[qjs(get)]
    pub fn body<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        body::body_value(&ctx, &self.body)
    }

    #[qjs(get, rename = "bodyUsed")]
    pub fn body_used(&self) -> bool {
        body::is_used(&self.body)
    }

    #[qjs(get)]
    pub fn signal<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        match &self.signal {
            Some(signal) => signal.clone().restore(&ctx),
            None => Ok(Value::new_undefined(ctx.clone())),
        }
    }

    pub fn text<'js>(&self, ctx: Ctx<'js>) -> Result<Promise<'js>> {
        body::text(&ctx, &self.body)
    }

    pub fn json<'js>(&self, ctx: Ctx<'js>) -> Result<Promise<'js>> {
        body::json(&ctx, &self.body)
    }

    #[qjs(rename = "arrayBuffer")]
    pub fn array_buffer<'js>(&self, ctx: Ctx<'js>) -> Result<Promise<'js>> {
        body::array_buffer(&ctx, &self.body)
    }

    pub fn blob<'js>(&self, ctx: Ctx<'js>) -> Result<Promise<'js>> {
        body::blob(&ctx, &self.body, &self.headers)
    }

    #[qjs(rename = "formData")]
    pub fn form_data<'js>(&self, ctx: Ctx<'js>) -> Result<Promise<'js>> {
        body::form_data(&ctx, &self.body, &self.headers)
    }
}

pub fn setup(_ctx: &Ctx<'_>, globals: &Object<'_>) -> Result<()> {
    Class::<Request>::define(globals)?;
    Ok(())
}
