//! The `Response` global.

use std::cell::RefCell;
use std::rc::Rc;

use rquickjs::class::Trace;
use rquickjs::function::Opt;
use rquickjs::prelude::IntoJs;
use rquickjs::{Class, Ctx, JsLifetime, Object, Promise, Result, Value};

use super::body::{self, BodyKind, SharedBody};
use super::headers::{HeaderMap, Headers};
use crate::event_loop::FetchResponse;

/// Reason phrase from the standard registry, with a fallback for
/// unregistered codes.
pub fn reason_phrase(status: u16) -> String {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or("Unknown")
        .to_string()
}

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct Response {
    #[qjs(skip_trace)]
    status: u16,
    #[qjs(skip_trace)]
    status_text: Option<String>,
    #[qjs(skip_trace)]
    headers: Rc<RefCell<HeaderMap>>,
    #[qjs(skip_trace)]
    body: SharedBody,
    #[qjs(skip_trace)]
    url: String,
}

impl Response {
    /// Wrap a completed outbound fetch.
    pub fn from_fetch<'js>(ctx: &Ctx<'js>, fetched: FetchResponse, url: String) -> Result<Value<'js>> {
        let kind = if fetched.body.is_empty() {
            BodyKind::None
        } else {
            BodyKind::Bytes(fetched.body)
        };
        let response = Self {
            status: fetched.status,
            status_text: None,
            headers: Rc::new(RefCell::new(HeaderMap::from_pairs(fetched.headers))),
            body: body::shared(kind),
            url,
        };
        Class::instance(ctx.clone(), response)?.into_js(ctx)
    }

    pub fn status_code(&self) -> u16 {
        self.status
    }

    pub fn status_text_value(&self) -> String {
        self.status_text
            .clone()
            .unwrap_or_else(|| reason_phrase(self.status))
    }

    pub fn header_pairs(&self) -> Vec<(String, String)> {
        self.headers.borrow().entries().to_vec()
    }

    pub fn shared_body(&self) -> SharedBody {
        Rc::clone(&self.body)
    }
}

#[rquickjs::methods]
impl Response {
    #[qjs(constructor)]
    pub fn new<'js>(
        ctx: Ctx<'js>,
        body_init: Opt<Value<'js>>,
        init: Opt<Object<'js>>,
    ) -> Result<Self> {
        let mut status = 200u16;
        let mut status_text = None;
        let mut headers = HeaderMap::default();

        if let Some(init) = init.0 {
            if let Some(code) = init.get::<_, Option<f64>>("status").ok().flatten() {
                status = code as u16;
            }
            if let Some(text) = init.get::<_, Option<String>>("statusText").ok().flatten() {
                status_text = Some(text);
            }
            if let Some(value) = init.get::<_, Option<Value>>("headers").ok().flatten() {
                if !value.is_undefined() && !value.is_null() {
                    headers = HeaderMap::from_value(&ctx, &value)?;
                }
            }
        }

        let kind = match body_init.0 {
            Some(value) => {
                let (kind, content_type) = body::from_init(&ctx, value)?;
                if let Some(content_type) = content_type {
                    if !headers.has("content-type") {
                        headers.set("content-type", &content_type);
                    }
                }
                kind
            }
            None => BodyKind::None,
        };

        Ok(Self {
            status,
            status_text,
            headers: Rc::new(RefCell::new(headers)),
            body: body::shared(kind),
            url: String::new(),
        })
    }

    /// `Response.json(value, init?)`
    #[qjs(static)]
    pub fn json<'js>(ctx: Ctx<'js>, value: Value<'js>, init: Opt<Object<'js>>) -> Result<Self> {
        let text = ctx
            .json_stringify(value)?
            .map(|s| s.to_string())
            .transpose()?
            .unwrap_or_else(|| "null".to_string());
        let response = Self::new(ctx.clone(), Opt(Some(text.into_js(&ctx)?)), init)?;
        response
            .headers
            .borrow_mut()
            .set("content-type", "application/json");
        Ok(response)
    }

    /// `Response.redirect(url, status = 302)`
    #[qjs(static)]
    pub fn redirect(url: String, status: Opt<f64>) -> Self {
        let status = status.0.map(|s| s as u16).unwrap_or(302);
        let mut headers = HeaderMap::default();
        headers.set("location", &url);
        Self {
            status,
            status_text: None,
            headers: Rc::new(RefCell::new(headers)),
            body: body::shared(BodyKind::None),
            url: String::new(),
        }
    }

    #[qjs(get)]
    pub fn status(&self) -> u16 {
        self.status
    }

    #[qjs(get)]
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    #[qjs(get, rename = "statusText")]
    pub fn status_text(&self) -> String {
        self.status_text_value()
    }

    #[qjs(get)]
    pub fn headers(&self) -> Headers {
        Headers::from_map(Rc::clone(&self.headers))
    }

    #[qjs(get)]
    pub fn url(&self) -> String {
        self.url.clone()
    }

    #[qjs(get)]
    pub fn body<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        body::body_value(&ctx, &self.body)
    }

    #[qjs(get, rename = "bodyUsed")]
    pub fn body_used(&self) -> bool {
        body::is_used(&self.body)
    }

    pub fn text<'js>(&self, ctx: Ctx<'js>) -> Result<Promise<'js>> {
        body::text(&ctx, &self.body)
    }

    #[qjs(rename = "json")]
    pub fn json_body<'js>(&self, ctx: Ctx<'js>) -> Result<Promise<'js>> {
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
    Class::<Response>::define(globals)?;
    Ok(())
}
