//! `Blob`, `File` and `FormData` globals.

use std::cell::RefCell;
use std::rc::Rc;

use rquickjs::class::Trace;
use rquickjs::function::Opt;
use rquickjs::{Array, Class, Ctx, Exception, JsLifetime, Object, Result, Value};

use crate::utils::{as_bytes, bytes_to_array_buffer, resolved_promise, try_class};

fn blob_parts_to_bytes<'js>(ctx: &Ctx<'js>, parts: &Value<'js>) -> Result<Vec<u8>> {
    let Some(array) = parts.as_array() else {
        return Err(Exception::throw_type(ctx, "Blob parts must be a sequence"));
    };
    let mut data = Vec::new();
    for part in array.iter::<Value>() {
        let part = part?;
        if let Some(blob) = try_class::<Blob>(ctx, &part) {
            data.extend_from_slice(&blob.borrow().inner.borrow().data);
        } else if let Some(file) = try_class::<File>(ctx, &part) {
            data.extend_from_slice(&file.borrow().blob.borrow().data);
        } else {
            data.extend_from_slice(&as_bytes(part)?);
        }
    }
    Ok(data)
}

fn type_option<'js>(options: &Opt<Object<'js>>) -> String {
    options
        .0
        .as_ref()
        .and_then(|o| o.get::<_, Option<String>>("type").ok().flatten())
        .unwrap_or_default()
}

#[derive(Debug, Default)]
pub struct BlobData {
    pub data: Vec<u8>,
    pub mime: String,
}

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct Blob {
    #[qjs(skip_trace)]
    inner: Rc<RefCell<BlobData>>,
}

impl Blob {
    pub fn from_bytes(data: Vec<u8>, mime: String) -> Self {
        Self {
            inner: Rc::new(RefCell::new(BlobData { data, mime })),
        }
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.inner.borrow().data.clone()
    }

    pub fn mime(&self) -> String {
        self.inner.borrow().mime.clone()
    }
}

#[rquickjs::methods]
impl Blob {
    #[qjs(constructor)]
    pub fn new<'js>(
        ctx: Ctx<'js>,
        parts: Opt<Value<'js>>,
        options: Opt<Object<'js>>,
    ) -> Result<Self> {
        let data = match parts.0 {
            Some(parts) if !parts.is_undefined() && !parts.is_null() => {
                blob_parts_to_bytes(&ctx, &parts)?
            }
            _ => Vec::new(),
        };
        Ok(Self::from_bytes(data, type_option(&options)))
    }

    #[qjs(get)]
    pub fn size(&self) -> usize {
        self.inner.borrow().data.len()
    }

    #[qjs(get, rename = "type")]
    pub fn mime_type(&self) -> String {
        self.inner.borrow().mime.clone()
    }

    pub fn text<'js>(&self, ctx: Ctx<'js>) -> Result<rquickjs::Promise<'js>> {
        let text = String::from_utf8_lossy(&self.inner.borrow().data).into_owned();
        resolved_promise(&ctx, text)
    }

    #[qjs(rename = "arrayBuffer")]
    pub fn array_buffer<'js>(&self, ctx: Ctx<'js>) -> Result<rquickjs::Promise<'js>> {
        let buffer = bytes_to_array_buffer(&ctx, &self.inner.borrow().data)?;
        resolved_promise(&ctx, buffer)
    }

    pub fn slice(
        &self,
        start: Opt<f64>,
        end: Opt<f64>,
        content_type: Opt<String>,
    ) -> Result<Blob> {
        let inner = self.inner.borrow();
        let data = &inner.data;
        let len = data.len() as i64;
        let clamp = |idx: Option<f64>, default: i64| -> usize {
            let idx = idx.map(|v| v as i64).unwrap_or(default);
            let idx = if idx < 0 { len + idx } else { idx };
            idx.clamp(0, len) as usize
        };
        let start = clamp(start.0, 0);
        let end = clamp(end.0, len);
        let slice = if start < end {
            data[start..end].to_vec()
        } else {
            Vec::new()
        };
        Ok(Blob::from_bytes(slice, content_type.0.unwrap_or_default()))
    }

    /// A closed single-chunk stream over the blob's bytes.
    pub fn stream<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        super::streams::readable_from_bytes(&ctx, self.inner.borrow().data.clone())
    }
}

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct File {
    #[qjs(skip_trace)]
    blob: Rc<RefCell<BlobData>>,
    #[qjs(skip_trace)]
    name: String,
    #[qjs(skip_trace)]
    last_modified: f64,
}

impl File {
    pub fn from_parts(data: Vec<u8>, name: String, mime: String, last_modified: f64) -> Self {
        Self {
            blob: Rc::new(RefCell::new(BlobData { data, mime })),
            name,
            last_modified,
        }
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.blob.borrow().data.clone()
    }
}

#[rquickjs::methods]
impl File {
    #[qjs(constructor)]
    pub fn new<'js>(
        ctx: Ctx<'js>,
        parts: Value<'js>,
        name: String,
        options: Opt<Object<'js>>,
    ) -> Result<Self> {
        let data = blob_parts_to_bytes(&ctx, &parts)?;
        let last_modified = options
            .0
            .as_ref()
            .and_then(|o| o.get::<_, Option<f64>>("lastModified").ok().flatten())
            .unwrap_or(0.0);
        Ok(Self {
            blob: Rc::new(RefCell::new(BlobData {
                data,
                mime: type_option(&options),
            })),
            name,
            last_modified,
        })
    }

    #[qjs(get)]
    pub fn name(&self) -> String {
        self.name.clone()
    }

    #[qjs(get, rename = "lastModified")]
    pub fn last_modified(&self) -> f64 {
        self.last_modified
    }

    #[qjs(get)]
    pub fn size(&self) -> usize {
        self.blob.borrow().data.len()
    }

    #[qjs(get, rename = "type")]
    pub fn mime_type(&self) -> String {
        self.blob.borrow().mime.clone()
    }

    pub fn text<'js>(&self, ctx: Ctx<'js>) -> Result<rquickjs::Promise<'js>> {
        let text = String::from_utf8_lossy(&self.blob.borrow().data).into_owned();
        resolved_promise(&ctx, text)
    }

    #[qjs(rename = "arrayBuffer")]
    pub fn array_buffer<'js>(&self, ctx: Ctx<'js>) -> Result<rquickjs::Promise<'js>> {
        let buffer = bytes_to_array_buffer(&ctx, &self.blob.borrow().data)?;
        resolved_promise(&ctx, buffer)
    }
}

/// One `FormData` entry value: plain text or a file payload.
#[derive(Debug, Clone)]
pub enum FormValue {
    Text(String),
    File {
        data: Vec<u8>,
        name: String,
        mime: String,
    },
}

impl FormValue {
    fn from_js<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> Result<Self> {
        if let Some(file) = try_class::<File>(ctx, &value) {
            let file = file.borrow();
            return Ok(FormValue::File {
                data: file.blob.borrow().data.clone(),
                name: file.name.clone(),
                mime: file.blob.borrow().mime.clone(),
            });
        }
        if let Some(blob) = try_class::<Blob>(ctx, &value) {
            let blob = blob.borrow();
            return Ok(FormValue::File {
                data: blob.inner.borrow().data.clone(),
                name: "blob".to_string(),
                mime: blob.inner.borrow().mime.clone(),
            });
        }
        let text: rquickjs::Coerced<String> = rquickjs::Coerced::from_js(ctx, value)?;
        Ok(FormValue::Text(text.0))
    }

    fn into_js<'js>(self, ctx: &Ctx<'js>) -> Result<Value<'js>> {
        use rquickjs::IntoJs;
        match self {
            FormValue::Text(text) => text.into_js(ctx),
            FormValue::File { data, name, mime } => {
                Class::instance(ctx.clone(), File::from_parts(data, name, mime, 0.0))?
                    .into_js(ctx)
            }
        }
    }
}

use rquickjs::FromJs;

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct FormData {
    #[qjs(skip_trace)]
    entries: Rc<RefCell<Vec<(String, FormValue)>>>,
}

impl FormData {
    pub fn from_entries(entries: Vec<(String, FormValue)>) -> Self {
        Self {
            entries: Rc::new(RefCell::new(entries)),
        }
    }

    /// A copy of the current entries, detached from later mutation.
    pub fn snapshot(&self) -> Vec<(String, FormValue)> {
        self.entries.borrow().clone()
    }

    /// Serialise to `application/x-www-form-urlencoded`; file entries
    /// contribute their filename.
    pub fn to_urlencoded(&self) -> String {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (name, value) in self.entries.borrow().iter() {
            match value {
                FormValue::Text(text) => serializer.append_pair(name, text),
                FormValue::File { name: file, .. } => serializer.append_pair(name, file),
            };
        }
        serializer.finish()
    }
}

#[rquickjs::methods]
impl FormData {
    #[qjs(constructor)]
    pub fn new() -> Self {
        Self::from_entries(Vec::new())
    }

    pub fn append<'js>(&self, ctx: Ctx<'js>, name: String, value: Value<'js>) -> Result<()> {
        let value = FormValue::from_js(&ctx, value)?;
        self.entries.borrow_mut().push((name, value));
        Ok(())
    }

    pub fn set<'js>(&self, ctx: Ctx<'js>, name: String, value: Value<'js>) -> Result<()> {
        let value = FormValue::from_js(&ctx, value)?;
        let mut entries = self.entries.borrow_mut();
        entries.retain(|(n, _)| *n != name);
        entries.push((name, value));
        Ok(())
    }

    pub fn delete(&self, name: String) {
        self.entries.borrow_mut().retain(|(n, _)| *n != name);
    }

    pub fn get<'js>(&self, ctx: Ctx<'js>, name: String) -> Result<Value<'js>> {
        let entry = self
            .entries
            .borrow()
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.clone());
        match entry {
            Some(value) => value.into_js(&ctx),
            None => Ok(Value::new_null(ctx)),
        }
    }

    #[qjs(rename = "getAll")]
    pub fn get_all<'js>(&self, ctx: Ctx<'js>, name: String) -> Result<Array<'js>> {
        let array = Array::new(ctx.clone())?;
        let mut idx = 0;
        for (n, value) in self.entries.borrow().iter() {
            if *n == name {
                array.set(idx, value.clone().into_js(&ctx)?)?;
                idx += 1;
            }
        }
        Ok(array)
    }

    pub fn has(&self, name: String) -> bool {
        self.entries.borrow().iter().any(|(n, _)| *n == name)
    }

    pub fn entries<'js>(&self, ctx: Ctx<'js>) -> Result<Array<'js>> {
        let array = Array::new(ctx.clone())?;
        for (idx, (name, value)) in self.entries.borrow().iter().enumerate() {
            let pair = Array::new(ctx.clone())?;
            pair.set(0, name.clone())?;
            pair.set(1, value.clone().into_js(&ctx)?)?;
            array.set(idx, pair)?;
        }
        Ok(array)
    }
}

pub fn setup(_ctx: &Ctx<'_>, globals: &Object<'_>) -> Result<()> {
    Class::<Blob>::define(globals)?;
    Class::<File>::define(globals)?;
    Class::<FormData>::define(globals)?;
    Ok(())
}
