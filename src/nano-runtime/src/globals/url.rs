//! `URL` and `URLSearchParams` over the WHATWG `url` crate.

use std::cell::RefCell;
use std::rc::Rc;

use rquickjs::class::Trace;
use rquickjs::function::Opt;
use rquickjs::{Array, Class, Ctx, Exception, JsLifetime, Object, Result, Value};

#[rquickjs::class(rename = "URL")]
#[derive(Clone, Trace, JsLifetime)]
pub struct Url {
    #[qjs(skip_trace)]
    inner: Rc<RefCell<url::Url>>,
}

#[rquickjs::methods]
impl Url {
    #[qjs(constructor)]
    pub fn new(ctx: Ctx<'_>, input: String, base: Opt<String>) -> Result<Self> {
        let parsed = match base.0 {
            Some(base) => {
                let base = url::Url::parse(&base).map_err(|e| {
                    Exception::throw_type(&ctx, &format!("Invalid base URL: {e}"))
                })?;
                base.join(&input)
            }
            None => url::Url::parse(&input),
        };
        let parsed =
            parsed.map_err(|e| Exception::throw_type(&ctx, &format!("Invalid URL: {e}")))?;
        Ok(Self {
            inner: Rc::new(RefCell::new(parsed)),
        })
    }

    #[qjs(get)]
    pub fn href(&self) -> String {
        self.inner.borrow().as_str().to_string()
    }

    #[qjs(get)]
    pub fn origin(&self) -> String {
        self.inner.borrow().origin().ascii_serialization()
    }

    #[qjs(get)]
    pub fn protocol(&self) -> String {
        format!("{}:", self.inner.borrow().scheme())
    }

    #[qjs(get)]
    pub fn username(&self) -> String {
        self.inner.borrow().username().to_string()
    }

    #[qjs(get)]
    pub fn password(&self) -> String {
        self.inner.borrow().password().unwrap_or("").to_string()
    }

    #[qjs(get)]
    pub fn host(&self) -> String {
        let url = self.inner.borrow();
        match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => String::new(),
        }
    }

    #[qjs(get)]
    pub fn hostname(&self) -> String {
        self.inner.borrow().host_str().unwrap_or("").to_string()
    }

    #[qjs(set, rename = "hostname")]
    pub fn set_hostname(&self, hostname: String) {
        // Invalid hosts are silently ignored, like invalid ports.
        let _ = self.inner.borrow_mut().set_host(Some(&hostname));
    }

    #[qjs(get)]
    pub fn port(&self) -> String {
        self.inner
            .borrow()
            .port()
            .map(|p| p.to_string())
            .unwrap_or_default()
    }

    #[qjs(set, rename = "port")]
    pub fn set_port(&self, port: String) {
        let mut url = self.inner.borrow_mut();
        if port.is_empty() {
            let _ = url.set_port(None);
        } else if let Ok(port) = port.parse::<u16>() {
            let _ = url.set_port(Some(port));
        }
        // Unparseable ports are silently ignored.
    }

    #[qjs(get)]
    pub fn pathname(&self) -> String {
        self.inner.borrow().path().to_string()
    }

    #[qjs(set, rename = "pathname")]
    pub fn set_pathname(&self, path: String) {
        self.inner.borrow_mut().set_path(&path);
    }

    #[qjs(get)]
    pub fn search(&self) -> String {
        match self.inner.borrow().query() {
            Some(query) if !query.is_empty() => format!("?{query}"),
            _ => String::new(),
        }
    }

    #[qjs(set, rename = "search")]
    pub fn set_search(&self, search: String) {
        let query = search.strip_prefix('?').unwrap_or(&search);
        self.inner
            .borrow_mut()
            .set_query((!query.is_empty()).then_some(query));
    }

    #[qjs(get)]
    pub fn hash(&self) -> String {
        match self.inner.borrow().fragment() {
            Some(fragment) if !fragment.is_empty() => format!("#{fragment}"),
            _ => String::new(),
        }
    }

    #[qjs(set, rename = "hash")]
    pub fn set_hash(&self, hash: String) {
        let fragment = hash.strip_prefix('#').unwrap_or(&hash);
        self.inner
            .borrow_mut()
            .set_fragment((!fragment.is_empty()).then_some(fragment));
    }

    /// A `URLSearchParams` view of the current query. Mutations on the view
    /// do not write back into the URL.
    #[qjs(get, rename = "searchParams")]
    pub fn search_params(&self) -> UrlSearchParams {
        let pairs = self
            .inner
            .borrow()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        UrlSearchParams::from_pairs(pairs)
    }

    #[qjs(rename = "toString")]
    pub fn to_string_js(&self) -> String {
        self.href()
    }

    #[qjs(rename = "toJSON")]
    pub fn to_json(&self) -> String {
        self.href()
    }
}

#[rquickjs::class(rename = "URLSearchParams")]
#[derive(Clone, Trace, JsLifetime)]
pub struct UrlSearchParams {
    #[qjs(skip_trace)]
    pairs: Rc<RefCell<Vec<(String, String)>>>,
}

impl UrlSearchParams {
    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        Self {
            pairs: Rc::new(RefCell::new(pairs)),
        }
    }
}

#[rquickjs::methods]
impl UrlSearchParams {
    #[qjs(constructor)]
    pub fn new<'js>(ctx: Ctx<'js>, init: Opt<Value<'js>>) -> Result<Self> {
        let mut pairs = Vec::new();
        match init.0 {
            None => {}
            Some(init) if init.is_undefined() || init.is_null() => {}
            Some(init) => {
                if let Some(text) = init.as_string() {
                    let text = text.to_string()?;
                    let text = text.strip_prefix('?').unwrap_or(&text);
                    pairs = url::form_urlencoded::parse(text.as_bytes())
                        .map(|(k, v)| (k.into_owned(), v.into_owned()))
                        .collect();
                } else if let Some(existing) = crate::utils::try_class::<UrlSearchParams>(&ctx, &init)
                {
                    pairs = existing.borrow().pairs.borrow().clone();
                } else if let Some(array) = init.as_array() {
                    for pair in array.iter::<Array>() {
                        let pair = pair?;
                        pairs.push((pair.get(0)?, pair.get(1)?));
                    }
                } else if let Some(obj) = init.as_object() {
                    for entry in obj.props::<String, String>() {
                        let (name, value) = entry?;
                        pairs.push((name, value));
                    }
                } else {
                    return Err(Exception::throw_type(&ctx, "Invalid URLSearchParams init"));
                }
            }
        }
        Ok(Self::from_pairs(pairs))
    }

    pub fn get(&self, name: String) -> Option<String> {
        self.pairs
            .borrow()
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.clone())
    }

    #[qjs(rename = "getAll")]
    pub fn get_all(&self, name: String) -> Vec<String> {
        self.pairs
            .borrow()
            .iter()
            .filter(|(n, _)| *n == name)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn set(&self, name: String, value: String) {
        let mut pairs = self.pairs.borrow_mut();
        pairs.retain(|(n, _)| *n != name);
        pairs.push((name, value));
    }

    pub fn append(&self, name: String, value: String) {
        self.pairs.borrow_mut().push((name, value));
    }

    pub fn delete(&self, name: String) {
        self.pairs.borrow_mut().retain(|(n, _)| *n != name);
    }

    pub fn has(&self, name: String) -> bool {
        self.pairs.borrow().iter().any(|(n, _)| *n == name)
    }

    #[qjs(rename = "toString")]
    pub fn to_string_js(&self) -> String {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (name, value) in self.pairs.borrow().iter() {
            serializer.append_pair(name, value);
        }
        serializer.finish()
    }

    pub fn entries<'js>(&self, ctx: Ctx<'js>) -> Result<Array<'js>> {
        let array = Array::new(ctx.clone())?;
        for (idx, (name, value)) in self.pairs.borrow().iter().enumerate() {
            let pair = Array::new(ctx.clone())?;
            pair.set(0, name.clone())?;
            pair.set(1, value.clone())?;
            array.set(idx, pair)?;
        }
        Ok(array)
    }

    #[qjs(rename = "forEach")]
    pub fn for_each<'js>(&self, callback: rquickjs::Function<'js>) -> Result<()> {
        for (name, value) in self.pairs.borrow().iter().cloned() {
            callback.call::<_, ()>((value, name))?;
        }
        Ok(())
    }
}

pub fn setup(_ctx: &Ctx<'_>, globals: &Object<'_>) -> Result<()> {
    Class::<Url>::define(globals)?;
    Class::<UrlSearchParams>::define(globals)?;
    Ok(())
}
