//! The `Headers` global: an ordered multimap of lowercased names.

use std::cell::RefCell;
use std::rc::Rc;

use rquickjs::class::Trace;
use rquickjs::function::Opt;
use rquickjs::{Array, Class, Ctx, Exception, JsLifetime, Object, Result, Value};

use crate::utils::try_class;

/// The backing store, shared between a `Headers` instance and whatever
/// `Request`/`Response` it belongs to.
#[derive(Debug, Default, Clone)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut map = Self::default();
        for (name, value) in pairs {
            map.append(&name, &value);
        }
        map
    }

    pub fn append(&mut self, name: &str, value: &str) {
        self.entries
            .push((name.to_ascii_lowercase(), value.to_string()));
    }

    pub fn set(&mut self, name: &str, value: &str) {
        let name = name.to_ascii_lowercase();
        self.entries.retain(|(n, _)| *n != name);
        self.entries.push((name, value.to_string()));
    }

    pub fn delete(&mut self, name: &str) {
        let name = name.to_ascii_lowercase();
        self.entries.retain(|(n, _)| *n != name);
    }

    /// All values for `name`, joined with `", "`. `None` when absent.
    pub fn get(&self, name: &str) -> Option<String> {
        let name = name.to_ascii_lowercase();
        let values: Vec<&str> = self
            .entries
            .iter()
            .filter(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.join(", "))
        }
    }

    pub fn has(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        self.entries.iter().any(|(n, _)| *n == name)
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    /// Parse a JS headers-init value: another `Headers`, a name→value
    /// mapping, or a sequence of `[name, value]` pairs.
    pub fn from_value<'js>(ctx: &Ctx<'js>, init: &Value<'js>) -> Result<Self> {
        if let Some(headers) = try_class::<Headers>(ctx, init) {
            return Ok(headers.borrow().map.borrow().clone());
        }

        let mut map = Self::default();
        if let Some(array) = init.as_array() {
            for pair in array.iter::<Array>() {
                let pair = pair?;
                let name: String = pair.get(0)?;
                let value: String = pair.get(1)?;
                map.append(&name, &value);
            }
            return Ok(map);
        }
        if let Some(obj) = init.as_object() {
            for entry in obj.props::<String, String>() {
                let (name, value) = entry?;
                map.append(&name, &value);
            }
            return Ok(map);
        }
        Err(Exception::throw_type(
            ctx,
            "Headers init must be a Headers, an object, or a sequence of pairs",
        ))
    }
}

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct Headers {
    #[qjs(skip_trace)]
    map: Rc<RefCell<HeaderMap>>,
}

impl Headers {
    pub fn from_map(map: Rc<RefCell<HeaderMap>>) -> Self {
        Self { map }
    }

    pub fn shared(&self) -> Rc<RefCell<HeaderMap>> {
        Rc::clone(&self.map)
    }
}

#[rquickjs::methods]
impl Headers {
    #[qjs(constructor)]
    pub fn new<'a>(ctx: Ctx<'a>, init: Opt<Value<'a>>) -> Result<Self> {
        let map = match init.0 {
            Some(init) if !init.is_undefined() && !init.is_null() => {
                HeaderMap::from_value(&ctx, &init)?
            }
            _ => HeaderMap::default(),
        };
        Ok(Self {
            map: Rc::new(RefCell::new(map)),
        })
    }

    pub fn append(&self, name: String, value: String) {
        self.map.borrow_mut().append(&name, &value);
    }

    pub fn set(&self, name: String, value: String) {
        self.map.borrow_mut().set(&name, &value);
    }

    pub fn delete(&self, name: String) {
        self.map.borrow_mut().delete(&name);
    }

    pub fn get(&self, name: String) -> Option<String> {
        self.map.borrow().get(&name)
    }

    pub fn has(&self, name: String) -> bool {
        self.map.borrow().has(&name)
    }

    /// `[name, value]` pairs in insertion order. The bootstrap layer wires
    /// this into `Symbol.iterator`.
    pub fn entries<'js>(&self, ctx: Ctx<'js>) -> Result<Array<'js>> {
        let array = Array::new(ctx.clone())?;
        for (idx, (name, value)) in self.map.borrow().entries().iter().enumerate() {
            let pair = Array::new(ctx.clone())?;
            pair.set(0, name.clone())?;
            pair.set(1, value.clone())?;
            array.set(idx, pair)?;
        }
        Ok(array)
    }

    pub fn keys<'js>(&self, ctx: Ctx<'js>) -> Result<Array<'js>> {
        let array = Array::new(ctx.clone())?;
        for (idx, (name, _)) in self.map.borrow().entries().iter().enumerate() {
            array.set(idx, name.clone())?;
        }
        Ok(array)
    }

    pub fn values<'js>(&self, ctx: Ctx<'js>) -> Result<Array<'js>> {
        let array = Array::new(ctx.clone())?;
        for (idx, (_, value)) in self.map.borrow().entries().iter().enumerate() {
            array.set(idx, value.clone())?;
        }
        Ok(array)
    }

    #[qjs(rename = "forEach")]
    pub fn for_each<'js>(&self, callback: rquickjs::Function<'js>) -> Result<()> {
        for (name, value) in self.map.borrow().entries().iter().cloned() {
            callback.call::<_, ()>((value, name))?;
        }
        Ok(())
    }
}

pub fn setup(_ctx: &Ctx<'_>, globals: &Object<'_>) -> Result<()> {
    Class::<Headers>::define(globals)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_lowercased_and_appends_preserved() {
        let mut map = HeaderMap::default();
        map.append("X-Custom", "a");
        map.append("x-custom", "b");
        assert!(map.has("X-CUSTOM"));
        assert_eq!(map.get("x-custom").as_deref(), Some("a, b"));
        assert_eq!(map.entries().len(), 2);
    }

    #[test]
    fn set_replaces_every_entry_with_the_name() {
        let mut map = HeaderMap::default();
        map.append("accept", "text/html");
        map.append("Accept", "text/plain");
        map.set("ACCEPT", "application/json");
        assert_eq!(map.get("accept").as_deref(), Some("application/json"));
        assert_eq!(map.entries().len(), 1);
    }

    #[test]
    fn delete_removes_all_and_get_reports_absence() {
        let mut map = HeaderMap::default();
        map.append("cookie", "a=1");
        map.append("cookie", "b=2");
        map.delete("Cookie");
        assert!(!map.has("cookie"));
        assert_eq!(map.get("cookie"), None);
    }
}
