//! `atob` / `btoa` and the text codec globals.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rquickjs::class::Trace;
use rquickjs::function::Opt;
use rquickjs::{Ctx, Exception, Function, JsLifetime, Object, Result, TypedArray, Value};

use crate::utils::as_bytes;

const UTF8_BOM: [u8; 3] = [0xef, 0xbb, 0xbf];

fn btoa(ctx: Ctx<'_>, input: String) -> Result<String> {
    let mut bytes = Vec::with_capacity(input.len());
    for ch in input.chars() {
        let code = ch as u32;
        if code > 0xff {
            return Err(Exception::throw_message(
                &ctx,
                "btoa: input contains code points above 0xFF",
            ));
        }
        bytes.push(code as u8);
    }
    Ok(STANDARD.encode(bytes))
}

fn atob(ctx: Ctx<'_>, input: String) -> Result<String> {
    let compact: String = input.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = STANDARD
        .decode(compact)
        .map_err(|e| Exception::throw_message(&ctx, &format!("atob: invalid base64: {e}")))?;
    Ok(bytes.into_iter().map(char::from).collect())
}

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct TextEncoder {}

#[rquickjs::methods]
impl TextEncoder {
    #[qjs(constructor)]
    pub fn new() -> Self {
        Self {}
    }

    #[qjs(get)]
    pub fn encoding(&self) -> &'static str {
        "utf-8"
    }

    pub fn encode<'js>(&self, ctx: Ctx<'js>, input: Opt<String>) -> Result<TypedArray<'js, u8>> {
        let bytes = input.0.unwrap_or_default().into_bytes();
        TypedArray::new(ctx, bytes)
    }
}

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct TextDecoder {
    #[qjs(skip_trace)]
    fatal: bool,
    #[qjs(skip_trace)]
    ignore_bom: bool,
}

#[rquickjs::methods]
impl TextDecoder {
    #[qjs(constructor)]
    pub fn new(ctx: Ctx<'_>, label: Opt<String>, options: Opt<Object<'_>>) -> Result<Self> {
        if let Some(label) = label.0 {
            let normalized = label.trim().to_ascii_lowercase();
            if !matches!(normalized.as_str(), "utf-8" | "utf8" | "unicode-1-1-utf-8") {
                return Err(Exception::throw_range(
                    &ctx,
                    &format!("TextDecoder: unsupported encoding label {label:?}"),
                ));
            }
        }
        let get_flag = |name: &str| -> bool {
            options
                .0
                .as_ref()
                .and_then(|o| o.get::<_, Option<bool>>(name).ok().flatten())
                .unwrap_or(false)
        };
        Ok(Self {
            fatal: get_flag("fatal"),
            ignore_bom: get_flag("ignoreBOM"),
        })
    }

    #[qjs(get)]
    pub fn encoding(&self) -> &'static str {
        "utf-8"
    }

    #[qjs(get)]
    pub fn fatal(&self) -> bool {
        self.fatal
    }

    #[qjs(get, rename = "ignoreBOM")]
    pub fn ignore_bom(&self) -> bool {
        self.ignore_bom
    }

    pub fn decode<'js>(&self, ctx: Ctx<'js>, input: Opt<Value<'js>>) -> Result<String> {
        let bytes = match input.0 {
            Some(value) if !value.is_undefined() => as_bytes(value)?,
            _ => Vec::new(),
        };
        let bytes = if !self.ignore_bom && bytes.starts_with(&UTF8_BOM) {
            &bytes[UTF8_BOM.len()..]
        } else {
            &bytes[..]
        };
        if self.fatal {
            match std::str::from_utf8(bytes) {
                Ok(text) => Ok(text.to_string()),
                Err(_) => Err(Exception::throw_type(
                    &ctx,
                    "TextDecoder: invalid UTF-8 sequence",
                )),
            }
        } else {
            Ok(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

pub fn setup<'a>(ctx: &Ctx<'a>, globals: &Object<'a>) -> Result<()> {
    globals.set("btoa", Function::new(ctx.clone(), btoa)?.with_name("btoa")?)?;
    globals.set("atob", Function::new(ctx.clone(), atob)?.with_name("atob")?)?;
    rquickjs::Class::<TextEncoder>::define(globals)?;
    rquickjs::Class::<TextDecoder>::define(globals)?;
    Ok(())
}
