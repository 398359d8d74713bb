use rquickjs::class::JsClass;
use rquickjs::function::This;
use rquickjs::prelude::{FromJs, IntoJs};
use rquickjs::{
    ArrayBuffer, Class, Ctx, Exception, Function, Object, Persistent, Promise, Result, Value,
};

/// Converts a JavaScript value to a byte vector.
/// The value can be a String, a typed array, or an ArrayBuffer.
pub fn as_bytes(value: Value<'_>) -> Result<Vec<u8>> {
    if let Some(txt) = value.as_string() {
        return Ok(txt.to_string()?.into_bytes());
    }

    if let Some(obj) = value.as_object() {
        if let Some(array) = obj.as_typed_array::<u8>() {
            if let Some(bytes) = array.as_bytes() {
                return Ok(bytes.to_vec());
            }
        }
        if let Ok(buffer) = ArrayBuffer::from_js(value.ctx(), value.clone()) {
            if let Some(bytes) = buffer.as_bytes() {
                return Ok(bytes.to_vec());
            }
        }
    }

    Err(Exception::throw_type(
        value.ctx(),
        "Expected a String, TypedArray or ArrayBuffer",
    ))
}

/// Create an already-resolved promise.
pub fn resolved_promise<'js>(
    ctx: &Ctx<'js>,
    value: impl IntoJs<'js>,
) -> Result<Promise<'js>> {
    let (promise, resolve, _reject) = Promise::new(ctx)?;
    resolve.call::<_, ()>((value.into_js(ctx)?,))?;
    Ok(promise)
}

/// Create an already-rejected promise carrying a TypeError-style message.
pub fn rejected_promise<'js>(ctx: &Ctx<'js>, message: &str) -> Result<Promise<'js>> {
    let (promise, _resolve, reject) = Promise::new(ctx)?;
    let error = Exception::from_message(ctx.clone(), message)?;
    reject.call::<_, ()>((error,))?;
    Ok(promise)
}

/// Create an already-rejected promise carrying an arbitrary reason value.
pub fn rejected_promise_with<'js>(
    ctx: &Ctx<'js>,
    reason: Value<'js>,
) -> Result<Promise<'js>> {
    let (promise, _resolve, reject) = Promise::new(ctx)?;
    reject.call::<_, ()>((reason,))?;
    Ok(promise)
}

/// Chain native callbacks onto a promise via its own `then`.
pub fn on_settled<'js>(
    promise: &Promise<'js>,
    on_fulfilled: Function<'js>,
    on_rejected: Function<'js>,
) -> Result<()> {
    let then: Function = promise.get("then")?;
    then.call::<_, ()>((This(promise.clone()), on_fulfilled, on_rejected))
}

/// Build a `{ value, done }` read result object.
pub fn read_result<'js>(
    ctx: &Ctx<'js>,
    value: Value<'js>,
    done: bool,
) -> Result<Object<'js>> {
    let result = Object::new(ctx.clone())?;
    result.set("value", value)?;
    result.set("done", done)?;
    Ok(result)
}

/// A resolve/reject pair promoted past the current stack frame. Each half is
/// restored and invoked at most once; dropping the pair is the release path.
pub type SavedResolver = (
    Persistent<Function<'static>>,
    Persistent<Function<'static>>,
);

/// Create a promise and persist its resolver pair.
pub fn saved_promise<'js>(ctx: &Ctx<'js>) -> Result<(Promise<'js>, SavedResolver)> {
    let (promise, resolve, reject) = Promise::new(ctx)?;
    let saved = (
        Persistent::save(ctx, resolve),
        Persistent::save(ctx, reject),
    );
    Ok((promise, saved))
}

/// Copy a byte slice into a fresh `ArrayBuffer`.
pub fn bytes_to_array_buffer<'js>(ctx: &Ctx<'js>, bytes: &[u8]) -> Result<ArrayBuffer<'js>> {
    ArrayBuffer::new(ctx.clone(), bytes.to_vec())
}

/// Downcast a value to a native class instance, if it is one.
pub fn try_class<'js, C: JsClass<'js>>(
    ctx: &Ctx<'js>,
    value: &Value<'js>,
) -> Option<Class<'js, C>> {
    if !value.is_object() {
        return None;
    }
    Class::<C>::from_js(ctx, value.clone()).ok()
}
