//! Installation of the web-platform API surface onto an app context.
//!
//! Stateful APIs (queues, locks, byte accounting, crypto, the engine-facing
//! halves of timers and fetch) are native; `bootstrap.js` layers the
//! pure-composition pieces on top once the native surface is in place.

use rquickjs::{Ctx, Result};

pub mod abort;
pub mod blob;
pub mod body;
pub mod console;
pub mod crypto;
pub mod encoding;
pub mod fetch;
pub mod headers;
pub mod request;
pub mod response;
pub mod streams;
pub mod timers;
pub mod url;

pub fn setup(ctx: &Ctx<'_>) -> Result<()> {
    let globals = ctx.globals();

    console::setup(ctx, &globals)?;
    encoding::setup(ctx, &globals)?;
    url::setup(ctx, &globals)?;
    crypto::setup(ctx, &globals)?;
    headers::setup(ctx, &globals)?;
    blob::setup(ctx, &globals)?;
    request::setup(ctx, &globals)?;
    response::setup(ctx, &globals)?;
    abort::setup(ctx, &globals)?;
    timers::setup(ctx, &globals)?;
    streams::setup(ctx, &globals)?;
    fetch::setup(ctx, &globals)?;

    ctx.eval::<(), _>(include_str!("bootstrap.js"))?;
    Ok(())
}
