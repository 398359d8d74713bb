//! Native output primitives backing `console`.
//!
//! The `console` object itself is assembled in the bootstrap, which formats
//! values (with cycle detection) and routes log/info/debug to stdout and
//! warn/error to stderr through these two hooks.

use std::io::Write;

use rquickjs::{Ctx, Function, Object, Result};

fn write_stdout(text: String) {
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    let _ = handle.write_all(text.as_bytes());
    let _ = handle.flush();
}

fn write_stderr(text: String) {
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = handle.write_all(text.as_bytes());
    let _ = handle.flush();
}

pub fn setup<'a>(ctx: &Ctx<'a>, globals: &Object<'a>) -> Result<()> {
    globals.set(
        "__nanoPrint",
        Function::new(ctx.clone(), write_stdout)?.with_name("__nanoPrint")?,
    )?;
    globals.set(
        "__nanoEprint",
        Function::new(ctx.clone(), write_stderr)?.with_name("__nanoEprint")?,
    )?;
    Ok(())
}
