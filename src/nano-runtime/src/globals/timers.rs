//! `setTimeout` / `setInterval` / `clearTimeout` / `clearInterval`.
//!
//! Timers are event-loop entries; the JS callback and its arguments live in
//! persistent handles owned by the timer's closure, so they are released
//! exactly once: on cancel, or when a one-shot fires for the last time.

use rquickjs::function::{Opt, Rest};
use rquickjs::{Array, Ctx, Exception, Function, Object, Persistent, Result, Value};

use std::time::Duration;

use crate::RuntimeState;

fn runtime_state(ctx: &Ctx<'_>) -> Result<RuntimeState> {
    ctx.userdata::<RuntimeState>()
        .map(|state| state.clone())
        .ok_or_else(|| Exception::throw_internal(ctx, "runtime state not installed"))
}

fn schedule<'js>(
    ctx: Ctx<'js>,
    callback: Function<'js>,
    delay: Opt<f64>,
    args: Rest<Value<'js>>,
    interval: bool,
) -> Result<f64> {
    let state = runtime_state(&ctx)?;
    // Delays clamp to non-negative; the minimum effective delay is 0 ms.
    let delay = Duration::from_millis(delay.0.unwrap_or(0.0).max(0.0) as u64);

    let saved_callback = Persistent::save(&ctx, callback);
    let saved_args = {
        let array = Array::new(ctx.clone())?;
        for (idx, arg) in args.into_inner().into_iter().enumerate() {
            array.set(idx, arg)?;
        }
        Persistent::save(&ctx, array)
    };

    let context = state.context.clone();
    let runtime = state.runtime.clone();
    let owned_timers = state.timers.clone();
    let id_slot = std::rc::Rc::new(std::cell::Cell::new(0u64));
    let fire = {
        let id_slot = id_slot.clone();
        move || {
            let outcome = context.with(|ctx| -> Result<()> {
                let callback = saved_callback.clone().restore(&ctx)?;
                let args = saved_args.clone().restore(&ctx)?;
                let apply: Function = callback.get("apply")?;
                apply.call::<_, ()>((
                    rquickjs::function::This(callback),
                    Value::new_undefined(ctx.clone()),
                    args,
                ))?;
                Ok(())
            });
            if outcome.is_err() {
                let message = context.with(|ctx| format!("{:?}", ctx.catch()));
                tracing::warn!(error = %message, "uncaught exception in timer callback");
            }
            if !interval {
                owned_timers.borrow_mut().remove(&id_slot.get());
            }
            crate::drain_microtasks(&runtime);
        }
    };

    let id = state.events.add_timer(delay, interval, Box::new(fire));
    id_slot.set(id);
    state.timers.borrow_mut().insert(id);
    Ok(id as f64)
}

fn set_timeout<'js>(
    ctx: Ctx<'js>,
    callback: Function<'js>,
    delay: Opt<f64>,
    args: Rest<Value<'js>>,
) -> Result<f64> {
    schedule(ctx, callback, delay, args, false)
}

fn set_interval<'js>(
    ctx: Ctx<'js>,
    callback: Function<'js>,
    delay: Opt<f64>,
    args: Rest<Value<'js>>,
) -> Result<f64> {
    schedule(ctx, callback, delay, args, true)
}

fn clear_timer(ctx: Ctx<'_>, id: Opt<f64>) -> Result<()> {
    if let Some(id) = id.0 {
        if id >= 1.0 {
            let state = runtime_state(&ctx)?;
            state.events.cancel_timer(id as u64);
            state.timers.borrow_mut().remove(&(id as u64));
        }
    }
    Ok(())
}

pub fn setup<'a>(ctx: &Ctx<'a>, globals: &Object<'a>) -> Result<()> {
    globals.set(
        "setTimeout",
        Function::new(ctx.clone(), set_timeout)?.with_name("setTimeout")?,
    )?;
    globals.set(
        "setInterval",
        Function::new(ctx.clone(), set_interval)?.with_name("setInterval")?,
    )?;
    globals.set(
        "clearTimeout",
        Function::new(ctx.clone(), clear_timer)?.with_name("clearTimeout")?,
    )?;
    globals.set(
        "clearInterval",
        Function::new(ctx.clone(), clear_timer)?.with_name("clearInterval")?,
    )?;
    Ok(())
}
