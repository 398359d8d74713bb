//! Test the bare script context used by `nano eval` and the REPL.

use std::time::{Duration, Instant};

use nano_runtime::{LoopHandle, ScriptContext};

const BUDGET: Duration = Duration::from_millis(50);

#[test]
fn evaluates_expressions() {
    let context = ScriptContext::new(LoopHandle::new()).unwrap();
    assert_eq!(context.eval("1 + 1", BUDGET).unwrap(), "2");
    assert_eq!(context.eval("[1, 2, 3].length", BUDGET).unwrap(), "3");
    assert_eq!(
        context.eval("JSON.stringify({ a: 1 })", BUDGET).unwrap(),
        "\"{\\\"a\\\":1}\""
    );
}

#[test]
fn context_state_persists_across_evaluations() {
    let context = ScriptContext::new(LoopHandle::new()).unwrap();
    context.eval("globalThis.counter = 41", BUDGET).unwrap();
    assert_eq!(context.eval("counter + 1", BUDGET).unwrap(), "42");
}

#[test]
fn syntax_and_runtime_errors_are_reported() {
    let context = ScriptContext::new(LoopHandle::new()).unwrap();
    assert!(context.eval("this is not js", BUDGET).is_err());
    assert!(context.eval("undefinedFunction()", BUDGET).is_err());
}

#[test]
fn runaway_scripts_are_terminated_by_the_watchdog() {
    let context = ScriptContext::new(LoopHandle::new()).unwrap();
    let started = Instant::now();
    let result = context.eval("while (true) {}", BUDGET);
    assert!(result.is_err());
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "termination took {:?}",
        started.elapsed()
    );

    // The context stays usable afterwards.
    assert_eq!(context.eval("2 * 21", BUDGET).unwrap(), "42");
}

#[test]
fn globals_are_installed_in_the_script_context() {
    let context = ScriptContext::new(LoopHandle::new()).unwrap();
    assert_eq!(
        context.eval("btoa('hi')", BUDGET).unwrap(),
        "\"aGk=\""
    );
    assert_eq!(
        context
            .eval("new URL('https://example.com/a').pathname", BUDGET)
            .unwrap(),
        "\"/a\""
    );
    assert_eq!(
        context
            .eval("typeof fetch === 'function' && typeof ReadableStream === 'function'", BUDGET)
            .unwrap(),
        "true"
    );
}
