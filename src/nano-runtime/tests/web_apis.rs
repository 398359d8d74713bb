//! Test the built-in web platform globals from app code.

use std::collections::BTreeMap;

use nano_runtime::{AppLimits, AppRuntime, HttpRequest, LoopHandle, ResponseBody};

const HARNESS: &str = r#"
export default {
    async fetch(request, env) {
        const result = await (async () => { __BODY__ })();
        return Response.json(result);
    }
};
"#;

/// Run a JS snippet inside a handler and return what it produced.
fn run(body: &str) -> serde_json::Value {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.js"), HARNESS.replace("__BODY__", body)).unwrap();
    let runtime = AppRuntime::new(
        dir.path(),
        &BTreeMap::new(),
        AppLimits::default(),
        LoopHandle::new(),
    )
    .unwrap();
    let response = runtime.handle_request(HttpRequest {
        method: "GET".to_string(),
        url: "http://apps.test/".to_string(),
        headers: Vec::new(),
        body: Vec::new(),
    });
    let body = match &response.body {
        ResponseBody::Full(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        ResponseBody::Chunks(chunks) => chunks
            .iter()
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect(),
    };
    assert_eq!(response.status, 200, "handler failed: {body}");
    serde_json::from_str(&body).unwrap()
}

#[test]
fn base64_round_trips() {
    let result = run(
        r#"
        const encoded = btoa("hello world");
        let rejected = false;
        try { btoa("\u{1F600}"); } catch (e) { rejected = true; }
        return { encoded, decoded: atob(encoded), rejected, rt: btoa(atob("aGk=")) === "aGk=" };
        "#,
    );
    assert_eq!(result["encoded"], "aGVsbG8gd29ybGQ=");
    assert_eq!(result["decoded"], "hello world");
    assert_eq!(result["rejected"], true);
    assert_eq!(result["rt"], true);
}

#[test]
fn text_codec_round_trips_utf8() {
    let result = run(
        r#"
        const text = "héllo wörld \u{1F680}";
        const bytes = new TextEncoder().encode(text);
        const back = new TextDecoder().decode(bytes);
        let fatalThrew = false;
        try { new TextDecoder("utf-8", { fatal: true }).decode(new Uint8Array([0xff, 0xfe])); }
        catch (e) { fatalThrew = true; }
        const dest = new Uint8Array(5);
        const partial = new TextEncoder().encodeInto("héllo", dest);
        return { same: back === text, fatalThrew, read: partial.read, written: partial.written };
        "#,
    );
    assert_eq!(result["same"], true);
    assert_eq!(result["fatalThrew"], true);
    // "hé" is 3 bytes; "l" fits twice more into 5 bytes.
    assert_eq!(result["written"], 5);
    assert_eq!(result["read"], 4);
}

#[test]
fn url_parses_and_reserialises() {
    let result = run(
        r#"
        const url = new URL("https://user:pw@example.com:8443/path/to?q=1&q=2#frag");
        const again = new URL(url.href);
        url.pathname = "/other";
        url.port = "9000";
        url.port = "not-a-port";
        url.hash = "#next";
        return {
            href_rt: again.href === new URL(again.href).href,
            protocol: again.protocol,
            host: again.host,
            hostname: again.hostname,
            port: again.port,
            pathname: again.pathname,
            search: again.search,
            hash: again.hash,
            username: again.username,
            password: again.password,
            origin: again.origin,
            q: again.searchParams.getAll("q"),
            mutated: url.href,
            relative: new URL("/sub", "https://example.com/base").href,
        };
        "#,
    );
    assert_eq!(result["href_rt"], true);
    assert_eq!(result["protocol"], "https:");
    assert_eq!(result["host"], "example.com:8443");
    assert_eq!(result["hostname"], "example.com");
    assert_eq!(result["port"], "8443");
    assert_eq!(result["pathname"], "/path/to");
    assert_eq!(result["search"], "?q=1&q=2");
    assert_eq!(result["hash"], "#frag");
    assert_eq!(result["username"], "user");
    assert_eq!(result["password"], "pw");
    assert_eq!(result["origin"], "https://example.com:8443");
    assert_eq!(result["q"], serde_json::json!(["1", "2"]));
    assert_eq!(result["mutated"], "https://user:pw@example.com:9000/other?q=1&q=2#next");
    assert_eq!(result["relative"], "https://example.com/sub");
}

#[test]
fn url_search_params_operations() {
    let result = run(
        r#"
        const params = new URLSearchParams("?a=1&b=2&a=3");
        params.append("c", "4");
        params.set("b", "5");
        params.delete("a");
        const collected = [];
        for (const [name, value] of params) collected.push(`${name}=${value}`);
        return { text: params.toString(), has: params.has("c"), gone: params.has("a"), collected };
        "#,
    );
    assert_eq!(result["text"], "c=4&b=5");
    assert_eq!(result["has"], true);
    assert_eq!(result["gone"], false);
    assert_eq!(result["collected"], serde_json::json!(["c=4", "b=5"]));
}

#[test]
fn headers_preserve_append_order_and_case_rules() {
    let result = run(
        r#"
        const headers = new Headers({ "X-One": "1" });
        headers.append("X-Two", "a");
        headers.append("x-two", "b");
        headers.set("X-Three", "z");
        headers.delete("x-one");
        const listed = [];
        for (const [name, value] of headers) listed.push(`${name}:${value}`);
        return {
            joined: headers.get("X-TWO"),
            has: headers.has("x-THREE"),
            gone: headers.get("x-one"),
            listed,
        };
        "#,
    );
    assert_eq!(result["joined"], "a, b");
    assert_eq!(result["has"], true);
    assert!(result["gone"].is_null());
    assert_eq!(
        result["listed"],
        serde_json::json!(["x-two:a", "x-two:b", "x-three:z"])
    );
}

#[test]
fn digest_is_input_representation_independent() {
    let result = run(
        r#"
        const hex = (buffer) => Array.from(new Uint8Array(buffer))
            .map((b) => b.toString(16).padStart(2, "0")).join("");
        const fromString = hex(await crypto.subtle.digest("SHA-256", "abc"));
        const bytes = new TextEncoder().encode("abc");
        const fromView = hex(await crypto.subtle.digest({ name: "SHA-256" }, bytes));
        const fromBuffer = hex(await crypto.subtle.digest("SHA-256", bytes.buffer));
        const sha1 = hex(await crypto.subtle.digest("SHA-1", "abc"));
        return { fromString, fromView, fromBuffer, sha1 };
        "#,
    );
    let expected = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
    assert_eq!(result["fromString"], expected);
    assert_eq!(result["fromView"], expected);
    assert_eq!(result["fromBuffer"], expected);
    assert_eq!(result["sha1"], "a9993e364706816aba3e25717850c26c9cd0d89d");
}

#[test]
fn hmac_sign_verify_and_tampering() {
    let result = run(
        r#"
        const key = "super-secret";
        const tag = await crypto.subtle.sign("HMAC", key, "message");
        const ok = await crypto.subtle.verify("HMAC", key, tag, "message");
        const tampered = await crypto.subtle.verify("HMAC", key, tag, "other message");
        const wrongKey = await crypto.subtle.verify("HMAC", "other-key", tag, "message");
        const sha512 = await crypto.subtle.sign({ name: "HMAC", hash: "SHA-512" }, key, "message");
        return { ok, tampered, wrongKey, sha512len: sha512.byteLength };
        "#,
    );
    assert_eq!(result["ok"], true);
    assert_eq!(result["tampered"], false);
    assert_eq!(result["wrongKey"], false);
    assert_eq!(result["sha512len"], 64);
}

#[test]
fn random_primitives() {
    let result = run(
        r#"
        const uuid = crypto.randomUUID();
        const other = crypto.randomUUID();
        const bytes = crypto.getRandomValues(new Uint8Array(32));
        const allZero = bytes.every((b) => b === 0);
        return {
            format: /^[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$/.test(uuid),
            distinct: uuid !== other,
            length: bytes.length,
            allZero,
        };
        "#,
    );
    assert_eq!(result["format"], true);
    assert_eq!(result["distinct"], true);
    assert_eq!(result["length"], 32);
    assert_eq!(result["allZero"], false);
}

#[test]
fn structured_clone_is_deep_and_disjoint() {
    let result = run(
        r#"
        const original = { list: [1, 2, { deep: "yes" }], when: new Date(1700000000000) };
        original.self = original;
        const copy = structuredClone(original);
        return {
            deepEqual: JSON.stringify(copy.list) === JSON.stringify(original.list),
            disjoint: copy !== original && copy.list[2] !== original.list[2],
            cycle: copy.self === copy,
            when: copy.when.getTime(),
        };
        "#,
    );
    assert_eq!(result["deepEqual"], true);
    assert_eq!(result["disjoint"], true);
    assert_eq!(result["cycle"], true);
    assert_eq!(result["when"], 1700000000000u64.into());
}

#[test]
fn blob_and_file_basics() {
    let result = run(
        r#"
        const blob = new Blob(["hello ", "world"], { type: "text/plain" });
        const sliced = blob.slice(6, 11, "text/x-piece");
        const file = new File(["content"], "notes.txt", { type: "text/plain", lastModified: 123 });
        return {
            size: blob.size,
            type: blob.type,
            text: await blob.text(),
            sliceText: await sliced.text(),
            sliceType: sliced.type,
            streamed: await __nanoDrainText(blob.stream()),
            fileName: file.name,
            fileStamp: file.lastModified,
        };
        "#,
    );
    assert_eq!(result["size"], 11);
    assert_eq!(result["type"], "text/plain");
    assert_eq!(result["text"], "hello world");
    assert_eq!(result["sliceText"], "world");
    assert_eq!(result["sliceType"], "text/x-piece");
    assert_eq!(result["streamed"], "hello world");
    assert_eq!(result["fileName"], "notes.txt");
    assert_eq!(result["fileStamp"], 123);
}

#[test]
fn form_data_multi_values() {
    let result = run(
        r#"
        const form = new FormData();
        form.append("tag", "one");
        form.append("tag", "two");
        form.set("name", "nano");
        form.append("file", new File(["data"], "d.bin"));
        const all = form.getAll("tag");
        const names = [];
        for (const [name] of form) names.push(name);
        form.delete("tag");
        return {
            all,
            got: form.get("name"),
            fileName: form.get("file").name,
            names,
            afterDelete: form.has("tag"),
        };
        "#,
    );
    assert_eq!(result["all"], serde_json::json!(["one", "two"]));
    assert_eq!(result["got"], "nano");
    assert_eq!(result["fileName"], "d.bin");
    assert_eq!(result["names"], serde_json::json!(["tag", "tag", "name", "file"]));
    assert_eq!(result["afterDelete"], false);
}

#[test]
fn body_reconsumption_is_rejected() {
    let result = run(
        r#"
        const response = new Response("payload");
        const first = await response.text();
        let message = "";
        try { await response.text(); } catch (e) { message = String(e.message || e); }
        return { first, message, used: response.bodyUsed };
        "#,
    );
    assert_eq!(result["first"], "payload");
    assert_eq!(result["used"], true);
    let message = result["message"].as_str().unwrap();
    assert!(message.contains("body used"), "got: {message}");
}

#[test]
fn response_statics_and_status_texts() {
    let result = run(
        r#"
        const json = Response.json({ a: 1 }, { status: 201 });
        const redirect = Response.redirect("https://example.com/next");
        const teapot = new Response("short and stout", { status: 418, statusText: "I'm a teapot" });
        return {
            jsonStatus: json.status,
            jsonType: json.headers.get("content-type"),
            jsonOk: json.ok,
            redirectStatus: redirect.status,
            location: redirect.headers.get("location"),
            statusText: new Response(null, { status: 404 }).statusText,
            custom: teapot.statusText,
        };
        "#,
    );
    assert_eq!(result["jsonStatus"], 201);
    assert_eq!(result["jsonType"], "application/json");
    assert_eq!(result["jsonOk"], true);
    assert_eq!(result["redirectStatus"], 302);
    assert_eq!(result["location"], "https://example.com/next");
    assert_eq!(result["statusText"], "Not Found");
    assert_eq!(result["custom"], "I'm a teapot");
}

#[test]
fn request_init_and_copy_constructor() {
    let result = run(
        r#"
        const base = new Request("https://api.test/things", {
            method: "post",
            headers: { "X-Token": "abc" },
            body: JSON.stringify({ n: 7 }),
        });
        const copy = new Request(base);
        const payload = await copy.json();
        return {
            method: base.method,
            token: copy.headers.get("x-token"),
            contentType: base.headers.get("content-type"),
            n: payload.n,
            originalUntouched: base.bodyUsed,
        };
        "#,
    );
    assert_eq!(result["method"], "POST");
    assert_eq!(result["token"], "abc");
    assert_eq!(result["contentType"], "text/plain;charset=UTF-8");
    assert_eq!(result["n"], 7);
    assert_eq!(result["originalUntouched"], false);
}

#[test]
fn abort_controller_dispatches_once() {
    let result = run(
        r#"
        const controller = new AbortController();
        const events = [];
        controller.signal.addEventListener("abort", (e) => events.push("first:" + e.reason.message));
        controller.signal.addEventListener("abort", () => events.push("second"));
        controller.abort(new Error("stop now"));
        controller.abort(new Error("again"));
        let threw = "";
        try { controller.signal.throwIfAborted(); } catch (e) { threw = e.message; }
        return { events, aborted: controller.signal.aborted, threw };
        "#,
    );
    assert_eq!(
        result["events"],
        serde_json::json!(["first:stop now", "second"])
    );
    assert_eq!(result["aborted"], true);
    assert_eq!(result["threw"], "stop now");
}

#[test]
fn abort_signal_timeout_composes_timer_and_abort() {
    let result = run(
        r#"
        const signal = AbortSignal.timeout(20);
        const before = signal.aborted;
        await new Promise((resolve) => setTimeout(resolve, 60));
        return { before, after: signal.aborted };
        "#,
    );
    assert_eq!(result["before"], false);
    assert_eq!(result["after"], true);
}

#[test]
fn timer_ids_are_monotonic_and_clear_works() {
    let result = run(
        r#"
        const order = [];
        const a = setTimeout(() => order.push("a"), 0);
        const b = setTimeout(() => order.push("b"), 0);
        const c = setTimeout(() => order.push("never"), 0);
        clearTimeout(c);
        const interval = setInterval(() => order.push("tick"), 5);
        await new Promise((resolve) => setTimeout(resolve, 30));
        clearInterval(interval);
        const ticks = order.filter((x) => x === "tick").length;
        return {
            monotonic: b > a && c > b && interval > c,
            firstTwo: order.slice(0, 2),
            cancelled: !order.includes("never"),
            ticked: ticks >= 1,
        };
        "#,
    );
    assert_eq!(result["monotonic"], true);
    assert_eq!(result["firstTwo"], serde_json::json!(["a", "b"]));
    assert_eq!(result["cancelled"], true);
    assert_eq!(result["ticked"], true);
}

#[test]
fn console_handles_cycles_without_crashing() {
    let result = run(
        r#"
        const ring = { name: "ring" };
        ring.self = ring;
        console.log("values:", ring, [1, "two", null], undefined, 3.5);
        console.error(new Error("printed to stderr"));
        return { ok: true };
        "#,
    );
    assert_eq!(result["ok"], true);
}
