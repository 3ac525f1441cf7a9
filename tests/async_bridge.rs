//! End-to-end tests for the async execution bridge over the public handle.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jsbridge::{Error, JsRuntime, JsValue, ObjectDescriptor, RuntimeConfig};
use tokio::time::Instant;

fn runtime() -> JsRuntime {
    JsRuntime::spawn(RuntimeConfig::default()).expect("spawn runtime")
}

#[tokio::test]
async fn async_binding_resolves_await() {
    let rt = runtime();
    rt.define_async_function("fetch", |_args| async move { Ok("Hello".into()) })
        .await
        .unwrap();

    let greeting: String = rt.evaluate("await fetch()").await.unwrap();
    assert_eq!(greeting, "Hello");

    rt.close().await.unwrap();
}

#[tokio::test]
async fn async_binding_receives_marshaled_arguments() {
    let rt = runtime();
    rt.define_async_function("join", |args| async move {
        let parts: Vec<String> = args
            .into_iter()
            .map(|a| a.as_str().unwrap_or("?").to_string())
            .collect();
        Ok(parts.join("-").into())
    })
    .await
    .unwrap();

    let joined: String = rt.evaluate("await join('a', 'b', 'c')").await.unwrap();
    assert_eq!(joined, "a-b-c");

    rt.close().await.unwrap();
}

#[tokio::test]
async fn failing_async_binding_surfaces_its_message() {
    let rt = runtime();
    rt.define_async_function("flaky", |_args| async move {
        Err::<JsValue, _>(Error::host("backend exploded"))
    })
    .await
    .unwrap();

    let err = rt.evaluate::<JsValue>("await flaky()").await.unwrap_err();
    assert!(
        err.to_string().contains("backend exploded"),
        "unexpected error: {err}"
    );

    rt.close().await.unwrap();
}

#[tokio::test]
async fn promise_all_waits_for_the_slowest_member() {
    let rt = runtime();
    rt.define_async_function("slow", |_args| async move {
        tokio::time::sleep(Duration::from_millis(1000)).await;
        Ok("one".into())
    })
    .await
    .unwrap();
    rt.define_async_function("slower", |_args| async move {
        tokio::time::sleep(Duration::from_millis(2000)).await;
        Ok("two".into())
    })
    .await
    .unwrap();

    let started = Instant::now();
    let rt2 = rt.clone();
    let eval = tokio::spawn(async move {
        rt2.evaluate::<String>(
            "const [a, b] = await Promise.all([slow(), slower()]); a + ' ' + b",
        )
        .await
    });

    tokio::time::sleep(Duration::from_millis(1501)).await;
    assert!(!eval.is_finished(), "evaluation finished before the slower member");

    let combined = eval.await.unwrap().unwrap();
    assert_eq!(combined, "one two");
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(2000), "finished too early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(3500), "finished too late: {elapsed:?}");

    rt.close().await.unwrap();
}

#[tokio::test]
async fn first_rejection_short_circuits_without_aborting_siblings() {
    let rt = runtime();
    let completions = Arc::new(AtomicUsize::new(0));

    let seen = Arc::clone(&completions);
    rt.define_async_function("short", move |_args| {
        let seen = Arc::clone(&seen);
        async move {
            tokio::time::sleep(Duration::from_millis(1000)).await;
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(JsValue::Int(1))
        }
    })
    .await
    .unwrap();
    rt.define_async_function("failing", |_args| async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        Err::<JsValue, _>(Error::host("boom"))
    })
    .await
    .unwrap();

    let started = Instant::now();
    let err = rt
        .evaluate::<JsValue>("await Promise.all([short(), failing()]); 'unreachable'")
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(err.to_string().contains("boom"), "unexpected error: {err}");
    // the short sibling completed exactly once before the failure surfaced
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert!(elapsed >= Duration::from_millis(1500), "failed too early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(2500), "failed too late: {elapsed:?}");

    rt.close().await.unwrap();
}

#[tokio::test]
async fn sequential_awaits_settle_in_call_order() {
    let rt = runtime();
    let order = Arc::new(Mutex::new(Vec::new()));

    let log = Arc::clone(&order);
    rt.define_async_function("first", move |_args| {
        let log = Arc::clone(&log);
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            log.lock().unwrap().push("first");
            Ok(JsValue::Undefined)
        }
    })
    .await
    .unwrap();
    let log = Arc::clone(&order);
    rt.define_async_function("second", move |_args| {
        let log = Arc::clone(&log);
        async move {
            log.lock().unwrap().push("second");
            Ok(JsValue::Undefined)
        }
    })
    .await
    .unwrap();

    rt.evaluate::<()>("await first(); await second();")
        .await
        .unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);

    rt.close().await.unwrap();
}

#[tokio::test]
async fn closing_cancels_outstanding_jobs() {
    let rt = runtime();
    let completed = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&completed);
    rt.define_async_function("never", move |_args| {
        let flag = Arc::clone(&flag);
        async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(JsValue::Undefined)
        }
    })
    .await
    .unwrap();

    let rt2 = rt.clone();
    let eval = tokio::spawn(async move { rt2.evaluate::<JsValue>("await never()").await });

    tokio::time::sleep(Duration::from_millis(300)).await;
    rt.close().await.unwrap();

    let result = eval.await.unwrap();
    assert!(matches!(result, Err(Error::Cancelled)), "got {result:?}");
    assert!(rt.is_closed());

    // the cancelled job's completion path never ran, so no resolve fired
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!completed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn close_is_idempotent() {
    let rt = runtime();
    rt.close().await.unwrap();
    rt.close().await.unwrap();
    assert!(rt.is_closed());

    let err = rt.evaluate::<JsValue>("1 + 1").await.unwrap_err();
    assert!(matches!(err, Error::ClosedRuntime));
}

#[tokio::test]
async fn unhandled_rejection_fails_the_evaluation() {
    let rt = runtime();
    let err = rt
        .evaluate::<JsValue>("Promise.reject(new Error('floating')); 1")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("floating"), "unexpected error: {err}");

    rt.close().await.unwrap();
}

#[tokio::test]
async fn sync_function_bindings_round_trip_values() {
    let rt = runtime();
    rt.define_function("add", |args| {
        let sum = args.iter().filter_map(JsValue::as_i64).sum::<i64>();
        Ok(JsValue::Int(sum))
    })
    .await
    .unwrap();

    let total: i64 = rt.evaluate("add(2, 3) + add(4, 5)").await.unwrap();
    assert_eq!(total, 14);

    rt.close().await.unwrap();
}

#[tokio::test]
async fn sync_function_errors_throw_into_script() {
    let rt = runtime();
    rt.define_function("explode", |_args| {
        Err::<JsValue, _>(Error::host("kaboom"))
    })
    .await
    .unwrap();

    let caught: String = rt
        .evaluate("try { explode(); 'no throw' } catch (e) { e.message }")
        .await
        .unwrap();
    assert_eq!(caught, "kaboom");

    rt.close().await.unwrap();
}

#[tokio::test]
async fn duplicate_binding_names_are_rejected() {
    let rt = runtime();
    rt.define_function("once", |_| Ok(JsValue::Undefined))
        .await
        .unwrap();
    let err = rt
        .define_function("once", |_| Ok(JsValue::Undefined))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateOrInvalidName(_)));

    let err = rt
        .define_function("not a name", |_| Ok(JsValue::Undefined))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateOrInvalidName(_)));

    rt.close().await.unwrap();
}

#[tokio::test]
async fn object_bindings_expose_properties_and_functions() {
    let rt = runtime();
    let counter = Arc::new(AtomicUsize::new(7));

    let read = Arc::clone(&counter);
    let write = Arc::clone(&counter);
    let descriptor = ObjectDescriptor::new()
        .property("version", || Ok("1.2.3".into()))
        .mutable_property(
            "count",
            move || Ok(JsValue::Int(read.load(Ordering::SeqCst) as i64)),
            move |value| {
                let n = value.as_i64().ok_or_else(|| Error::host("count must be an integer"))?;
                write.store(n as usize, Ordering::SeqCst);
                Ok(())
            },
        )
        .function("describe", |_args| Ok("an object binding".into()));

    let handle = rt.define_object("config", descriptor, None).await.unwrap();

    let version: String = rt.evaluate("config.version").await.unwrap();
    assert_eq!(version, "1.2.3");

    let count: i64 = rt.evaluate("config.count = 12; config.count").await.unwrap();
    assert_eq!(count, 12);
    assert_eq!(counter.load(Ordering::SeqCst), 12);

    let described: String = rt.evaluate("config.describe()").await.unwrap();
    assert_eq!(described, "an object binding");

    // nested object under the returned handle
    let nested = ObjectDescriptor::new().async_function("ping", |_args| async move {
        Ok("pong".into())
    });
    rt.define_object("net", nested, Some(handle)).await.unwrap();
    let pong: String = rt.evaluate("await config.net.ping()").await.unwrap();
    assert_eq!(pong, "pong");

    rt.close().await.unwrap();
}

#[tokio::test]
async fn bytecode_compiles_once_and_runs_later() {
    let rt = runtime();
    let bytecode = rt.compile("6 * 7", "calc.js", false).await.unwrap();
    assert!(!bytecode.as_bytes().is_empty());

    let answer: i64 = rt.evaluate_bytecode(&bytecode).await.unwrap();
    assert_eq!(answer, 42);

    rt.close().await.unwrap();
}

#[tokio::test]
async fn modules_load_before_the_next_evaluation() {
    let rt = runtime();
    rt.add_module("mathmod", "export function double(n) { return n * 2; }")
        .await
        .unwrap();

    rt.evaluate_with(
        "import { double } from 'mathmod'; globalThis.__doubled = double(21);",
        "main.js",
        true,
    )
    .await
    .unwrap();

    let doubled: i64 = rt.evaluate("__doubled").await.unwrap();
    assert_eq!(doubled, 42);

    rt.close().await.unwrap();
}

#[tokio::test]
async fn module_bytecode_is_registrable() {
    let rt = runtime();
    let module = rt
        .compile("export const greeting = 'hi';", "greetmod", true)
        .await
        .unwrap();
    assert!(module.is_module());
    rt.add_module_bytecode(module).await.unwrap();

    rt.evaluate_with(
        "import { greeting } from 'greetmod'; globalThis.__greeting = greeting;",
        "main.js",
        true,
    )
    .await
    .unwrap();

    let greeting: String = rt.evaluate("__greeting").await.unwrap();
    assert_eq!(greeting, "hi");

    rt.close().await.unwrap();
}

#[tokio::test]
async fn compile_errors_carry_the_filename() {
    let rt = runtime();
    let err = rt.compile("function (", "broken.js", false).await.unwrap_err();
    match err {
        Error::Compile { filename, .. } => assert_eq!(filename, "broken.js"),
        other => panic!("expected compile error, got {other:?}"),
    }

    rt.close().await.unwrap();
}

#[tokio::test]
async fn script_runtime_errors_carry_name_and_message() {
    let rt = runtime();
    let err = rt
        .evaluate::<JsValue>("null.property")
        .await
        .unwrap_err();
    match err {
        Error::Script(e) => assert_eq!(e.name, "TypeError"),
        other => panic!("expected script error, got {other:?}"),
    }

    rt.close().await.unwrap();
}

#[tokio::test]
async fn typed_extraction_applies_numeric_widening() {
    let rt = runtime();

    let as_float: f64 = rt.evaluate("41").await.unwrap();
    assert_eq!(as_float, 41.0);

    let err = rt.evaluate::<String>("42").await.unwrap_err();
    assert!(matches!(err, Error::TypeCoercion { .. }));

    rt.close().await.unwrap();
}

#[tokio::test]
async fn composite_results_cross_the_boundary() {
    let rt = runtime();
    let value = rt
        .evaluate::<JsValue>(
            "({ tags: ['a', 'b'], nested: { ok: true }, pairs: new Map([['k', 1]]), bag: new Set([3]) })",
        )
        .await
        .unwrap();

    match value {
        JsValue::Object(map) => {
            assert_eq!(
                map.get("tags"),
                Some(&JsValue::Array(vec!["a".into(), "b".into()]))
            );
            assert!(matches!(map.get("nested"), Some(JsValue::Object(_))));
            assert_eq!(
                map.get("pairs"),
                Some(&JsValue::Map(vec![("k".into(), JsValue::Int(1))]))
            );
            assert_eq!(map.get("bag"), Some(&JsValue::Set(vec![JsValue::Int(3)])));
        }
        other => panic!("expected object, got {other:?}"),
    }

    rt.close().await.unwrap();
}

#[tokio::test]
async fn cyclic_script_values_fail_marshaling() {
    let rt = runtime();
    let err = rt
        .evaluate::<JsValue>("const a = []; a.push(a); a")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CircularReference), "got {err:?}");

    rt.close().await.unwrap();
}

#[tokio::test]
async fn execution_timeout_cancels_the_evaluation() {
    let rt = JsRuntime::spawn(
        RuntimeConfig::new().with_execution_timeout(Duration::from_millis(500)),
    )
    .expect("spawn runtime");
    rt.define_async_function("hang", |_args| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(JsValue::Undefined)
    })
    .await
    .unwrap();

    let started = Instant::now();
    let err = rt.evaluate::<JsValue>("await hang()").await.unwrap_err();
    assert!(matches!(err, Error::EvaluationTimedOut(_)), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));

    rt.close().await.unwrap();
}

#[tokio::test]
async fn runtime_controls_respond() {
    let rt = runtime();

    let usage = rt.memory_usage().await.unwrap();
    assert!(usage.memory_used_size > 0);

    rt.set_memory_limit(64 * 1024 * 1024).await.unwrap();
    rt.set_max_stack_size(256 * 1024).await.unwrap();
    rt.gc().await.unwrap();

    // the engine still evaluates after the controls were applied
    let two: i64 = rt.evaluate("1 + 1").await.unwrap();
    assert_eq!(two, 2);

    rt.close().await.unwrap();
}

#[tokio::test]
async fn state_persists_across_evaluations() {
    let rt = runtime();

    let zero: i64 = rt.evaluate("globalThis.counter = 0; counter").await.unwrap();
    assert_eq!(zero, 0);
    let one: i64 = rt.evaluate("++counter").await.unwrap();
    assert_eq!(one, 1);
    let still_one: i64 = rt.evaluate("counter").await.unwrap();
    assert_eq!(still_one, 1);

    rt.close().await.unwrap();
}

#[tokio::test]
async fn bootstrap_script_runs_before_first_evaluation() {
    let rt = JsRuntime::spawn(RuntimeConfig::new().with_bootstrap("globalThis.VERSION = '1.0.0';"))
        .expect("spawn runtime");

    let version: String = rt.evaluate("VERSION").await.unwrap();
    assert_eq!(version, "1.0.0");

    rt.close().await.unwrap();
}
