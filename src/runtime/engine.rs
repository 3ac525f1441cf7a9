//! Ownership of the QuickJS engine instance.
//!
//! `EngineContext` owns the engine runtime and execution context, confined to
//! the runtime thread. It wraps the handful of engine primitives the rest of
//! the crate consumes: asynchronous evaluation of source or bytecode,
//! compile-only evaluation with bytecode serialization, single-step and
//! to-exhaustion microtask pumping, pending-exception capture, the host
//! promise-rejection tracker, and memory controls.
//!
//! The high-level `rquickjs` API covers most of this; the raw `qjs` bindings
//! are used only where an engine flag is not otherwise reachable
//! (compile-only/async evaluation, bytecode write/read, the rejection
//! tracker, memory accounting).

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::CString;
use std::rc::Rc;

use rquickjs::function::Rest;
use rquickjs::{qjs, Context, Ctx, Function, Object, Persistent, Runtime, Value};

use crate::runtime::bindings::{BindingEntry, BindingTable, FunctionBinding};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::error::{Error, Result, ScriptError};
use crate::runtime::job_driver::{FuturesUnorderedDriver, JobDriver, JobId};
use crate::runtime::js_value::JsValue;
use crate::runtime::marshal;

// Engine-side globals installed by the bootstrap glue.
const INVOKE_HELPER: &str = "__jsbridge_invoke";
const INVOKE_ASYNC_HELPER: &str = "__jsbridge_invoke_async";
const GET_PROPERTY_HELPER: &str = "__jsbridge_get";
const SET_PROPERTY_HELPER: &str = "__jsbridge_set";
const DEF_FN_HELPER: &str = "__jsbridge_def_fn";
const DEF_ASYNC_FN_HELPER: &str = "__jsbridge_def_async_fn";
const DEF_OBJ_HELPER: &str = "__jsbridge_def_obj";
const DEF_PROP_HELPER: &str = "__jsbridge_def_prop";
const STASH_TOP_HELPER: &str = "__jsbridge_stash_top";
const TOP_SLOT: &str = "__jsbridge_top";
const OBJECTS_SLOT: &str = "__jsbridge_objects";

/// Glue evaluated once at engine startup. Binding wrappers defined here are
/// what script actually calls; they forward into the native dispatchers with
/// the binding slot (and, for async bindings, the freshly allocated promise's
/// resolve/reject capabilities) prepended to the caller's arguments.
const GLUE: &str = r#"
(function(g) {
    "use strict";
    const objects = {};
    Object.defineProperty(g, "__jsbridge_objects", { value: objects });
    const defineValue = (target, name, value) => {
        if (Object.prototype.hasOwnProperty.call(target, name)) return false;
        Object.defineProperty(target, name, { value, enumerable: true });
        return true;
    };
    g.__jsbridge_construct = (ctor, arg) => new ctor(arg);
    g.__jsbridge_collect = (value) => Array.from(value);
    g.__jsbridge_seen_enter = (seen, value) => {
        if (seen.includes(value)) return false;
        seen.push(value);
        return true;
    };
    g.__jsbridge_seen_exit = (seen) => { seen.pop(); };
    g.__jsbridge_stash_top = (value) => {
        g.__jsbridge_top = value;
        if (value && typeof value.then === "function") {
            Promise.prototype.then.call(value, undefined, () => {});
        }
    };
    g.__jsbridge_def_fn = (target, name, slot) =>
        defineValue(target, name, (...args) => g.__jsbridge_invoke(slot, ...args));
    g.__jsbridge_def_async_fn = (target, name, slot) =>
        defineValue(target, name, (...args) => new Promise((resolve, reject) =>
            g.__jsbridge_invoke_async(slot, resolve, reject, ...args)));
    g.__jsbridge_def_obj = (target, name, slot) => {
        if (Object.prototype.hasOwnProperty.call(target, name)) return false;
        const obj = {};
        Object.defineProperty(target, name, { value: obj, enumerable: true });
        objects[slot] = obj;
        return true;
    };
    g.__jsbridge_def_prop = (target, name, slot, hasGetter, hasSetter) => {
        if (Object.prototype.hasOwnProperty.call(target, name)) return false;
        const desc = { enumerable: true };
        if (hasGetter) desc.get = () => g.__jsbridge_get(slot, name);
        if (hasSetter) desc.set = (value) => g.__jsbridge_set(slot, name, value);
        Object.defineProperty(target, name, desc);
        return true;
    };
})(globalThis);
"#;

/// Opaque compiled artifact produced by compile-only evaluation.
///
/// Bytecode is only valid for a compatible engine; feeding foreign or
/// corrupted bytes back fails with [`Error::BytecodeRead`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bytecode {
    pub(crate) bytes: Vec<u8>,
    pub(crate) module: bool,
}

impl Bytecode {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_module(&self) -> bool {
        self.module
    }
}

/// Snapshot of the engine's memory accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub malloc_size: i64,
    pub malloc_limit: i64,
    pub memory_used_size: i64,
    pub memory_used_count: i64,
}

/// Resolve/reject capability pair carried from an async dispatch to its
/// settlement. Owned by exactly one job; dropped without firing if that job
/// is cancelled.
pub(crate) struct PromiseBridge {
    pub resolve: Persistent<Function<'static>>,
    pub reject: Persistent<Function<'static>>,
}

/// Shared state the native dispatchers close over: the binding table, the job
/// driver, and the bridge registry. Resolved once at installation, not per
/// call.
#[derive(Clone)]
pub(crate) struct HostDispatch {
    pub table: Rc<RefCell<BindingTable>>,
    pub driver: Rc<FuturesUnorderedDriver>,
    pub bridges: Rc<RefCell<HashMap<JobId, PromiseBridge>>>,
    pub next_job: Rc<Cell<JobId>>,
}

/// State of the stashed top-level evaluation result.
pub(crate) enum TopLevel {
    Pending,
    Done(Result<JsValue>),
}

#[derive(Default)]
struct RejectionSlot {
    pending: RefCell<Option<String>>,
}

unsafe extern "C" fn rejection_tracker(
    ctx: *mut qjs::JSContext,
    _promise: qjs::JSValue,
    reason: qjs::JSValue,
    is_handled: bool,
    opaque: *mut std::os::raw::c_void,
) {
    if opaque.is_null() {
        return;
    }
    let slot = &*(opaque as *const RejectionSlot);
    if is_handled {
        // a handler was attached after the fact; the rejection is no longer
        // floating (this is how the top-level promise detaches itself)
        slot.pending.borrow_mut().take();
        return;
    }
    if slot.pending.borrow().is_some() {
        return;
    }
    let mut len = 0u64;
    let text = qjs::JS_ToCStringLen2(ctx, &mut len, reason, false);
    let message = if text.is_null() {
        "unhandled promise rejection".to_string()
    } else {
        let bytes = std::slice::from_raw_parts(text.cast::<u8>(), len as usize);
        let owned = String::from_utf8_lossy(bytes).into_owned();
        qjs::JS_FreeCString(ctx, text);
        owned
    };
    *slot.pending.borrow_mut() = Some(message);
}

pub(crate) struct EngineContext {
    // the execution context is released before the runtime it depends on
    context: Context,
    runtime: Runtime,
    raw_rt: *mut qjs::JSRuntime,
    rejection: *mut RejectionSlot,
}

impl EngineContext {
    /// Allocate the engine runtime, execution context, and glue scaffolding.
    /// Partial state is released on failure through normal drop order.
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let runtime = Runtime::new()
            .map_err(|e| Error::EngineInit(format!("creating engine runtime: {e}")))?;
        if let Some(bytes) = config.memory_limit {
            runtime.set_memory_limit(bytes);
        }
        runtime.set_max_stack_size(config.max_stack_size);
        if let Some(bytes) = config.gc_threshold {
            runtime.set_gc_threshold(bytes);
        }

        let context = Context::full(&runtime)
            .map_err(|e| Error::EngineInit(format!("creating execution context: {e}")))?;
        let raw_rt = context.with(|ctx| unsafe { qjs::JS_GetRuntime(ctx.as_raw().as_ptr()) });

        let rejection = Box::into_raw(Box::new(RejectionSlot::default()));
        unsafe {
            qjs::JS_SetHostPromiseRejectionTracker(raw_rt, Some(rejection_tracker), rejection.cast());
        }

        let engine = Self {
            context,
            runtime,
            raw_rt,
            rejection,
        };

        engine
            .context
            .with(|ctx| ctx.eval::<(), _>(GLUE))
            .map_err(|e| Error::EngineInit(format!("installing glue: {e}")))?;

        if let Some(script) = &config.bootstrap_script {
            engine
                .context
                .with(|ctx| ctx.eval::<(), _>(script.as_str()))
                .map_err(|e| Error::EngineInit(format!("bootstrap script failed: {e}")))?;
        }

        Ok(engine)
    }

    /// Run a closure with engine access. Every touch of engine state in the
    /// crate goes through here, on the runtime thread.
    pub fn with<R>(&self, f: impl for<'js> FnOnce(&Ctx<'js>) -> R) -> R {
        self.context.with(|ctx| f(&ctx))
    }

    /// Install the native dispatchers the glue wrappers forward into.
    pub fn install_dispatch(&self, state: HostDispatch) -> Result<()> {
        self.context
            .with(|ctx| -> std::result::Result<(), rquickjs::Error> {
                let globals = ctx.globals();
                let f = make_dispatch_fn(ctx.clone(), state.clone(), dispatch_sync)?;
                globals.set(INVOKE_HELPER, f)?;
                let f = make_dispatch_fn(ctx.clone(), state.clone(), dispatch_async)?;
                globals.set(INVOKE_ASYNC_HELPER, f)?;
                let f = make_dispatch_fn(ctx.clone(), state.clone(), dispatch_get)?;
                globals.set(GET_PROPERTY_HELPER, f)?;
                let f = make_dispatch_fn(ctx.clone(), state, dispatch_set)?;
                globals.set(SET_PROPERTY_HELPER, f)?;
                Ok(())
            })
            .map_err(|e| Error::EngineInit(format!("installing dispatchers: {e}")))
    }

    /// Submit top-level source with the asynchronous-evaluation flag, so the
    /// result is promise-shaped even for synchronous scripts.
    pub fn eval_source(&self, code: &str, filename: &str, as_module: bool) -> Result<()> {
        self.context.with(|ctx| {
            let value = raw_eval(&ctx, code, filename, eval_flags(as_module, false))?;
            stash_top(&ctx, value)
        })
    }

    /// Compile-only evaluation; serializes the compiled object to bytecode.
    pub fn compile(&self, code: &str, filename: &str, as_module: bool) -> Result<Bytecode> {
        self.context.with(|ctx| {
            let compiled = raw_eval(&ctx, code, filename, eval_flags(as_module, true))?;
            let mut size = 0u64;
            let buf = unsafe {
                qjs::JS_WriteObject(
                    ctx.as_raw().as_ptr(),
                    &mut size,
                    compiled.as_raw(),
                    qjs::JS_WRITE_OBJ_BYTECODE as _,
                )
            };
            if buf.is_null() {
                let caught = ctx.catch();
                return Err(Error::Compile {
                    message: marshal::script_error_from_value(&ctx, &caught).to_string(),
                    filename: filename.to_string(),
                });
            }
            let bytes = unsafe { std::slice::from_raw_parts(buf, size as usize) }.to_vec();
            unsafe { qjs::js_free(ctx.as_raw().as_ptr(), buf.cast()) };
            Ok(Bytecode {
                bytes,
                module: as_module,
            })
        })
    }

    /// Load previously compiled bytecode and start evaluating it.
    pub fn eval_bytecode(&self, bytecode: &Bytecode) -> Result<()> {
        self.context.with(|ctx| {
            let ctx_ptr = ctx.as_raw().as_ptr();
            let raw_obj = unsafe {
                qjs::JS_ReadObject(
                    ctx_ptr,
                    bytecode.bytes.as_ptr(),
                    bytecode.bytes.len() as _,
                    qjs::JS_READ_OBJ_BYTECODE as _,
                )
            };
            let caught = ctx.catch();
            if !(caught.is_null() || caught.is_undefined()) {
                return Err(Error::BytecodeRead(
                    marshal::script_error_from_value(&ctx, &caught).to_string(),
                ));
            }
            if bytecode.module {
                let resolved = unsafe { qjs::JS_ResolveModule(ctx_ptr, raw_obj) };
                if resolved < 0 {
                    let caught = ctx.catch();
                    // reclaim the unread module object before bailing
                    drop(unsafe { Value::from_raw(ctx.clone(), raw_obj) });
                    return Err(Error::BytecodeRead(
                        marshal::script_error_from_value(&ctx, &caught).to_string(),
                    ));
                }
            }
            // JS_EvalFunction consumes the compiled object
            let raw_result = unsafe { qjs::JS_EvalFunction(ctx_ptr, raw_obj) };
            let value = take_exception(&ctx, raw_result, "<bytecode>").map_err(|e| match e {
                Error::Compile { message, .. } => {
                    Error::Script(ScriptError::new("SyntaxError", message))
                }
                other => other,
            })?;
            stash_top(&ctx, value)
        })
    }

    /// Evaluate a registered module; the module becomes importable under its
    /// name once loaded.
    pub fn eval_module_source(&self, name: &str, code: &str) -> Result<()> {
        self.context.with(|ctx| {
            let value = raw_eval(&ctx, code, name, eval_flags(true, false))?;
            stash_top(&ctx, value)
        })
    }

    /// Inspect the stashed top-level result.
    pub fn poll_top(&self) -> TopLevel {
        self.context.with(|ctx| {
            let value: Value = match ctx.globals().get(TOP_SLOT) {
                Ok(v) => v,
                Err(e) => return TopLevel::Done(Err(marshal::engine_error(&ctx, e))),
            };
            if let Some(promise) = value.as_promise() {
                match promise.result::<Value>() {
                    None => TopLevel::Pending,
                    Some(Ok(resolved)) => {
                        TopLevel::Done(marshal::script_to_js_value(&ctx, &resolved))
                    }
                    Some(Err(e)) => TopLevel::Done(Err(marshal::engine_error(&ctx, e))),
                }
            } else {
                TopLevel::Done(marshal::script_to_js_value(&ctx, &value))
            }
        })
    }

    /// Run the engine's pending microtask queue to exhaustion.
    pub fn run_microtasks(&self, on_job_error: &mut dyn FnMut(Error)) {
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(_) => on_job_error(self.catch_job_error()),
            }
        }
    }

    /// Run at most one pending microtask.
    pub fn pump_one(&self, on_job_error: &mut dyn FnMut(Error)) {
        if self.runtime.execute_pending_job().is_err() {
            on_job_error(self.catch_job_error());
        }
    }

    /// A failed microtask leaves its exception pending on the context.
    fn catch_job_error(&self) -> Error {
        self.context.with(|ctx| {
            let caught = ctx.catch();
            if caught.is_null() || caught.is_undefined() {
                Error::Script(ScriptError::new("InternalError", "pending microtask failed"))
            } else {
                Error::Script(marshal::script_error_from_value(&ctx, &caught))
            }
        })
    }

    /// Take the recorded unhandled-rejection message, if any.
    pub fn take_unhandled_rejection(&self) -> Option<String> {
        unsafe { &*self.rejection }.pending.borrow_mut().take()
    }

    pub fn set_memory_limit(&self, bytes: usize) {
        self.runtime.set_memory_limit(bytes);
    }

    pub fn set_max_stack_size(&self, bytes: usize) {
        self.runtime.set_max_stack_size(bytes);
    }

    pub fn run_gc(&self) {
        self.runtime.run_gc();
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        let mut usage = unsafe { std::mem::zeroed::<qjs::JSMemoryUsage>() };
        unsafe { qjs::JS_ComputeMemoryUsage(self.raw_rt, &mut usage) };
        MemoryUsage {
            malloc_size: usage.malloc_size,
            malloc_limit: usage.malloc_limit,
            memory_used_size: usage.memory_used_size,
            memory_used_count: usage.memory_used_count,
        }
    }

    /// Define a function wrapper on the global object or a registered parent.
    pub fn register_function(
        &self,
        parent: Option<u32>,
        name: &str,
        slot: u32,
        is_async: bool,
    ) -> Result<()> {
        self.context.with(|ctx| {
            let target = binding_target(&ctx, parent)?;
            let helper_name = if is_async {
                DEF_ASYNC_FN_HELPER
            } else {
                DEF_FN_HELPER
            };
            let helper: Function = ctx
                .globals()
                .get(helper_name)
                .map_err(|e| marshal::engine_error(&ctx, e))?;
            let defined: bool = helper
                .call((target, name, slot))
                .map_err(|e| marshal::engine_error(&ctx, e))?;
            if defined {
                Ok(())
            } else {
                Err(Error::DuplicateOrInvalidName(name.to_string()))
            }
        })
    }

    /// Create an object binding under the global object or a parent and track
    /// it in the engine-side object registry keyed by its slot.
    pub fn register_object(&self, parent: Option<u32>, name: &str, slot: u32) -> Result<()> {
        self.context.with(|ctx| {
            let target = binding_target(&ctx, parent)?;
            let helper: Function = ctx
                .globals()
                .get(DEF_OBJ_HELPER)
                .map_err(|e| marshal::engine_error(&ctx, e))?;
            let defined: bool = helper
                .call((target, name, slot))
                .map_err(|e| marshal::engine_error(&ctx, e))?;
            if defined {
                Ok(())
            } else {
                Err(Error::DuplicateOrInvalidName(name.to_string()))
            }
        })
    }

    /// Define a host-backed accessor property on a registered object.
    pub fn register_property(
        &self,
        object_slot: u32,
        name: &str,
        has_getter: bool,
        has_setter: bool,
    ) -> Result<()> {
        self.context.with(|ctx| {
            let target = binding_target(&ctx, Some(object_slot))?;
            let helper: Function = ctx
                .globals()
                .get(DEF_PROP_HELPER)
                .map_err(|e| marshal::engine_error(&ctx, e))?;
            let defined: bool = helper
                .call((target, name, object_slot, has_getter, has_setter))
                .map_err(|e| marshal::engine_error(&ctx, e))?;
            if defined {
                Ok(())
            } else {
                Err(Error::DuplicateOrInvalidName(name.to_string()))
            }
        })
    }
}

impl Drop for EngineContext {
    fn drop(&mut self) {
        unsafe {
            qjs::JS_SetHostPromiseRejectionTracker(self.raw_rt, None, std::ptr::null_mut());
            drop(Box::from_raw(self.rejection));
        }
    }
}

fn eval_flags(as_module: bool, compile_only: bool) -> i32 {
    let mut flags = if as_module {
        qjs::JS_EVAL_TYPE_MODULE
    } else {
        qjs::JS_EVAL_TYPE_GLOBAL | qjs::JS_EVAL_FLAG_ASYNC
    };
    if compile_only {
        flags |= qjs::JS_EVAL_FLAG_COMPILE_ONLY;
    }
    flags as i32
}

fn raw_eval<'js>(ctx: &Ctx<'js>, code: &str, filename: &str, flags: i32) -> Result<Value<'js>> {
    let c_code = CString::new(code).map_err(|_| Error::Compile {
        message: "source contains a NUL byte".to_string(),
        filename: filename.to_string(),
    })?;
    let c_filename = CString::new(filename).map_err(|_| Error::Compile {
        message: "filename contains a NUL byte".to_string(),
        filename: filename.to_string(),
    })?;
    let raw = unsafe {
        qjs::JS_Eval(
            ctx.as_raw().as_ptr(),
            c_code.as_ptr(),
            code.len() as _,
            c_filename.as_ptr(),
            flags as _,
        )
    };
    take_exception(ctx, raw, filename)
}

/// Classify the pending exception, if any, after a raw engine call. A
/// `SyntaxError` reports as a compile failure carrying the filename.
fn take_exception<'js>(ctx: &Ctx<'js>, raw: qjs::JSValue, filename: &str) -> Result<Value<'js>> {
    let caught = ctx.catch();
    if caught.is_null() || caught.is_undefined() {
        Ok(unsafe { Value::from_raw(ctx.clone(), raw) })
    } else {
        let script_err = marshal::script_error_from_value(ctx, &caught);
        if script_err.name == "SyntaxError" {
            Err(Error::Compile {
                message: script_err.message,
                filename: filename.to_string(),
            })
        } else {
            Err(Error::Script(script_err))
        }
    }
}

/// Store the top-level result engine-side and detach its rejection from the
/// unhandled-rejection tracker (the drain loop reads the state itself).
fn stash_top<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> Result<()> {
    let stash: Function = ctx
        .globals()
        .get(STASH_TOP_HELPER)
        .map_err(|e| marshal::engine_error(ctx, e))?;
    stash
        .call::<_, ()>((value,))
        .map_err(|e| marshal::engine_error(ctx, e))
}

fn binding_target<'js>(ctx: &Ctx<'js>, parent: Option<u32>) -> Result<Object<'js>> {
    match parent {
        None => Ok(ctx.globals()),
        Some(slot) => {
            let registry: Object = ctx
                .globals()
                .get(OBJECTS_SLOT)
                .map_err(|e| marshal::engine_error(ctx, e))?;
            let parent_obj: Option<Object> = registry
                .get(slot)
                .map_err(|e| marshal::engine_error(ctx, e))?;
            parent_obj.ok_or_else(|| Error::DuplicateOrInvalidName(format!("object #{slot}")))
        }
    }
}

/// Throw a host error into script as a constructed `Error` object.
fn throw_error(ctx: &Ctx<'_>, err: &Error) -> rquickjs::Error {
    match marshal::host_error_to_script(ctx, err) {
        Ok(value) => ctx.throw(value),
        Err(_) => {
            use rquickjs::IntoJs;
            match err.to_string().into_js(ctx) {
                Ok(value) => ctx.throw(value),
                Err(e) => e,
            }
        }
    }
}

fn slot_from_args<'js>(ctx: &Ctx<'js>, args: &[Value<'js>]) -> std::result::Result<u32, rquickjs::Error> {
    args.first()
        .and_then(Value::as_int)
        .and_then(|i| u32::try_from(i).ok())
        .ok_or_else(|| {
            throw_error(
                ctx,
                &Error::InvalidCallProtocol("missing or malformed binding slot".to_string()),
            )
        })
}

/// Bind a dispatcher to the native glue under a single named lifetime, so the
/// `Ctx`/`Value` the closure receives and those the dispatcher expects unify.
fn make_dispatch_fn<'js>(
    ctx: Ctx<'js>,
    state: HostDispatch,
    dispatcher: fn(&HostDispatch, Ctx<'js>, Vec<Value<'js>>) -> std::result::Result<Value<'js>, rquickjs::Error>,
) -> std::result::Result<Function<'js>, rquickjs::Error> {
    Function::new(ctx, move |cctx: Ctx<'js>, args: Rest<Value<'js>>| {
        dispatcher(&state, cctx, args.0)
    })
}

fn dispatch_sync<'js>(
    state: &HostDispatch,
    ctx: Ctx<'js>,
    args: Vec<Value<'js>>,
) -> std::result::Result<Value<'js>, rquickjs::Error> {
    let slot = slot_from_args(&ctx, &args)?;
    let callable = {
        let table = state.table.borrow();
        match table.get(slot) {
            Some(BindingEntry::Function(FunctionBinding::Sync(f))) => f.clone(),
            _ => {
                return Err(throw_error(
                    &ctx,
                    &Error::InvalidCallProtocol(format!("slot {slot} is not a sync function")),
                ))
            }
        }
    };

    let mut host_args = Vec::with_capacity(args.len().saturating_sub(1));
    for arg in &args[1..] {
        match marshal::script_to_js_value(&ctx, arg) {
            Ok(v) => host_args.push(v),
            Err(e) => return Err(throw_error(&ctx, &e)),
        }
    }

    match callable(host_args) {
        Ok(result) => marshal::js_value_to_script(&ctx, &result).map_err(|e| throw_error(&ctx, &e)),
        Err(e) => Err(throw_error(&ctx, &e)),
    }
}

fn dispatch_async<'js>(
    state: &HostDispatch,
    ctx: Ctx<'js>,
    args: Vec<Value<'js>>,
) -> std::result::Result<Value<'js>, rquickjs::Error> {
    let slot = slot_from_args(&ctx, &args)?;
    let callable = {
        let table = state.table.borrow();
        match table.get(slot) {
            Some(BindingEntry::Function(FunctionBinding::Async(f))) => f.clone(),
            _ => {
                return Err(throw_error(
                    &ctx,
                    &Error::InvalidCallProtocol(format!("slot {slot} is not an async function")),
                ))
            }
        }
    };

    // The two capability slots the engine prepends must be callable.
    let resolve = args.get(1).and_then(Value::as_function).cloned();
    let reject = args.get(2).and_then(Value::as_function).cloned();
    let (resolve, reject) = match (resolve, reject) {
        (Some(res), Some(rej)) => (res, rej),
        _ => {
            return Err(throw_error(
                &ctx,
                &Error::InvalidCallProtocol(
                    "resolve/reject capabilities are missing or not callable".to_string(),
                ),
            ))
        }
    };

    if state.driver.is_shutdown() {
        return Err(throw_error(&ctx, &Error::ClosedRuntime));
    }

    let mut host_args = Vec::with_capacity(args.len().saturating_sub(3));
    for arg in &args[3..] {
        match marshal::script_to_js_value(&ctx, arg) {
            Ok(v) => host_args.push(v),
            Err(e) => {
                // Argument conversion failures are delivered as a rejection,
                // never dropped into the scheduler.
                let err_value = marshal::host_error_to_script(&ctx, &e)
                    .map_err(|e2| throw_error(&ctx, &e2))?;
                reject.call::<_, ()>((err_value,))?;
                return Ok(Value::new_undefined(ctx.clone()));
            }
        }
    }

    let job_id = state.next_job.get();
    state.next_job.set(job_id + 1);

    let bridge = PromiseBridge {
        resolve: Persistent::save(&ctx, resolve),
        reject: Persistent::save(&ctx, reject),
    };
    state.bridges.borrow_mut().insert(job_id, bridge);

    let future = callable(host_args);
    state.driver.submit(job_id, future);
    tracing::trace!(job_id, slot, "async binding dispatched");

    Ok(Value::new_undefined(ctx.clone()))
}

fn dispatch_get<'js>(
    state: &HostDispatch,
    ctx: Ctx<'js>,
    args: Vec<Value<'js>>,
) -> std::result::Result<Value<'js>, rquickjs::Error> {
    let slot = slot_from_args(&ctx, &args)?;
    let name = match args.get(1).and_then(Value::as_string) {
        Some(s) => s
            .to_string()
            .map_err(|e| marshal::engine_error(&ctx, e))
            .map_err(|e| throw_error(&ctx, &e))?,
        None => {
            return Err(throw_error(
                &ctx,
                &Error::InvalidCallProtocol("missing property name".to_string()),
            ))
        }
    };

    let getter = {
        let table = state.table.borrow();
        match table.get(slot) {
            Some(BindingEntry::Object(entry)) => entry
                .properties
                .get(&name)
                .and_then(|slots| slots.getter.clone()),
            _ => None,
        }
    };
    let Some(getter) = getter else {
        return Err(throw_error(
            &ctx,
            &Error::InvalidCallProtocol(format!("no getter registered for '{name}'")),
        ));
    };

    match getter() {
        Ok(value) => marshal::js_value_to_script(&ctx, &value).map_err(|e| throw_error(&ctx, &e)),
        Err(e) => Err(throw_error(&ctx, &e)),
    }
}

fn dispatch_set<'js>(
    state: &HostDispatch,
    ctx: Ctx<'js>,
    args: Vec<Value<'js>>,
) -> std::result::Result<Value<'js>, rquickjs::Error> {
    let slot = slot_from_args(&ctx, &args)?;
    let name = match args.get(1).and_then(Value::as_string) {
        Some(s) => s
            .to_string()
            .map_err(|e| marshal::engine_error(&ctx, e))
            .map_err(|e| throw_error(&ctx, &e))?,
        None => {
            return Err(throw_error(
                &ctx,
                &Error::InvalidCallProtocol("missing property name".to_string()),
            ))
        }
    };

    let setter = {
        let table = state.table.borrow();
        match table.get(slot) {
            Some(BindingEntry::Object(entry)) => entry
                .properties
                .get(&name)
                .and_then(|slots| slots.setter.clone()),
            _ => None,
        }
    };
    let Some(setter) = setter else {
        return Err(throw_error(
            &ctx,
            &Error::InvalidCallProtocol(format!("no setter registered for '{name}'")),
        ));
    };

    let value = match args.get(2) {
        Some(v) => marshal::script_to_js_value(&ctx, v).map_err(|e| throw_error(&ctx, &e))?,
        None => JsValue::Undefined,
    };

    match setter(value) {
        Ok(()) => Ok(Value::new_undefined(ctx.clone())),
        Err(e) => Err(throw_error(&ctx, &e)),
    }
}
