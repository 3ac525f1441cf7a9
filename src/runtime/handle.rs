//! Public handle for interacting with the runtime thread.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex, Notify};

use crate::runtime::bindings::{FunctionBinding, HostAsyncFunction, ObjectDescriptor, ObjectHandle};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::conversion::FromJsValue;
use crate::runtime::engine::{Bytecode, MemoryUsage};
use crate::runtime::error::{Error, Result};
use crate::runtime::js_value::JsValue;
use crate::runtime::runner::{spawn_runtime_thread, EvalSource, ModuleSource, RuntimeCommand};

/// Default diagnostics filename for source evaluation and compilation.
pub const DEFAULT_FILENAME: &str = "main.js";

/// A handle to an embedded JavaScript runtime.
///
/// The engine itself lives on a dedicated thread; the handle is `Send`,
/// cheap to clone, and usable from any async context. Exactly one evaluation
/// is in flight at a time: concurrent [`JsRuntime::evaluate`] calls queue on
/// the evaluation lock rather than failing.
///
/// ```no_run
/// # async fn demo() -> jsbridge::Result<()> {
/// let runtime = jsbridge::JsRuntime::spawn(jsbridge::RuntimeConfig::default())?;
/// runtime
///     .define_async_function("fetch", |_args| async move { Ok("Hello".into()) })
///     .await?;
/// let greeting: String = runtime.evaluate("await fetch()").await?;
/// assert_eq!(greeting, "Hello");
/// runtime.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct JsRuntime {
    tx: mpsc::UnboundedSender<RuntimeCommand>,
    eval_lock: Arc<Mutex<()>>,
    close_lock: Arc<Mutex<()>>,
    closing: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    close_notify: Arc<Notify>,
}

impl JsRuntime {
    /// Spawn a runtime thread and bring up an engine on it.
    pub fn spawn(config: RuntimeConfig) -> Result<Self> {
        let closing = Arc::new(AtomicBool::new(false));
        let close_notify = Arc::new(Notify::new());
        let tx = spawn_runtime_thread(config, Arc::clone(&closing), Arc::clone(&close_notify))?;
        Ok(Self {
            tx,
            eval_lock: Arc::new(Mutex::new(())),
            close_lock: Arc::new(Mutex::new(())),
            closing,
            closed: Arc::new(AtomicBool::new(false)),
            close_notify,
        })
    }

    /// Evaluate source and extract the result as `T`.
    ///
    /// Suspends until the script is quiescent: the engine's microtask queue
    /// is empty and every host job the script started has completed.
    pub async fn evaluate<T: FromJsValue>(&self, code: &str) -> Result<T> {
        self.evaluate_with(code, DEFAULT_FILENAME, false)
            .await
            .and_then(T::from_js_value)
    }

    /// Evaluate source with an explicit diagnostics filename, optionally as a
    /// module.
    pub async fn evaluate_with(
        &self,
        code: &str,
        filename: &str,
        as_module: bool,
    ) -> Result<JsValue> {
        self.run_evaluation(EvalSource::Source {
            code: code.to_string(),
            filename: filename.to_string(),
            as_module,
        })
        .await
    }

    /// Evaluate previously compiled bytecode.
    pub async fn evaluate_bytecode<T: FromJsValue>(&self, bytecode: &Bytecode) -> Result<T> {
        self.run_evaluation(EvalSource::Bytecode(bytecode.clone()))
            .await
            .and_then(T::from_js_value)
    }

    async fn run_evaluation(&self, source: EvalSource) -> Result<JsValue> {
        self.ensure_open()?;
        // the evaluation lock: a serialization point, not an error path
        let _guard = self.eval_lock.lock().await;
        self.ensure_open()?;

        let (responder, rx) = oneshot::channel();
        self.send(RuntimeCommand::Evaluate { source, responder })?;
        rx.await.map_err(|_| Error::ClosedRuntime)?
    }

    /// Compile source to bytecode without executing it.
    pub async fn compile(&self, code: &str, filename: &str, as_module: bool) -> Result<Bytecode> {
        self.ensure_open()?;
        let _guard = self.eval_lock.lock().await;
        self.ensure_open()?;

        let (responder, rx) = oneshot::channel();
        self.send(RuntimeCommand::Compile {
            code: code.to_string(),
            filename: filename.to_string(),
            as_module,
            responder,
        })?;
        rx.await.map_err(|_| Error::ClosedRuntime)?
    }

    /// Expose a synchronous host function to script under a global name.
    pub async fn define_function<F>(&self, name: &str, f: F) -> Result<()>
    where
        F: Fn(Vec<JsValue>) -> Result<JsValue> + Send + Sync + 'static,
    {
        self.define_binding(name, FunctionBinding::sync(f)).await
    }

    /// Expose an asynchronous host function to script under a global name.
    ///
    /// The call site in script receives a `Promise`; the future runs on the
    /// runtime thread and may suspend freely without blocking the engine.
    pub async fn define_async_function<F, Fut>(&self, name: &str, f: F) -> Result<()>
    where
        F: Fn(Vec<JsValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JsValue>> + 'static,
    {
        let callable: HostAsyncFunction = Arc::new(move |args| Box::pin(f(args)));
        self.define_binding(name, FunctionBinding::Async(callable))
            .await
    }

    async fn define_binding(&self, name: &str, binding: FunctionBinding) -> Result<()> {
        self.ensure_open()?;
        let (responder, rx) = oneshot::channel();
        self.send(RuntimeCommand::DefineFunction {
            name: name.to_string(),
            binding,
            responder,
        })?;
        rx.await.map_err(|_| Error::ClosedRuntime)?
    }

    /// Expose a host object with properties and functions. Returns a handle
    /// usable as the `parent` of nested registrations; handles go stale when
    /// the runtime closes.
    pub async fn define_object(
        &self,
        name: &str,
        descriptor: ObjectDescriptor,
        parent: Option<ObjectHandle>,
    ) -> Result<ObjectHandle> {
        self.ensure_open()?;
        let (responder, rx) = oneshot::channel();
        self.send(RuntimeCommand::DefineObject {
            name: name.to_string(),
            descriptor,
            parent,
            responder,
        })?;
        rx.await.map_err(|_| Error::ClosedRuntime)?
    }

    /// Register a module from source. Modules are loaded lazily, in
    /// registration order, before the next evaluation; the module then
    /// becomes importable under `name`.
    pub async fn add_module(&self, name: &str, code: &str) -> Result<()> {
        self.queue_module(ModuleSource::Source {
            name: name.to_string(),
            code: code.to_string(),
        })
        .await
    }

    /// Register a module from bytecode produced by [`JsRuntime::compile`]
    /// with the module flag set.
    pub async fn add_module_bytecode(&self, bytecode: Bytecode) -> Result<()> {
        self.queue_module(ModuleSource::Bytecode(bytecode)).await
    }

    async fn queue_module(&self, module: ModuleSource) -> Result<()> {
        self.ensure_open()?;
        let (responder, rx) = oneshot::channel();
        self.send(RuntimeCommand::AddModule { module, responder })?;
        rx.await.map_err(|_| Error::ClosedRuntime)?
    }

    /// Cap the engine's heap, applied immediately.
    pub async fn set_memory_limit(&self, bytes: usize) -> Result<()> {
        self.ensure_open()?;
        let (responder, rx) = oneshot::channel();
        self.send(RuntimeCommand::SetMemoryLimit { bytes, responder })?;
        rx.await.map_err(|_| Error::ClosedRuntime)?
    }

    /// Cap the engine's native stack, applied immediately.
    pub async fn set_max_stack_size(&self, bytes: usize) -> Result<()> {
        self.ensure_open()?;
        let (responder, rx) = oneshot::channel();
        self.send(RuntimeCommand::SetMaxStackSize { bytes, responder })?;
        rx.await.map_err(|_| Error::ClosedRuntime)?
    }

    /// Snapshot the engine's memory accounting.
    pub async fn memory_usage(&self) -> Result<MemoryUsage> {
        self.ensure_open()?;
        let (responder, rx) = oneshot::channel();
        self.send(RuntimeCommand::MemoryUsage { responder })?;
        rx.await.map_err(|_| Error::ClosedRuntime)?
    }

    /// Force a garbage collection pass.
    pub async fn gc(&self) -> Result<()> {
        self.ensure_open()?;
        let (responder, rx) = oneshot::channel();
        self.send(RuntimeCommand::RunGc { responder })?;
        rx.await.map_err(|_| Error::ClosedRuntime)?
    }

    /// Whether the runtime has been closed (or is closing).
    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Tear the runtime down: cancel outstanding jobs, clear bindings, and
    /// release engine state. Idempotent and safe to call from any state; an
    /// in-flight evaluation fails with [`Error::Cancelled`].
    pub async fn close(&self) -> Result<()> {
        let _guard = self.close_lock.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }

        self.closing.store(true, Ordering::Release);
        // notify_one stores a permit, so an evaluation that starts waiting
        // after this still observes the close
        self.close_notify.notify_one();

        let (responder, rx) = oneshot::channel();
        if self
            .tx
            .send(RuntimeCommand::Shutdown { responder })
            .is_ok()
        {
            let _ = rx.await;
        }
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closing.load(Ordering::Acquire) {
            Err(Error::ClosedRuntime)
        } else {
            Ok(())
        }
    }

    fn send(&self, command: RuntimeCommand) -> Result<()> {
        self.tx.send(command).map_err(|_| Error::ClosedRuntime)
    }
}
