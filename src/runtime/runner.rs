//! Runtime thread hosting the engine and the evaluation drain loop.
//!
//! The engine lives on a dedicated OS thread with a single-threaded tokio
//! executor. Commands from [`crate::runtime::handle::JsRuntime`] are
//! forwarded through [`RuntimeCommand`] and executed sequentially on that
//! thread, which also polls the in-flight host jobs spawned by async
//! bindings. Confining everything here is what makes every touch of engine
//! state mutually exclusive with every other.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::poll_fn;
use tokio::sync::{mpsc, oneshot, Notify};

use crate::runtime::bindings::{
    self, BindingEntry, BindingTable, FunctionBinding, ObjectDescriptor, ObjectEntry, ObjectHandle,
    PropertySlots,
};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::engine::{
    Bytecode, EngineContext, HostDispatch, MemoryUsage, PromiseBridge, TopLevel,
};
use crate::runtime::error::{Error, Result, ScriptError};
use crate::runtime::job_driver::{CompletedJob, FuturesUnorderedDriver, JobDriver, JobId};
use crate::runtime::js_value::JsValue;
use crate::runtime::marshal;

type InitSignalChannel = (
    std::sync::mpsc::Sender<Result<()>>,
    std::sync::mpsc::Receiver<Result<()>>,
);

/// What to evaluate: source text or a compiled artifact.
pub(crate) enum EvalSource {
    Source {
        code: String,
        filename: String,
        as_module: bool,
    },
    Bytecode(Bytecode),
}

/// A module queued for loading before the next evaluation.
pub(crate) enum ModuleSource {
    Source { name: String, code: String },
    Bytecode(Bytecode),
}

/// Commands sent to the runtime thread.
pub(crate) enum RuntimeCommand {
    Evaluate {
        source: EvalSource,
        responder: oneshot::Sender<Result<JsValue>>,
    },
    Compile {
        code: String,
        filename: String,
        as_module: bool,
        responder: oneshot::Sender<Result<Bytecode>>,
    },
    DefineFunction {
        name: String,
        binding: FunctionBinding,
        responder: oneshot::Sender<Result<()>>,
    },
    DefineObject {
        name: String,
        descriptor: ObjectDescriptor,
        parent: Option<ObjectHandle>,
        responder: oneshot::Sender<Result<ObjectHandle>>,
    },
    AddModule {
        module: ModuleSource,
        responder: oneshot::Sender<Result<()>>,
    },
    SetMemoryLimit {
        bytes: usize,
        responder: oneshot::Sender<Result<()>>,
    },
    SetMaxStackSize {
        bytes: usize,
        responder: oneshot::Sender<Result<()>>,
    },
    MemoryUsage {
        responder: oneshot::Sender<Result<MemoryUsage>>,
    },
    RunGc {
        responder: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        responder: oneshot::Sender<()>,
    },
}

/// Spawn the runtime thread and hand back its command channel. Fails with
/// `EngineInit` if the engine could not be brought up; partial state is
/// released on the runtime thread before the failure is reported.
pub(crate) fn spawn_runtime_thread(
    config: RuntimeConfig,
    closing: Arc<AtomicBool>,
    close_notify: Arc<Notify>,
) -> Result<mpsc::UnboundedSender<RuntimeCommand>> {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<RuntimeCommand>();
    let (init_tx, init_rx): InitSignalChannel = std::sync::mpsc::channel();

    std::thread::Builder::new()
        .name("jsbridge-runtime".to_string())
        .spawn(move || {
            let tokio_rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = init_tx.send(Err(Error::EngineInit(format!(
                        "building runtime thread executor: {e}"
                    ))));
                    return;
                }
            };

            let mut core = match RuntimeCore::new(&config, closing, close_notify) {
                Ok(core) => {
                    let _ = init_tx.send(Ok(()));
                    core
                }
                Err(e) => {
                    let _ = init_tx.send(Err(e));
                    return;
                }
            };

            tokio_rt.block_on(async move {
                core.run(cmd_rx).await;
            });
        })
        .map_err(|e| Error::EngineInit(format!("failed to spawn runtime thread: {e}")))?;

    match init_rx.recv() {
        Ok(Ok(())) => Ok(cmd_tx),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(Error::EngineInit(
            "runtime thread initialization failed".to_string(),
        )),
    }
}

struct RuntimeCore {
    // declared before the engine so promise capabilities and job futures are
    // released while the engine still exists
    bridges: Rc<RefCell<HashMap<JobId, PromiseBridge>>>,
    driver: Rc<FuturesUnorderedDriver>,
    table: Rc<RefCell<BindingTable>>,
    pending_modules: VecDeque<ModuleSource>,
    /// Captured-exception slot; first writer wins within one evaluation.
    captured: Option<Error>,
    execution_timeout: Option<Duration>,
    closing: Arc<AtomicBool>,
    close_notify: Arc<Notify>,
    engine: EngineContext,
}

impl RuntimeCore {
    fn new(
        config: &RuntimeConfig,
        closing: Arc<AtomicBool>,
        close_notify: Arc<Notify>,
    ) -> Result<Self> {
        let engine = EngineContext::new(config)?;
        let table = Rc::new(RefCell::new(BindingTable::new()));
        let driver = Rc::new(FuturesUnorderedDriver::default());
        let bridges = Rc::new(RefCell::new(HashMap::new()));

        engine.install_dispatch(HostDispatch {
            table: Rc::clone(&table),
            driver: Rc::clone(&driver),
            bridges: Rc::clone(&bridges),
            next_job: Rc::new(Cell::new(0)),
        })?;

        Ok(Self {
            bridges,
            driver,
            table,
            pending_modules: VecDeque::new(),
            captured: None,
            execution_timeout: config.execution_timeout,
            closing,
            close_notify,
            engine,
        })
    }

    async fn run(&mut self, mut rx: mpsc::UnboundedReceiver<RuntimeCommand>) {
        loop {
            let driver = Rc::clone(&self.driver);
            let has_jobs = !self.driver.is_empty();
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(RuntimeCommand::Evaluate { source, responder }) => {
                            let result = self.evaluate(source).await;
                            let _ = responder.send(result);
                        }
                        Some(RuntimeCommand::Compile { code, filename, as_module, responder }) => {
                            let result = self.compile(&code, &filename, as_module);
                            let _ = responder.send(result);
                        }
                        Some(RuntimeCommand::DefineFunction { name, binding, responder }) => {
                            let result = self.define_function(&name, binding);
                            let _ = responder.send(result);
                        }
                        Some(RuntimeCommand::DefineObject { name, descriptor, parent, responder }) => {
                            let result = self.define_object(&name, descriptor, parent);
                            let _ = responder.send(result);
                        }
                        Some(RuntimeCommand::AddModule { module, responder }) => {
                            self.pending_modules.push_back(module);
                            let _ = responder.send(Ok(()));
                        }
                        Some(RuntimeCommand::SetMemoryLimit { bytes, responder }) => {
                            self.engine.set_memory_limit(bytes);
                            let _ = responder.send(Ok(()));
                        }
                        Some(RuntimeCommand::SetMaxStackSize { bytes, responder }) => {
                            self.engine.set_max_stack_size(bytes);
                            let _ = responder.send(Ok(()));
                        }
                        Some(RuntimeCommand::MemoryUsage { responder }) => {
                            let _ = responder.send(Ok(self.engine.memory_usage()));
                        }
                        Some(RuntimeCommand::RunGc { responder }) => {
                            self.engine.run_gc();
                            let _ = responder.send(Ok(()));
                        }
                        Some(RuntimeCommand::Shutdown { responder }) => {
                            self.shutdown();
                            let _ = responder.send(());
                            break;
                        }
                        None => {
                            self.shutdown();
                            break;
                        }
                    }
                }
                // Jobs that outlived their evaluation still settle under
                // engine exclusion, between commands.
                completed = poll_fn(move |cx| driver.poll_ready(cx)), if has_jobs => {
                    self.settle(completed);
                    self.drain_microtasks();
                }
            }
        }
    }

    /// One full evaluation: load modules, submit, drain until quiescent.
    async fn evaluate(&mut self, source: EvalSource) -> Result<JsValue> {
        if self.closing.load(Ordering::Acquire) {
            return Err(Error::ClosedRuntime);
        }

        // fresh captured-exception slot for this evaluation
        self.captured = None;
        let _ = self.engine.take_unhandled_rejection();

        tracing::debug!("evaluation started");
        let result = match self.execution_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.evaluate_inner(source)).await {
                Ok(result) => result,
                Err(_) => {
                    self.cancel_outstanding();
                    Err(Error::EvaluationTimedOut(limit.as_millis() as u64))
                }
            },
            None => self.evaluate_inner(source).await,
        };
        match &result {
            Ok(_) => tracing::debug!("evaluation finished"),
            Err(e) => tracing::debug!(error = %e, "evaluation failed"),
        }
        result
    }

    async fn evaluate_inner(&mut self, source: EvalSource) -> Result<JsValue> {
        // load registered modules in registration order; a failure aborts
        while let Some(module) = self.pending_modules.pop_front() {
            self.load_module(module)?;
            if self.captured.is_some() {
                return Err(self.take_failure());
            }
        }

        // submit the top level; the result is promise-shaped either way
        let submitted = match &source {
            EvalSource::Source {
                code,
                filename,
                as_module,
            } => self.engine.eval_source(code, filename, *as_module),
            EvalSource::Bytecode(bytecode) => self.engine.eval_bytecode(bytecode),
        };
        if let Err(e) = submitted {
            self.capture(e);
            return Err(self.take_failure());
        }

        loop {
            // (a) run the microtask queue to exhaustion
            self.drain_microtasks();
            if self.captured.is_some() {
                return Err(self.take_failure());
            }

            match self.engine.poll_top() {
                TopLevel::Done(Ok(value)) => {
                    if self.driver.is_empty() {
                        return Ok(value);
                    }
                    // resolved, but host jobs are still outstanding; the
                    // evaluation only ends at quiescence
                }
                TopLevel::Done(Err(e)) => {
                    // first rejection short-circuits the evaluation; jobs
                    // already started keep running
                    self.capture(e);
                    return Err(self.take_failure());
                }
                TopLevel::Pending => {}
            }

            // (b) collect the outstanding job set; stop if empty
            if self.driver.is_empty() {
                break;
            }

            let driver = Rc::clone(&self.driver);
            let close_notify = Arc::clone(&self.close_notify);
            tokio::select! {
                completed = poll_fn(move |cx| driver.poll_ready(cx)) => {
                    self.settle(completed);
                }
                _ = close_notify.notified() => {
                    tracing::debug!("runtime closing; cancelling evaluation");
                    self.cancel_outstanding();
                    return Err(Error::Cancelled);
                }
            }
        }

        if let Some(e) = self.captured.take() {
            return Err(e);
        }
        match self.engine.poll_top() {
            TopLevel::Done(Ok(value)) => Ok(value),
            TopLevel::Done(Err(e)) => Err(e),
            // quiescent with a pending top promise: nothing can ever settle it
            TopLevel::Pending => Ok(JsValue::Undefined),
        }
    }

    /// Compile-only path; shares the module-loading prologue with evaluation.
    fn compile(&mut self, code: &str, filename: &str, as_module: bool) -> Result<Bytecode> {
        self.captured = None;
        while let Some(module) = self.pending_modules.pop_front() {
            self.load_module(module)?;
            if self.captured.is_some() {
                return Err(self.take_failure());
            }
        }
        self.engine.compile(code, filename, as_module)
    }

    fn load_module(&mut self, module: ModuleSource) -> Result<()> {
        match &module {
            ModuleSource::Source { name, code } => {
                tracing::debug!(module = %name, "loading module");
                self.engine.eval_module_source(name, code)?;
            }
            ModuleSource::Bytecode(bytecode) => {
                if !bytecode.is_module() {
                    return Err(Error::BytecodeRead(
                        "bytecode does not contain a module".to_string(),
                    ));
                }
                tracing::debug!("loading module from bytecode");
                self.engine.eval_bytecode(bytecode)?;
            }
        }
        self.drain_microtasks();
        match self.engine.poll_top() {
            TopLevel::Done(Err(e)) => Err(e),
            // a module still blocked on a host job finishes during the main
            // drain
            _ => Ok(()),
        }
    }

    fn define_function(&mut self, name: &str, binding: FunctionBinding) -> Result<()> {
        bindings::validate_name(name)?;
        let is_async = binding.is_async();
        let slot = self
            .table
            .borrow_mut()
            .insert(BindingEntry::Function(binding));
        match self.engine.register_function(None, name, slot, is_async) {
            Ok(()) => {
                tracing::debug!(name, slot, is_async, "binding registered");
                Ok(())
            }
            Err(e) => {
                self.table.borrow_mut().remove(slot);
                Err(e)
            }
        }
    }

    fn define_object(
        &mut self,
        name: &str,
        descriptor: ObjectDescriptor,
        parent: Option<ObjectHandle>,
    ) -> Result<ObjectHandle> {
        bindings::validate_name(name)?;
        let parent_slot = match parent {
            Some(handle) => Some(self.table.borrow().resolve_object(handle)?),
            None => None,
        };

        let ObjectDescriptor {
            properties,
            functions,
        } = descriptor;

        let mut prop_meta = Vec::with_capacity(properties.len());
        let mut prop_map = HashMap::new();
        for prop in properties {
            bindings::validate_name(&prop.name)?;
            prop_meta.push((prop.name.clone(), prop.getter.is_some(), prop.setter.is_some()));
            prop_map.insert(
                prop.name,
                PropertySlots {
                    getter: prop.getter,
                    setter: prop.setter,
                },
            );
        }

        let slot = self
            .table
            .borrow_mut()
            .insert(BindingEntry::Object(ObjectEntry {
                properties: prop_map,
            }));
        if let Err(e) = self.engine.register_object(parent_slot, name, slot) {
            self.table.borrow_mut().remove(slot);
            return Err(e);
        }

        for (prop_name, has_getter, has_setter) in prop_meta {
            self.engine
                .register_property(slot, &prop_name, has_getter, has_setter)?;
        }

        for func in functions {
            bindings::validate_name(&func.name)?;
            let is_async = func.binding.is_async();
            let fn_slot = self
                .table
                .borrow_mut()
                .insert(BindingEntry::Function(func.binding));
            if let Err(e) = self
                .engine
                .register_function(Some(slot), &func.name, fn_slot, is_async)
            {
                self.table.borrow_mut().remove(fn_slot);
                return Err(e);
            }
        }

        tracing::debug!(name, slot, "object binding registered");
        Ok(ObjectHandle {
            index: slot,
            generation: self.table.borrow().generation(),
        })
    }

    /// Deliver one job outcome through its promise bridge, then run the
    /// dedicated microtask pump so the continuation becomes eligible.
    fn settle(&mut self, completed: CompletedJob) {
        let CompletedJob { job_id, outcome } = completed;
        let bridge = self.bridges.borrow_mut().remove(&job_id);
        let Some(bridge) = bridge else {
            tracing::trace!(job_id, "completion for cancelled job ignored");
            return;
        };

        let settled = self.engine.with(|ctx| -> Result<()> {
            let PromiseBridge { resolve, reject } = bridge;
            match outcome {
                Ok(value) => match marshal::js_value_to_script(ctx, &value) {
                    Ok(script_value) => {
                        let resolve = resolve
                            .restore(ctx)
                            .map_err(|e| marshal::engine_error(ctx, e))?;
                        resolve
                            .call::<_, ()>((script_value,))
                            .map_err(|e| marshal::engine_error(ctx, e))
                    }
                    Err(e) => {
                        // a result that cannot cross the boundary rejects the
                        // promise instead of vanishing
                        let err_value = marshal::host_error_to_script(ctx, &e)?;
                        let reject = reject
                            .restore(ctx)
                            .map_err(|e2| marshal::engine_error(ctx, e2))?;
                        reject
                            .call::<_, ()>((err_value,))
                            .map_err(|e2| marshal::engine_error(ctx, e2))
                    }
                },
                Err(e) => {
                    let err_value = marshal::host_error_to_script(ctx, &e)?;
                    let reject = reject
                        .restore(ctx)
                        .map_err(|e2| marshal::engine_error(ctx, e2))?;
                    reject
                        .call::<_, ()>((err_value,))
                        .map_err(|e2| marshal::engine_error(ctx, e2))
                }
            }
        });

        match settled {
            Ok(()) => tracing::trace!(job_id, "job settled"),
            Err(e) => {
                tracing::warn!(job_id, error = %e, "failed to settle job promise");
                self.capture(e);
            }
        }

        self.pump_once();
    }

    /// Run microtasks to exhaustion, then fold any engine-reported failures
    /// and unhandled rejections into the captured-exception slot.
    fn drain_microtasks(&mut self) {
        let mut errors = Vec::new();
        self.engine.run_microtasks(&mut |e| errors.push(e));
        for e in errors {
            self.capture(e);
        }
        if let Some(message) = self.engine.take_unhandled_rejection() {
            tracing::debug!(%message, "unhandled promise rejection; cancelling outstanding jobs");
            self.cancel_outstanding();
            self.capture(Error::Script(ScriptError {
                name: "UnhandledPromiseRejection".to_string(),
                message,
                stack: Vec::new(),
            }));
        }
    }

    fn pump_once(&mut self) {
        let mut errors = Vec::new();
        self.engine.pump_one(&mut |e| errors.push(e));
        for e in errors {
            self.capture(e);
        }
    }

    /// First writer wins; later failures within the same evaluation are
    /// dropped by design.
    fn capture(&mut self, err: Error) {
        if self.captured.is_none() {
            self.captured = Some(err);
        } else {
            tracing::trace!(error = %err, "dropping secondary failure");
        }
    }

    fn take_failure(&mut self) -> Error {
        self.captured.take().unwrap_or_else(|| {
            Error::Script(ScriptError::new(
                "InternalError",
                "evaluation failed with no recorded exception",
            ))
        })
    }

    /// Drop every in-flight job and its promise bridge. A cancelled job never
    /// resolves or rejects.
    fn cancel_outstanding(&mut self) {
        self.driver.cancel_pending();
        self.bridges.borrow_mut().clear();
    }

    fn shutdown(&mut self) {
        let leaked = self.driver.len();
        if leaked > 0 {
            tracing::warn!(jobs = leaked, "cancelling host jobs still in flight at shutdown");
        }
        self.driver.shutdown();
        self.bridges.borrow_mut().clear();
        self.table.borrow_mut().clear();
        self.pending_modules.clear();
    }
}
