//! jsbridge embeds a QuickJS engine behind a `Send` handle and bridges
//! script-visible async functions onto host futures.
//!
//! ```no_run
//! # async fn demo() -> jsbridge::Result<()> {
//! let runtime = jsbridge::JsRuntime::spawn(jsbridge::RuntimeConfig::default())?;
//! runtime
//!     .define_async_function("fetch", |_args| async move { Ok("Hello".into()) })
//!     .await?;
//! let greeting: String = runtime.evaluate("await fetch()").await?;
//! assert_eq!(greeting, "Hello");
//! runtime.close().await?;
//! # Ok(())
//! # }
//! ```

mod runtime;

pub use runtime::{
    Bytecode, Error, FromJsValue, FunctionBinding, FunctionDescriptor, HostAsyncFunction,
    HostFunction, HostGetter, HostSetter, IntoJsValue, JsRuntime, JsValue, MemoryUsage,
    ObjectDescriptor, ObjectHandle, PropertyDescriptor, Result, RuntimeConfig, ScriptError,
};
