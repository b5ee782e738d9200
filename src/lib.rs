//! svchost: a multi-module WebAssembly service host
//!
//! Hosts one or more WebAssembly modules as a composed service and exposes
//! a JSON call interface to it. Calls always go to the service's facade
//! module, the last module of the service, which may in turn call into the
//! modules listed before it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  ServiceHost (async facade, caller threads)  │
//! ├──────────────── FIFO requests ───────────────┤
//! │  execution context thread                    │
//! │    registry  - lifecycle, service map        │
//! │    abi       - JSON args / result envelope   │
//! │    runtime   - control runtime (wasmtime)    │
//! │    logging   - guest log bridge              │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use svchost::{CallArgs, ServiceHost};
//!
//! let host = ServiceHost::new()?;
//! host.init(control_wasm).await?;
//! host.create_service([("greeting", greeting_wasm)], "srv", None, None).await?;
//! let result = host
//!     .call_service("srv", "greeting", CallArgs::positional(["test"]), None)
//!     .await?;
//! assert_eq!(result.as_str(), Some("Hi, test"));
//! ```

pub mod abi;
pub mod call_params;
pub mod config;
pub mod error;
pub mod isolation;
pub mod logging;
pub mod registry;
pub mod runtime;

pub use abi::{CallArgs, MarshalError, ResultEnvelope, Value};
pub use call_params::{CallParameters, ParticleParameters, SecurityTetraplet};
pub use config::{ConfigError, Envs, ModuleConfig, ModuleEntry, ServiceConfig, ServiceDescriptor, WasiConfig};
pub use error::{GuestError, HostError};
pub use isolation::{ModuleBytes, ServiceHost};
pub use logging::{LogLevel, LogMessage, LogSink, LoggingMask};
pub use runtime::{ControlRuntime, ControlRuntimeFactory, RuntimeError, WasmtimeFactory};
