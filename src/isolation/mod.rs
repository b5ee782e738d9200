//! Isolation & Lifecycle
//!
//! [`ServiceHost`] is the public facade. Every operation becomes a request
//! sent to a dedicated execution context that owns the control runtime and
//! the service registry:
//!
//! ```text
//! caller ──Request{id, command}──▶ [FIFO] ──▶ execution context
//!        ◀──Response{id, reply}──────────────┘
//! ```
//!
//! Operations are async. Their effects are applied in arrival order; a
//! dropped future does not cancel its request.

mod payload;
mod worker;

pub use payload::ModuleBytes;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use tokio::sync::oneshot;

use crate::abi::{CallArgs, Value};
use crate::call_params::CallParameters;
use crate::config::{Envs, ServiceConfig};
use crate::error::HostError;
use crate::logging::{tracing_sink, LogSink};
use crate::runtime::{ControlRuntimeFactory, WasmtimeFactory};

use worker::{Command, Reply, Request};

static HOST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Facade over one isolated execution context.
pub struct ServiceHost {
    requests: Sender<Request>,
    next_id: AtomicU64,
    terminated: AtomicBool,
    log_sink: LogSink,
    _worker: JoinHandle<()>,
}

impl ServiceHost {
    /// Host backed by the built-in wasmtime runtime, forwarding guest logs
    /// to `tracing`.
    pub fn new() -> Result<Self, HostError> {
        Self::with_factory(WasmtimeFactory::new(), tracing_sink())
    }

    /// Host backed by the built-in wasmtime runtime with a custom log sink.
    pub fn with_log_sink(log_sink: LogSink) -> Result<Self, HostError> {
        Self::with_factory(WasmtimeFactory::new(), log_sink)
    }

    pub fn with_factory<F: ControlRuntimeFactory>(
        factory: F,
        log_sink: LogSink,
    ) -> Result<Self, HostError> {
        let n = HOST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let (requests, worker) =
            worker::spawn(factory, format!("svchost-{n}")).map_err(HostError::Spawn)?;
        Ok(Self {
            requests,
            next_id: AtomicU64::new(1),
            terminated: AtomicBool::new(false),
            log_sink,
            _worker: worker,
        })
    }

    /// Whether the facade stopped admitting work.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Compile the control module. Must precede every other operation.
    pub async fn init(&self, control_module: impl Into<ModuleBytes>) -> Result<(), HostError> {
        let control = control_module.into();
        match self.request(Command::Init { control }).await? {
            Reply::Done(result) => result,
            other => Err(self.unexpected(other)),
        }
    }

    /// Register a service from `(import_name, bytes)` pairs. The last module
    /// (after applying `config` ordering) is the facade.
    pub async fn create_service<I, N, B>(
        &self,
        modules: I,
        service_id: impl Into<String>,
        config: Option<ServiceConfig>,
        envs: Option<Envs>,
    ) -> Result<(), HostError>
    where
        I: IntoIterator<Item = (N, B)>,
        N: Into<String>,
        B: Into<ModuleBytes>,
    {
        let command = Command::CreateService {
            service_id: service_id.into(),
            modules: modules
                .into_iter()
                .map(|(name, bytes)| (name.into(), bytes.into()))
                .collect(),
            config,
            envs,
            log_sink: self.log_sink.clone(),
        };
        match self.request(command).await? {
            Reply::Done(result) => result,
            other => Err(self.unexpected(other)),
        }
    }

    /// Call `function` on the facade module of `service_id`. Omitted call
    /// parameters are replaced with the neutral default.
    pub async fn call_service(
        &self,
        service_id: impl Into<String>,
        function: impl Into<String>,
        args: impl Into<CallArgs>,
        call_parameters: Option<CallParameters>,
    ) -> Result<Value, HostError> {
        let command = Command::CallService {
            service_id: service_id.into(),
            function: function.into(),
            args: args.into(),
            call_parameters: call_parameters.unwrap_or_default(),
        };
        match self.request(command).await? {
            Reply::Value(result) => result,
            other => Err(self.unexpected(other)),
        }
    }

    /// Ids of registered services, sorted.
    pub async fn service_ids(&self) -> Result<Vec<String>, HostError> {
        match self.request(Command::ServiceIds).await? {
            Reply::ServiceIds(ids) => Ok(ids),
            other => Err(self.unexpected(other)),
        }
    }

    /// Facade module name of a registered service.
    pub async fn facade_of(&self, service_id: impl Into<String>) -> Result<Option<String>, HostError> {
        let command = Command::FacadeOf {
            service_id: service_id.into(),
        };
        match self.request(command).await? {
            Reply::Facade(facade) => Ok(facade),
            other => Err(self.unexpected(other)),
        }
    }

    /// Stop admitting work and discard every service once the work already
    /// queued has run. Idempotent.
    pub async fn terminate(&self) -> Result<(), HostError> {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.send(Command::Terminate).await {
            Ok(_) | Err(HostError::ContextLost) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn request(&self, command: Command) -> Result<Reply, HostError> {
        if self.is_terminated() {
            return Err(HostError::Terminated);
        }
        self.send(command).await
    }

    async fn send(&self, command: Command) -> Result<Reply, HostError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();

        self.requests
            .send(Request {
                id,
                command,
                reply: reply_tx,
            })
            .map_err(|_| self.context_lost(id))?;

        let response = reply_rx.await.map_err(|_| self.context_lost(id))?;
        if response.id != id {
            tracing::error!(expected = id, got = response.id, "reply correlation mismatch");
            return Err(self.context_lost(id));
        }
        Ok(response.reply)
    }

    fn context_lost(&self, id: u64) -> HostError {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            tracing::error!(request_id = id, "execution context is gone, host terminated");
        }
        HostError::ContextLost
    }

    fn unexpected(&self, reply: Reply) -> HostError {
        tracing::error!(?reply, "reply does not match request");
        self.context_lost(0)
    }
}
