//! Execution context
//!
//! A dedicated thread owning the [`Registry`]. Requests arrive on a FIFO
//! channel and are handled strictly one after another; each carries its
//! correlation id and a one-shot reply channel.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use tokio::sync::oneshot;

use crate::abi::{CallArgs, Value};
use crate::call_params::CallParameters;
use crate::config::{Envs, ModuleSet, ServiceConfig, ServiceDescriptor};
use crate::error::HostError;
use crate::logging::LogSink;
use crate::registry::Registry;
use crate::runtime::ControlRuntimeFactory;

use super::ModuleBytes;

pub(crate) enum Command {
    Init {
        control: ModuleBytes,
    },
    CreateService {
        service_id: String,
        modules: ModuleSet,
        config: Option<ServiceConfig>,
        envs: Option<Envs>,
        log_sink: LogSink,
    },
    CallService {
        service_id: String,
        function: String,
        args: CallArgs,
        call_parameters: CallParameters,
    },
    ServiceIds,
    FacadeOf {
        service_id: String,
    },
    Terminate,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Init { .. } => "init",
            Command::CreateService { .. } => "create_service",
            Command::CallService { .. } => "call_service",
            Command::ServiceIds => "service_ids",
            Command::FacadeOf { .. } => "facade_of",
            Command::Terminate => "terminate",
        }
    }
}

#[derive(Debug)]
pub(crate) enum Reply {
    Done(Result<(), HostError>),
    Value(Result<Value, HostError>),
    ServiceIds(Vec<String>),
    Facade(Option<String>),
}

pub(crate) struct Request {
    pub(crate) id: u64,
    pub(crate) command: Command,
    pub(crate) reply: oneshot::Sender<Response>,
}

#[derive(Debug)]
pub(crate) struct Response {
    pub(crate) id: u64,
    pub(crate) reply: Reply,
}

/// Start the execution context thread.
pub(crate) fn spawn<F: ControlRuntimeFactory>(
    factory: F,
    name: String,
) -> std::io::Result<(Sender<Request>, JoinHandle<()>)> {
    let (request_tx, request_rx) = crossbeam_channel::unbounded();
    let handle = thread::Builder::new()
        .name(name)
        .spawn(move || worker_loop(Registry::new(factory), request_rx))?;
    Ok((request_tx, handle))
}

/// Runs until every sender is gone.
fn worker_loop<F: ControlRuntimeFactory>(mut registry: Registry<F>, request_rx: Receiver<Request>) {
    while let Ok(request) = request_rx.recv() {
        let Request { id, command, reply } = request;
        let span = tracing::debug_span!("request", request_id = id, op = command.name());
        let _enter = span.enter();

        let queue_depth = request_rx.len();
        tracing::trace!(queue_depth, "handling request");

        let response = Response {
            id,
            reply: handle_request(&mut registry, command),
        };
        if reply.send(response).is_err() {
            // The caller stopped waiting; the effect still happened.
            tracing::debug!("reply dropped by caller");
        }
    }

    registry.terminate();
    tracing::debug!("execution context stopped");
}

fn handle_request<F: ControlRuntimeFactory>(registry: &mut Registry<F>, command: Command) -> Reply {
    match command {
        Command::Init { control } => Reply::Done(registry.init(&control)),
        Command::CreateService {
            service_id,
            modules,
            config,
            envs,
            log_sink,
        } => Reply::Done(
            registry
                .ensure_initialized()
                .and_then(|_| {
                    ServiceDescriptor::resolve(service_id, modules, config, envs.as_ref())
                        .map_err(HostError::from)
                })
                .and_then(|descriptor| registry.create_service(descriptor, log_sink)),
        ),
        Command::CallService {
            service_id,
            function,
            args,
            call_parameters,
        } => Reply::Value(registry.call_service(&service_id, &function, &args, &call_parameters)),
        Command::ServiceIds => Reply::ServiceIds(registry.service_ids()),
        Command::FacadeOf { service_id } => {
            Reply::Facade(registry.facade_of(&service_id).map(str::to_string))
        }
        Command::Terminate => {
            registry.terminate();
            Reply::Done(Ok(()))
        }
    }
}
