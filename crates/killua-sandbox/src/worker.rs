//! The worker process side of the isolation boundary.
//!
//! A worker reads one [`Job`] from its input pipe, runs the guest, streams
//! each reply back as a [`WorkerMessage`], closes the pipe and exits. The
//! exit status tells the parent how the guest finished.

use std::io::{self, Read, Write};

use crate::error::{Result, SandboxError};
use crate::ipc::{FramedReader, FramedWriter, Job};
use crate::wasm::{Bridge, WasiShim, WasmInstance, WasmSandbox};

/// How a worker finished, carried in its exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum WorkerExit {
    /// The guest entry point returned, or called `proc_exit(0)`
    Completed = 0,
    /// The guest trapped or a host call failed
    Faulted = 70,
    /// The job could not be decoded or the module would not load
    Rejected = 71,
    /// The guest called `proc_exit` with a non-zero code
    Exited = 72,
}

impl WorkerExit {
    /// Process exit code.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Parse a process exit code.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(WorkerExit::Completed),
            70 => Some(WorkerExit::Faulted),
            71 => Some(WorkerExit::Rejected),
            72 => Some(WorkerExit::Exited),
            _ => None,
        }
    }
}

/// Run one job from stdin, replying on stdout.
pub fn serve_stdio() -> WorkerExit {
    serve(io::stdin().lock(), io::stdout())
}

/// Run one job read from `input`, replying on `output`.
pub fn serve<R: Read, W: Write + Send + 'static>(input: R, output: W) -> WorkerExit {
    let job = match receive_job(input) {
        Ok(job) => job,
        Err(e) => {
            tracing::warn!("rejecting job: {}", e);
            return WorkerExit::Rejected;
        }
    };

    let mut instance = match prepare(job, output) {
        Ok(instance) => instance,
        Err(e) => {
            tracing::warn!("rejecting job: {}", e);
            return WorkerExit::Rejected;
        }
    };

    let exit = match instance.run() {
        Ok(call) => {
            tracing::debug!(
                elapsed_us = call.execution_time_us,
                fuel = ?call.fuel_consumed,
                replies = instance.replies(),
                "guest returned"
            );
            WorkerExit::Completed
        }
        Err(SandboxError::ProcExit(0)) => WorkerExit::Completed,
        Err(SandboxError::ProcExit(code)) => {
            tracing::info!(code, "guest exited");
            WorkerExit::Exited
        }
        Err(e) => {
            tracing::warn!(category = ?e.category(), "guest faulted: {}", e);
            WorkerExit::Faulted
        }
    };

    if let Err(e) = instance.close_replies() {
        tracing::warn!("failed to close reply pipe: {}", e);
        if exit == WorkerExit::Completed {
            return WorkerExit::Faulted;
        }
    }
    exit
}

fn receive_job<R: Read>(input: R) -> Result<Job<'static>> {
    let mut reader = FramedReader::new(input);
    let job: Job<'static> = reader.recv()?;

    // The parent closes its side right after the job.
    match reader.recv::<()>() {
        Err(e) if e.is_end_of_stream() => Ok(job),
        Ok(()) => Err(SandboxError::Corrupt("unexpected second job".to_string())),
        Err(e) => Err(e),
    }
}

fn prepare<W: Write + Send + 'static>(job: Job<'static>, output: W) -> Result<WasmInstance> {
    let sandbox = WasmSandbox::new(job.config.clone())?;

    // SAFETY: the bytes come from `serialize_module` in the parent, over a
    // pipe only the parent can write to, with the same engine config.
    let module = unsafe { sandbox.deserialize_module("guest", &job.module)? };

    // Stdout carries the reply frames, so echoed guest output goes to stderr.
    let wasi = if job.config.echo_output {
        WasiShim::with_streams(true, Box::new(io::stderr()), Box::new(io::stderr()))
    } else {
        WasiShim::new(false)
    };
    let bridge = Bridge::new(job.source.into_owned(), Box::new(FramedWriter::new(output)))
        .with_context(job.context);

    sandbox.instantiate(&module, wasi, bridge)
}
