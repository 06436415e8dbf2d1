//! Minimal WASI preview 1 surface for guest modules.
//!
//! Only `random_get` and `fd_write` do real work. Everything else the guest's
//! libc imports is registered as a blank that logs its name and returns
//! `ERRNO_NOSYS`, so instantiation resolves every import. `proc_exit` ends
//! the guest call with [`SandboxError::ProcExit`].

use std::io::{self, Write};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use wasmtime::Memory;

use super::host::{GuestFunction, HostApi};
use super::memory::MemoryView;
use super::pointer::{WasmPtr, WasmSlice};
use super::value::{WasmKind, WasmValue};
use crate::error::{Result, SandboxError};

/// Import module name used by wasi-libc.
pub const WASI_MODULE: &str = "wasi_snapshot_preview1";

/// Success.
pub const ERRNO_SUCCESS: u32 = 0;
/// Bad file descriptor.
pub const ERRNO_BADF: u32 = 8;
/// Function not supported.
pub const ERRNO_NOSYS: u32 = 52;

const STDOUT: u32 = 1;
const STDERR: u32 = 2;

/// Size of one `ciovec` entry: a 4-byte pointer followed by a 4-byte length.
const IOVEC_SIZE: u32 = 8;

use WasmKind::{I32, I64};

/// Blank imports with their ABI signatures `(params, results)`.
const BLANKS: &[(&str, &[WasmKind], &[WasmKind])] = &[
    ("args_get", &[I32, I32], &[I32]),
    ("args_sizes_get", &[I32, I32], &[I32]),
    ("clock_time_get", &[I32, I64, I32], &[I32]),
    ("environ_get", &[I32, I32], &[I32]),
    ("environ_sizes_get", &[I32, I32], &[I32]),
    ("fd_close", &[I32], &[I32]),
    ("fd_fdstat_get", &[I32, I32], &[I32]),
    ("fd_filestat_get", &[I32, I32], &[I32]),
    ("fd_filestat_set_size", &[I32, I64], &[I32]),
    ("fd_prestat_dir_name", &[I32, I32, I32], &[I32]),
    ("fd_prestat_get", &[I32, I32], &[I32]),
    ("fd_read", &[I32, I32, I32, I32], &[I32]),
    ("fd_readdir", &[I32, I32, I32, I64, I32], &[I32]),
    ("fd_seek", &[I32, I64, I32, I32], &[I32]),
    ("fd_sync", &[I32], &[I32]),
    ("path_create_directory", &[I32, I32, I32], &[I32]),
    ("path_filestat_get", &[I32, I32, I32, I32, I32], &[I32]),
    ("path_link", &[I32, I32, I32, I32, I32, I32, I32], &[I32]),
    ("path_open", &[I32, I32, I32, I32, I32, I64, I64, I32, I32], &[I32]),
    ("path_readlink", &[I32, I32, I32, I32, I32, I32], &[I32]),
    ("path_remove_directory", &[I32, I32, I32], &[I32]),
    ("path_rename", &[I32, I32, I32, I32, I32, I32], &[I32]),
    ("path_unlink_file", &[I32, I32, I32], &[I32]),
    ("poll_oneoff", &[I32, I32, I32, I32], &[I32]),
    ("sched_yield", &[], &[I32]),
];

/// Host state behind the WASI imports of one guest instance.
pub struct WasiShim {
    loopback: bool,
    rng: StdRng,
    stdout: Box<dyn Write + Send>,
    stderr: Box<dyn Write + Send>,
    memory: Option<Memory>,
}

impl WasiShim {
    /// Shim writing guest output to the host's stdout and stderr when
    /// `loopback` is set.
    pub fn new(loopback: bool) -> Self {
        Self::with_streams(loopback, Box::new(io::stdout()), Box::new(io::stderr()))
    }

    /// Shim with explicit sinks for guest fd 1 and fd 2.
    pub fn with_streams(
        loopback: bool,
        stdout: Box<dyn Write + Send>,
        stderr: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            loopback,
            rng: StdRng::from_entropy(),
            stdout,
            stderr,
            memory: None,
        }
    }

    /// Whether guest output is copied to the host streams.
    pub fn loopback(&self) -> bool {
        self.loopback
    }

    /// Fill `buf_len` bytes at `buf` with secure random data.
    pub fn random_get(&mut self, memory: &mut MemoryView<'_>, buf: WasmPtr, buf_len: u32) -> Result<u32> {
        let target = memory.read_mut(buf.address(), buf_len as usize)?;
        self.rng.fill_bytes(target);
        Ok(ERRNO_SUCCESS)
    }

    /// Gather `iovs_len` vectors at `iovs` and write them to `fd`.
    ///
    /// The total byte count is stored at `written` for stdout and stderr in
    /// both modes; only loopback mode copies the bytes. Other descriptors
    /// return `ERRNO_BADF` and leave `written` alone.
    pub fn fd_write(
        &mut self,
        memory: &mut MemoryView<'_>,
        fd: u32,
        iovs: WasmPtr,
        iovs_len: u32,
        written: WasmPtr,
    ) -> Result<u32> {
        if fd != STDOUT && fd != STDERR {
            tracing::debug!(fd, "fd_write to unsupported descriptor");
            return Ok(ERRNO_BADF);
        }

        // Each iovec goes straight out; repeated iovecs never accumulate.
        let mut stream = match (self.loopback, fd) {
            (false, _) => None,
            (true, STDOUT) => Some(&mut self.stdout),
            (true, _) => Some(&mut self.stderr),
        };

        let mut total: u32 = 0;
        for index in 0..iovs_len {
            let entry = iovs.offset(index.wrapping_mul(IOVEC_SIZE));
            let vec: WasmSlice = entry.read(memory)?;
            total = total.wrapping_add(vec.len);
            if let Some(stream) = stream.as_mut() {
                stream.write_all(vec.bytes(memory)?)?;
            }
        }

        if let Some(stream) = stream {
            stream.flush()?;
        }

        written.write(memory, &total)?;
        Ok(ERRNO_SUCCESS)
    }
}

impl HostApi for WasiShim {
    const MODULE: &'static str = WASI_MODULE;

    fn functions() -> Result<Vec<GuestFunction<Self>>> {
        let mut functions = vec![
            GuestFunction::wrap(
                "random_get",
                |wasi: &mut Self, memory: &mut MemoryView<'_>, (buf, buf_len): (WasmPtr, u32)| {
                    wasi.random_get(memory, buf, buf_len)
                },
            )?,
            GuestFunction::wrap(
                "fd_write",
                |wasi: &mut Self,
                 memory: &mut MemoryView<'_>,
                 (fd, iovs, iovs_len, written): (u32, WasmPtr, u32, WasmPtr)| {
                    wasi.fd_write(memory, fd, iovs, iovs_len, written)
                },
            )?,
            GuestFunction::raw("proc_exit", vec![I32], vec![], |_: &mut Self, values| {
                let code = values.first().copied().unwrap_or(WasmValue::I32(0)).as_i32()?;
                tracing::debug!(code, "proc_exit");
                Err(SandboxError::ProcExit(code))
            }),
        ];

        functions.extend(BLANKS.iter().map(|&(name, params, results)| {
            GuestFunction::raw(name, params.to_vec(), results.to_vec(), move |_: &mut Self, _| {
                tracing::debug!("blank {} was called", name);
                Ok(vec![WasmValue::I32(ERRNO_NOSYS as i32)])
            })
        }));

        Ok(functions)
    }

    fn memory(&self) -> Option<Memory> {
        self.memory
    }

    fn bind_memory(&mut self, memory: Memory) {
        self.memory = Some(memory);
    }
}
