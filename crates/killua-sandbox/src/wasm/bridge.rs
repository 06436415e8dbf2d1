//! Application imports under the `env` namespace.
//!
//! The guest reads the snippet it should execute with `context_read_code`
//! and hands each result back with `message_reply`. Replies leave through a
//! [`ReplySink`], which is the framed pipe in a worker process.
//! `context_environment` tells the guest which chat message invoked it.

use std::sync::mpsc;

use serde::{Deserialize, Serialize};
use wasmtime::Memory;

use super::host::{GuestFunction, HostApi};
use super::memory::MemoryView;
use super::pointer::{WasmPtr, WasmSlice};
use crate::error::{Result, SandboxError};

pub use crate::source::MAX_SOURCE_LEN;

/// Import module name for the bridge functions.
pub const BRIDGE_MODULE: &str = "env";

/// Destination for guest replies.
pub trait ReplySink: Send {
    /// Deliver one reply.
    fn reply(&mut self, content: String) -> Result<()>;

    /// No more replies will follow.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl ReplySink for mpsc::Sender<String> {
    fn reply(&mut self, content: String) -> Result<()> {
        self.send(content).map_err(|_| SandboxError::Disconnected)
    }
}

impl ReplySink for Vec<String> {
    fn reply(&mut self, content: String) -> Result<()> {
        self.push(content);
        Ok(())
    }
}

/// Identifiers of the message that triggered an invocation.
///
/// Written to the guest as three consecutive little-endian `u64`s.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextIds {
    /// Guild (server) the message was posted in
    pub guild_id: u64,
    /// Channel the message was posted in
    pub channel_id: u64,
    /// The message itself
    pub message_id: u64,
}

/// Host state behind the `env` imports.
pub struct Bridge {
    source: Vec<u8>,
    sink: Box<dyn ReplySink>,
    context: ContextIds,
    replies: usize,
    memory: Option<Memory>,
}

impl Bridge {
    /// Bridge serving `source` and forwarding replies to `sink`.
    ///
    /// The cap is not checked here; `context_read_code` refuses oversized
    /// snippets when the guest asks for them.
    pub fn new(source: impl Into<Vec<u8>>, sink: Box<dyn ReplySink>) -> Self {
        Self {
            source: source.into(),
            sink,
            context: ContextIds::default(),
            replies: 0,
            memory: None,
        }
    }

    /// Report `context` from `context_environment`.
    pub fn with_context(mut self, context: ContextIds) -> Self {
        self.context = context;
        self
    }

    /// Number of replies forwarded so far.
    pub fn replies(&self) -> usize {
        self.replies
    }

    /// Close the reply sink.
    pub fn close_replies(&mut self) -> Result<()> {
        self.sink.close()
    }

    /// Decode `message` and forward it as one reply.
    pub fn message_reply(&mut self, memory: &MemoryView<'_>, message: WasmSlice) -> Result<()> {
        let content = message.to_string_lossy(memory)?;
        tracing::debug!(len = content.len(), "message_reply");
        self.sink.reply(content)?;
        self.replies += 1;
        Ok(())
    }

    /// Copy the snippet to `buf` and return its length.
    pub fn context_read_code(&mut self, memory: &mut MemoryView<'_>, buf: WasmPtr) -> Result<u32> {
        if self.source.len() > MAX_SOURCE_LEN {
            return Err(SandboxError::TooLarge {
                len: self.source.len(),
                max: MAX_SOURCE_LEN,
            });
        }
        memory.write(buf.address(), &self.source)?;
        tracing::debug!(ptr = %buf, len = self.source.len(), "context_read_code");
        Ok(self.source.len() as u32)
    }

    /// Write the invoking message's ids to `env`.
    pub fn context_environment(&mut self, memory: &mut MemoryView<'_>, env: WasmPtr) -> Result<()> {
        let ContextIds {
            guild_id,
            channel_id,
            message_id,
        } = self.context;
        env.write(memory, &(guild_id, channel_id, message_id))?;
        tracing::debug!(ptr = %env, "context_environment");
        Ok(())
    }
}

impl HostApi for Bridge {
    const MODULE: &'static str = BRIDGE_MODULE;

    fn functions() -> Result<Vec<GuestFunction<Self>>> {
        Ok(vec![
            GuestFunction::wrap(
                "message_reply",
                |bridge: &mut Self, memory: &mut MemoryView<'_>, (message,): (WasmSlice,)| {
                    bridge.message_reply(memory, message)
                },
            )?,
            GuestFunction::wrap(
                "context_read_code",
                |bridge: &mut Self, memory: &mut MemoryView<'_>, (buf,): (WasmPtr,)| {
                    bridge.context_read_code(memory, buf)
                },
            )?,
            GuestFunction::wrap(
                "context_environment",
                |bridge: &mut Self, memory: &mut MemoryView<'_>, (env,): (WasmPtr,)| {
                    bridge.context_environment(memory, env)
                },
            )?,
        ])
    }

    fn memory(&self) -> Option<Memory> {
        self.memory
    }

    fn bind_memory(&mut self, memory: Memory) {
        self.memory = Some(memory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wasm::value::{WasmKind, WasmValue};

    fn bridge(source: &str) -> (Bridge, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel();
        (Bridge::new(source, Box::new(tx)), rx)
    }

    #[test]
    fn test_signatures() {
        let functions = Bridge::functions().unwrap();
        assert_eq!(functions[0].name(), "message_reply");
        assert_eq!(functions[0].params(), &[WasmKind::I32, WasmKind::I32]);
        assert!(functions[0].results().is_empty());
        assert_eq!(functions[1].name(), "context_read_code");
        assert_eq!(functions[1].params(), &[WasmKind::I32]);
        assert_eq!(functions[1].results(), &[WasmKind::I32]);
        assert_eq!(functions[2].name(), "context_environment");
        assert_eq!(functions[2].params(), &[WasmKind::I32]);
        assert!(functions[2].results().is_empty());
    }

    #[test]
    fn test_context_environment_writes_ids() {
        let (bridge, _rx) = bridge("");
        let mut bridge = bridge.with_context(ContextIds {
            guild_id: 1,
            channel_id: 0x0102_0304_0506_0708,
            message_id: u64::MAX,
        });
        let mut buf = vec![0xAAu8; 40];
        let mut memory = MemoryView::new(&mut buf);
        bridge.context_environment(&mut memory, WasmPtr::new(8)).unwrap();
        drop(memory);

        assert_eq!(&buf[..8], &[0xAA; 8]);
        assert_eq!(&buf[8..16], &1u64.to_le_bytes());
        assert_eq!(&buf[16..24], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(&buf[24..32], &[0xFF; 8]);
        assert_eq!(&buf[32..], &[0xAA; 8]);
    }

    #[test]
    fn test_context_environment_defaults_to_zero() {
        let functions = Bridge::functions().unwrap();
        let (mut bridge, _rx) = bridge("");
        let mut buf = vec![0xAAu8; 24];
        let mut memory = MemoryView::new(&mut buf);
        let out = functions[2]
            .call(&mut bridge, &mut memory, &[WasmValue::I32(0)])
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(memory.read(0, 24).unwrap(), &[0u8; 24]);
    }

    #[test]
    fn test_context_environment_out_of_bounds() {
        let (mut bridge, _rx) = bridge("");
        let mut buf = vec![0u8; 16];
        let mut memory = MemoryView::new(&mut buf);
        let err = bridge
            .context_environment(&mut memory, WasmPtr::new(0))
            .unwrap_err();
        assert!(matches!(err, SandboxError::OutOfBounds { .. }));
    }

    #[test]
    fn test_message_reply_forwards_one_message() {
        let (mut bridge, rx) = bridge("");
        let mut buf = b"xxhi\xF0\x9F\xA6\x80yy".to_vec();
        let memory = MemoryView::new(&mut buf);
        bridge
            .message_reply(&memory, WasmSlice::new(WasmPtr::new(2), 6))
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), "hi\u{1F980}");
        assert!(rx.try_recv().is_err());
        assert_eq!(bridge.replies(), 1);
    }

    #[test]
    fn test_message_reply_invalid_utf8_is_lossy() {
        let (mut bridge, rx) = bridge("");
        let mut buf = vec![b'a', 0xFF, b'b'];
        let memory = MemoryView::new(&mut buf);
        bridge
            .message_reply(&memory, WasmSlice::new(WasmPtr::new(0), 3))
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), "a\u{FFFD}b");
    }

    #[test]
    fn test_vec_sink_collects() {
        let mut sink: Vec<String> = Vec::new();
        sink.reply("one".into()).unwrap();
        sink.reply("two".into()).unwrap();
        sink.close().unwrap();
        assert_eq!(sink, vec!["one", "two"]);
    }

    #[test]
    fn test_message_reply_closed_channel() {
        let (mut bridge, rx) = bridge("");
        drop(rx);
        let mut buf = vec![0u8; 4];
        let memory = MemoryView::new(&mut buf);
        let err = bridge
            .message_reply(&memory, WasmSlice::new(WasmPtr::new(0), 1))
            .unwrap_err();
        assert!(matches!(err, SandboxError::Disconnected));
        assert_eq!(bridge.replies(), 0);
    }

    #[test]
    fn test_read_code_exact_cap() {
        let source = "a".repeat(MAX_SOURCE_LEN);
        let (mut bridge, _rx) = bridge(&source);
        let mut buf = vec![0u8; 4096];
        let mut memory = MemoryView::new(&mut buf);
        let len = bridge.context_read_code(&mut memory, WasmPtr::new(16)).unwrap();
        assert_eq!(len as usize, MAX_SOURCE_LEN);
        drop(memory);
        assert!(buf[16..16 + MAX_SOURCE_LEN].iter().all(|&b| b == b'a'));
        assert_eq!(buf[16 + MAX_SOURCE_LEN], 0);
    }

    #[test]
    fn test_read_code_over_cap_leaves_memory_alone() {
        let source = "a".repeat(MAX_SOURCE_LEN + 1);
        let (mut bridge, _rx) = bridge(&source);
        let mut buf = vec![0u8; 4096];
        let mut memory = MemoryView::new(&mut buf);
        let err = bridge.context_read_code(&mut memory, WasmPtr::new(0)).unwrap_err();
        assert!(matches!(err, SandboxError::TooLarge { len: 2001, max: 2000 }));
        drop(memory);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_read_code_through_stub() {
        let functions = Bridge::functions().unwrap();
        let (mut bridge, _rx) = bridge("print('hi')");
        let mut buf = vec![0u8; 64];
        let mut memory = MemoryView::new(&mut buf);
        let out = functions[1]
            .call(&mut bridge, &mut memory, &[WasmValue::I32(8)])
            .unwrap();
        assert_eq!(out, vec![WasmValue::I32(11)]);
        assert_eq!(memory.read(8, 11).unwrap(), b"print('hi')");
    }
}
