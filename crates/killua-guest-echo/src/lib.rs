//! Minimal guest for the Killua sandbox.
//!
//! Reads the snippet with `context_read_code` and sends one `message_reply`
//! for every `print('...')` call in it. Anything else in the snippet is
//! ignored.
//!
//! Build with:
//!
//! ```text
//! cargo build --release --target wasm32-unknown-unknown
//! ```

/// Snippet cap enforced by the host.
const MAX_SOURCE_LEN: usize = 2000;

const CALL: &[u8] = b"print(";

#[cfg(target_arch = "wasm32")]
#[link(wasm_import_module = "env")]
extern "C" {
    /// Copy the snippet to `buf` and return its length.
    fn context_read_code(buf: *mut u8) -> u32;

    /// Send `len` bytes at `ptr` as one reply.
    fn message_reply(ptr: *const u8, len: u32);
}

#[cfg(target_arch = "wasm32")]
fn reply(text: &[u8]) {
    unsafe { message_reply(text.as_ptr(), text.len() as u32) };
}

/// The string literal argument of each `print(...)` call, in order.
fn printed(source: &[u8]) -> Vec<&[u8]> {
    let mut found = Vec::new();
    let mut rest = source;
    while let Some(at) = rest.windows(CALL.len()).position(|w| w == CALL) {
        rest = &rest[at + CALL.len()..];
        let quote = match rest.first() {
            Some(&q @ (b'\'' | b'"')) => q,
            _ => continue,
        };
        let body = &rest[1..];
        let Some(end) = body.iter().position(|&b| b == quote) else {
            break;
        };
        found.push(&body[..end]);
        rest = &body[end + 1..];
    }
    found
}

/// Guest entry point, exported as `main`.
#[cfg(target_arch = "wasm32")]
#[export_name = "main"]
pub extern "C" fn guest_main(_argc: i32, _argv: i32) -> i32 {
    let mut buf = vec![0u8; MAX_SOURCE_LEN];
    let len = unsafe { context_read_code(buf.as_mut_ptr()) } as usize;
    let source = &buf[..len.min(MAX_SOURCE_LEN)];

    for text in printed(source) {
        reply(text);
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_printed_literals() {
        let source = b"print('hi')\nx = 1\nprint(\"two\")\nprint(x)\nprint('')";
        assert_eq!(printed(source), vec![&b"hi"[..], b"two", b""]);
    }

    #[test]
    fn test_unterminated_literal_is_skipped() {
        assert!(printed(b"print('oops").is_empty());
    }
}
