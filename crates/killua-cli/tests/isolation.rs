//! End-to-end tests across the process boundary.
//!
//! Every invocation re-executes the `killua` binary as `killua worker`.

use std::path::Path;
use std::time::{Duration, Instant};

use futures::StreamExt;
use killua_sandbox::{ContextIds, IsolationConfig, Outcome, SandboxRunner, SessionState};

/// Replies once per single-quoted string in the snippet, so
/// `print('hi')` becomes one `message_reply("hi")`.
const PRINT_GUEST: &str = r#"
(module
  (import "env" "context_read_code" (func $read (param i32) (result i32)))
  (import "env" "message_reply" (func $reply (param i32 i32)))
  (memory (export "memory") 1)
  (func $quote (param $from i32) (param $end i32) (result i32)
    (block $done
      (loop $scan
        (br_if $done (i32.ge_u (local.get $from) (local.get $end)))
        (br_if $done (i32.eq (i32.load8_u (local.get $from)) (i32.const 39)))
        (local.set $from (i32.add (local.get $from) (i32.const 1)))
        (br $scan)))
    (local.get $from))
  (func (export "main") (param i32 i32) (result i32)
    (local $end i32) (local $open i32) (local $close i32)
    (local.set $end (i32.add (i32.const 1024) (call $read (i32.const 1024))))
    (local.set $open (i32.const 1024))
    (block $done
      (loop $next
        (local.set $open (call $quote (local.get $open) (local.get $end)))
        (br_if $done (i32.ge_u (local.get $open) (local.get $end)))
        (local.set $close (call $quote (i32.add (local.get $open) (i32.const 1)) (local.get $end)))
        (br_if $done (i32.ge_u (local.get $close) (local.get $end)))
        (call $reply
          (i32.add (local.get $open) (i32.const 1))
          (i32.sub (local.get $close) (i32.add (local.get $open) (i32.const 1))))
        (local.set $open (i32.add (local.get $close) (i32.const 1)))
        (br $next)))
    (i32.const 0)))
"#;

const SPIN_GUEST: &str = r#"(module (func (export "main") (loop $forever (br $forever))))"#;

const TRAP_GUEST: &str = r#"(module (func (export "main") unreachable))"#;

fn config() -> IsolationConfig {
    IsolationConfig::default()
        .worker(env!("CARGO_BIN_EXE_killua"), ["worker"])
        .timeout(Duration::from_secs(20))
}

fn runner(wat: &str, config: IsolationConfig) -> SandboxRunner {
    SandboxRunner::from_bytes(config, "guest", wat.as_bytes()).expect("failed to prepare guest")
}

async fn collect(runner: &SandboxRunner, source: &str) -> (Vec<String>, Outcome) {
    let mut stream = runner.run_sandboxed(source);
    let replies = (&mut stream).collect::<Vec<_>>().await;
    (replies, stream.outcome().await)
}

#[tokio::test]
async fn test_print_hi_yields_one_reply() {
    let runner = runner(PRINT_GUEST, config());
    let (replies, outcome) = collect(&runner, "print('hi')").await;
    assert_eq!(replies, vec!["hi"]);
    assert_eq!(outcome, Outcome::Completed);
}

#[tokio::test]
async fn test_replies_arrive_in_order() {
    let runner = runner(PRINT_GUEST, config());
    let source = "print('one')\nprint('two')\nprint('three')\nprint('')";
    let (replies, outcome) = collect(&runner, source).await;
    assert_eq!(replies, vec!["one", "two", "three", ""]);
    assert!(outcome.is_completed());
}

#[tokio::test]
async fn test_fenced_snippet_is_unwrapped() {
    let runner = runner(PRINT_GUEST, config());
    let (replies, outcome) = collect(&runner, "```py\nprint('fenced')\n```").await;
    assert_eq!(replies, vec!["fenced"]);
    assert_eq!(outcome, Outcome::Completed);
}

#[tokio::test]
async fn test_replies_stream_before_guest_returns() {
    // One reply, then spin until the budget runs out.
    let wat = r#"
(module
  (import "env" "message_reply" (func $reply (param i32 i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "early")
  (func (export "main")
    (call $reply (i32.const 0) (i32.const 5))
    (loop $forever (br $forever))))
"#;
    let runner = runner(wat, config().timeout(Duration::from_secs(5)));
    let mut stream = runner.run_sandboxed("");
    let started = Instant::now();
    assert_eq!(stream.next().await.as_deref(), Some("early"));
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(stream.outcome().await, Outcome::TimedOut);
}

#[tokio::test]
async fn test_guest_sees_message_context() {
    let wat = r#"
(module
  (import "env" "context_environment" (func $env (param i32)))
  (import "env" "message_reply" (func $reply (param i32 i32)))
  (memory (export "memory") 1)
  (func (export "main")
    (call $env (i32.const 64))
    (call $reply (i32.const 64) (i32.const 24))))
"#;
    let runner = runner(wat, config());
    let context = ContextIds {
        guild_id: u64::from_le_bytes(*b"guild-01"),
        channel_id: u64::from_le_bytes(*b"chan-002"),
        message_id: u64::from_le_bytes(*b"msg-0003"),
    };
    let mut stream = runner.run_sandboxed_for("", context);
    assert_eq!(stream.next_reply().await.as_deref(), Some("guild-01chan-002msg-0003"));
    assert_eq!(stream.outcome().await, Outcome::Completed);
}

#[tokio::test]
async fn test_runner_serves_many_invocations() {
    let runner = runner(PRINT_GUEST, config());
    for word in ["a", "b", "c"] {
        let (replies, outcome) = collect(&runner, &format!("print('{}')", word)).await;
        assert_eq!(replies, vec![word]);
        assert_eq!(outcome, Outcome::Completed);
    }
}

#[tokio::test]
async fn test_spinning_guest_times_out_and_worker_is_gone() {
    let runner = runner(SPIN_GUEST, config().timeout(Duration::from_millis(500)));
    let started = Instant::now();

    let mut session = runner.spawn("").await.expect("failed to spawn worker");
    let pid = session.worker_pid().expect("worker has a pid");
    assert_eq!(session.next_reply().await, None);
    assert_eq!(session.state(), SessionState::TimedOut);
    assert_eq!(session.finish().await, Outcome::TimedOut);

    assert!(started.elapsed() < Duration::from_secs(10));
    // Reaped, so not even a zombie is left.
    assert!(!Path::new(&format!("/proc/{}", pid)).exists());
}

#[tokio::test]
async fn test_trapping_guest_is_faulted() {
    let runner = runner(TRAP_GUEST, config());
    let (replies, outcome) = collect(&runner, "print('never')").await;
    assert!(replies.is_empty());
    assert!(matches!(outcome, Outcome::Faulted { .. }), "{:?}", outcome);
    assert!(outcome.describe().starts_with("execution error"));
}

#[tokio::test]
async fn test_oversized_snippet_is_faulted() {
    let runner = runner(PRINT_GUEST, config());
    let source = format!("print('{}')", "x".repeat(2000));
    let (replies, outcome) = collect(&runner, &source).await;
    assert!(replies.is_empty());
    assert!(matches!(outcome, Outcome::Faulted { .. }));
}

#[tokio::test]
async fn test_nonzero_proc_exit_is_faulted() {
    let wat = r#"
(module
  (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))
  (func (export "main") (call $exit (i32.const 3))))
"#;
    let runner = runner(wat, config());
    let (_, outcome) = collect(&runner, "").await;
    assert!(matches!(outcome, Outcome::Faulted { .. }));
}

#[tokio::test]
async fn test_fuel_limit_stops_spinning_guest() {
    let mut config = config();
    config.wasm = config.wasm.fuel_limit(1_000_000);
    let runner = runner(SPIN_GUEST, config);
    let (_, outcome) = collect(&runner, "").await;
    assert!(matches!(outcome, Outcome::Faulted { .. }));
}

#[tokio::test]
async fn test_cancel_stops_worker() {
    let runner = runner(SPIN_GUEST, config());
    let mut session = runner.spawn("").await.expect("failed to spawn worker");
    session.cancel().await;
    assert_eq!(session.state(), SessionState::Faulted);
    assert_eq!(
        session.finish().await,
        Outcome::Faulted { reason: "cancelled".to_string() }
    );
}
