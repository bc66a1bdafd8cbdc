//! Shell session tests against the real platform shell
#![cfg(unix)]

use indexmap::IndexMap;
use rave_session::prelude::*;
use rave_session::shell::PosixShell;
use rave_session::StreamKind;
use std::sync::Arc;
use std::time::Duration;

fn shells() -> Arc<ShellSessions> {
    Arc::new(ShellSessions::new(Arc::new(PosixShell::default())))
}

#[tokio::test]
async fn successful_command_collects_output() {
    let shells = shells();
    shells.create("ok", ShellOptions::default()).unwrap();

    let outcome = shells
        .execute("ok", "echo out; echo err >&2", ExecOptions::default())
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.exit_code, Some(0));
    assert_eq!(outcome.output, "out\n");
    assert_eq!(outcome.stderr, "err\n");
    assert_eq!(shells.info("ok").unwrap().status, SessionStatus::Ready);
}

#[tokio::test]
async fn nonzero_exit_is_failure_with_code() {
    let shells = shells();
    shells.create("bad", ShellOptions::default()).unwrap();

    let outcome = shells
        .execute("bad", "echo before; exit 1", ExecOptions::default())
        .await
        .unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.exit_code, Some(1));
    assert_eq!(outcome.output, "before\n");
    assert!(outcome.error.unwrap().contains("exit code 1"));
}

#[tokio::test]
async fn env_overrides_reach_the_process() {
    let shells = shells();
    shells.create("env", ShellOptions::default()).unwrap();

    let mut env = IndexMap::new();
    env.insert("RAVE_TEST_VALUE".to_string(), "forty two".to_string());
    let outcome = shells
        .execute("env", "echo \"$RAVE_TEST_VALUE\"", ExecOptions::default().with_env(env))
        .await
        .unwrap();

    assert_eq!(outcome.output, "forty two\n");
}

#[tokio::test]
async fn timeout_kills_and_keeps_partial_output() {
    let shells = shells();
    shells.create("slow", ShellOptions::default()).unwrap();

    let outcome = shells
        .execute(
            "slow",
            "echo started; sleep 10",
            ExecOptions::default().with_timeout(Duration::from_millis(400)),
        )
        .await
        .unwrap();

    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("timed out"));
    assert_eq!(outcome.output, "started\n");
}

#[tokio::test]
async fn timeout_keeps_output_still_in_the_pipe() {
    let shells = shells();
    shells.create("flood", ShellOptions::default()).unwrap();

    let outcome = shells
        .execute(
            "flood",
            "i=0; while [ $i -lt 3000 ]; do echo line$i; i=$((i+1)); done; exec sleep 10",
            ExecOptions::default().with_timeout(Duration::from_millis(1500)),
        )
        .await
        .unwrap();

    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("timed out"));
    assert_eq!(outcome.output.lines().count(), 3000);
    assert!(outcome.output.ends_with("line2999\n"));
}

#[tokio::test]
async fn multibyte_output_survives_read_boundaries() {
    let shells = shells();
    shells.create("utf8", ShellOptions::default()).unwrap();

    let outcome = shells
        .execute(
            "utf8",
            "s=$(printf '%4095s' ''); printf '%s\\303\\251\\n' \"$s\"",
            ExecOptions::default(),
        )
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.output.len(), 4098);
    assert!(outcome.output.ends_with("\u{e9}\n"));
    assert!(!outcome.output.contains('\u{fffd}'));
}

#[tokio::test]
async fn second_execute_while_running_is_rejected() {
    let shells = shells();
    shells.create("busy", ShellOptions::default()).unwrap();

    let first = {
        let shells = shells.clone();
        tokio::spawn(async move {
            shells
                .execute("busy", "sleep 0.3; echo finished", ExecOptions::default())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = shells.execute("busy", "echo nope", ExecOptions::default()).await;
    assert!(matches!(second, Err(SessionError::Busy(_))));

    let first = first.await.unwrap().unwrap();
    assert!(first.success);
    assert_eq!(first.output, "finished\n");
}

#[tokio::test]
async fn subscriber_sees_streamed_chunks() {
    let shells = shells();
    shells.create("live", ShellOptions::default()).unwrap();
    let mut rx = shells.subscribe("live", 16).unwrap();

    shells
        .execute("live", "echo streamed", ExecOptions::default())
        .await
        .unwrap();

    let chunk = rx.recv().await.unwrap();
    assert_eq!(chunk.session_id, "live");
    assert_eq!(chunk.stream, StreamKind::Stdout);
    assert_eq!(chunk.text, "streamed\n");
}

#[tokio::test]
async fn manual_flag_is_ignored_without_terminal_support() {
    let shells = shells();
    shells.create("m", ShellOptions::default()).unwrap();

    let outcome = shells
        .execute("m", "echo direct", ExecOptions::default().manual(true))
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.output, "direct\n");
}

#[tokio::test]
async fn terminate_kills_running_command() {
    let shells = shells();
    shells.create("k", ShellOptions::default()).unwrap();

    let running = {
        let shells = shells.clone();
        tokio::spawn(async move { shells.execute("k", "sleep 10", ExecOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    shells.terminate("k");
    let outcome = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(!outcome.success);
    assert!(shells.is_empty());

    shells.terminate("k");
}
