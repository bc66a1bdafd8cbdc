use pretty_assertions::assert_eq;
use rave_installer::{
    EventKind, InstallError, InstallEvent, Installer, InstallerConfig, Platform, RunPhase,
    SkipReason, StepStatus,
};
use rave_session::ManualOutcome;
use rave_test_utils::{plan, step, wait_until, Call, Scripted, ScriptedExecutor};
use std::sync::Arc;
use tokio::sync::broadcast;

fn installer(executor: &Arc<ScriptedExecutor>) -> Arc<Installer> {
    Arc::new(Installer::new(InstallerConfig::default(), executor.clone()))
}

fn drain(rx: &mut broadcast::Receiver<InstallEvent>) -> Vec<InstallEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn required_failure_then_proceed_runs_dependents() {
    let executor = Arc::new(ScriptedExecutor::new().step("A", Scripted::Fail(1)));
    let installer = installer(&executor);
    let plan = plan(vec![
        step("A").required(true),
        step("B").needs(["A"]).required(true),
        step("C").needs(["B"]),
    ]);

    let run = {
        let installer = installer.clone();
        tokio::spawn(async move { installer.run(&plan).await })
    };
    wait_until(|| installer.is_suspended()).await;

    assert_eq!(installer.phase(), RunPhase::Suspended);
    assert_eq!(installer.steps()[0].status, StepStatus::Failed);
    assert_eq!(installer.steps()[0].exit_code, Some(1));

    assert!(installer.proceed_anyway());
    let summary = run.await.unwrap().unwrap();

    assert!(summary.success);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.completed, 2);
    assert_eq!(
        summary.step("A").unwrap().skip_reason,
        Some(SkipReason::Overridden)
    );
    assert_eq!(executor.ran(), vec!["A", "B", "C"]);
    assert_eq!(installer.phase(), RunPhase::Completed);
}

#[tokio::test]
async fn met_condition_skips_without_running() {
    let executor = Arc::new(ScriptedExecutor::new().condition("command -v brew", true));
    let installer = installer(&executor);
    let mut events = installer.subscribe();
    let plan = plan(vec![step("brew").skip_if("command -v brew").required(true)]);

    let summary = installer.run(&plan).await.unwrap();

    assert_eq!(summary.skipped, 1);
    assert_eq!(executor.calls(), vec![Call::Condition("command -v brew".into())]);
    let kinds: Vec<_> = drain(&mut events).into_iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&EventKind::StepSkipped {
        step: "brew".into(),
        reason: SkipReason::ConditionMet,
    }));
    assert!(!kinds
        .iter()
        .any(|k| matches!(k, EventKind::StepStart { .. })));
}

#[tokio::test]
async fn unmet_condition_runs_the_step() {
    let executor = Arc::new(ScriptedExecutor::new().condition("test -d /x", false));
    let installer = installer(&executor);
    let plan = plan(vec![step("x").skip_if("test -d /x")]);

    let summary = installer.run(&plan).await.unwrap();

    assert_eq!(summary.completed, 1);
    assert_eq!(executor.ran(), vec!["x"]);
}

#[tokio::test]
async fn blocked_required_step_suspends_and_independent_steps_still_run() {
    let executor = Arc::new(ScriptedExecutor::new().step("opt", Scripted::Fail(2)));
    let installer = installer(&executor);
    let mut events = installer.subscribe();
    let plan = plan(vec![
        step("opt"),
        step("req").needs(["opt"]).required(true),
        step("indep"),
    ]);

    let run = {
        let installer = installer.clone();
        tokio::spawn(async move { installer.run(&plan).await })
    };
    wait_until(|| installer.is_suspended()).await;

    let steps = installer.steps();
    assert_eq!(steps[1].id, "req");
    assert_eq!(steps[1].status, StepStatus::Blocked);
    let blocked = drain(&mut events)
        .into_iter()
        .find(|e| e.type_name() == "step-blocked")
        .unwrap();
    assert_eq!(
        blocked.kind,
        EventKind::StepBlocked {
            step: "req".into(),
            unmet: vec!["opt".into()],
            required: true,
            suspended: true,
            instructions: "install req".into(),
        }
    );

    installer.proceed_anyway();
    let summary = run.await.unwrap().unwrap();

    assert_eq!(executor.ran(), vec!["opt", "indep"]);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.blocked, 0);
    assert_eq!(
        summary.step("req").unwrap().skip_reason,
        Some(SkipReason::Overridden)
    );
}

#[tokio::test]
async fn blocked_optional_step_is_skipped_without_suspending() {
    let executor = Arc::new(ScriptedExecutor::new().step("base", Scripted::Error));
    let installer = installer(&executor);
    let plan = plan(vec![step("base"), step("extra").needs(["base"])]);

    let summary = installer.run(&plan).await.unwrap();

    assert!(summary.success);
    assert_eq!(executor.ran(), vec!["base"]);
    assert_eq!(
        summary.step("extra").unwrap().skip_reason,
        Some(SkipReason::DependencyUnsatisfied)
    );
}

#[tokio::test]
async fn event_stream_brackets_the_run() {
    let executor = Arc::new(ScriptedExecutor::new().step("a", Scripted::Succeed("done\n".into())));
    let installer = installer(&executor);
    let mut events = installer.subscribe();
    let plan = plan(vec![step("b").needs(["a"]), step("a")]);

    installer.run(&plan).await.unwrap();

    let events = drain(&mut events);
    let names: Vec<_> = events.iter().map(InstallEvent::type_name).collect();
    assert_eq!(
        names,
        vec![
            "installation-start",
            "step-start",
            "step-complete",
            "step-start",
            "step-complete",
            "installation-complete",
        ]
    );
    assert_eq!(events[1].step(), Some("a"));
    assert_eq!(
        events[2].kind,
        EventKind::StepComplete {
            step: "a".into(),
            output: "done\n".into(),
        }
    );
    assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[tokio::test]
async fn manual_step_waits_for_a_human() {
    let executor = Arc::new(ScriptedExecutor::new().step("xcode", Scripted::Manual));
    let installer = installer(&executor);
    let mut events = installer.subscribe();
    let plan = plan(vec![
        step("xcode").manual("Click Install in the dialog").required(true),
        step("tools").needs(["xcode"]),
    ]);

    let run = {
        let installer = installer.clone();
        tokio::spawn(async move { installer.run(&plan).await })
    };
    wait_until(|| !executor.pending_prompts().is_empty()).await;

    let announced = drain(&mut events)
        .into_iter()
        .find_map(|e| match e.kind {
            EventKind::StepRequiresAction {
                session_id,
                command,
                instructions,
                ..
            } => Some((session_id, command, instructions)),
            _ => None,
        })
        .unwrap();
    assert_eq!(announced.1, "install xcode");
    assert_eq!(announced.2.as_deref(), Some("Click Install in the dialog"));
    assert!(announced.0.starts_with("step-xcode-"));

    installer
        .respond_to_manual(&announced.0, ManualOutcome::Success)
        .unwrap();
    let summary = run.await.unwrap().unwrap();

    assert_eq!(summary.completed, 2);
    assert_eq!(executor.ran(), vec!["xcode", "tools"]);
}

#[tokio::test]
async fn responding_without_a_prompt_is_an_error() {
    let executor = Arc::new(ScriptedExecutor::new());
    let installer = installer(&executor);

    let err = installer
        .respond_to_manual("step-none", ManualOutcome::Skipped)
        .unwrap_err();
    assert!(matches!(err, InstallError::Session(_)));
}

#[tokio::test]
async fn abort_during_manual_prompt_stops_the_run() {
    let executor = Arc::new(ScriptedExecutor::new().step("first", Scripted::Manual));
    let installer = installer(&executor);
    let plan = plan(vec![step("first"), step("second")]);

    let run = {
        let installer = installer.clone();
        tokio::spawn(async move { installer.run(&plan).await })
    };
    wait_until(|| !executor.pending_prompts().is_empty()).await;

    installer.abort();
    let summary = run.await.unwrap().unwrap();

    assert!(summary.aborted);
    assert!(!summary.success);
    assert_eq!(executor.ran(), vec!["first"]);
    assert_eq!(summary.step("second").unwrap().status, StepStatus::Pending);
    assert!(executor.calls().contains(&Call::Abort));
    assert_eq!(installer.phase(), RunPhase::Aborted);
}

#[tokio::test]
async fn finished_run_can_start_again() {
    let executor = Arc::new(ScriptedExecutor::new());
    let installer = installer(&executor);
    let plan = plan(vec![step("a")]);

    installer.run(&plan).await.unwrap();
    installer.run(&plan).await.unwrap();

    assert_eq!(executor.ran(), vec!["a", "a"]);
    assert_eq!(installer.phase(), RunPhase::Completed);
}

#[tokio::test]
async fn start_loads_the_platform_plan() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("linux.yaml"),
        "name: test\nsteps:\n  - id: r\n    name: R\n    type: shell\n    run: echo r\n",
    )
    .unwrap();
    let executor = Arc::new(ScriptedExecutor::new());
    let installer = Installer::new(
        InstallerConfig::default().with_plan_dir(dir.path()),
        executor.clone(),
    );

    let summary = installer.start(Platform::Linux).await.unwrap();

    assert_eq!(summary.plan, "test");
    assert_eq!(executor.ran(), vec!["r"]);
}

#[tokio::test]
async fn missing_plan_file_aborts_with_error_event() {
    let dir = tempfile::tempdir().unwrap();
    let executor = Arc::new(ScriptedExecutor::new());
    let installer = Installer::new(
        InstallerConfig::default().with_plan_dir(dir.path()),
        executor.clone(),
    );
    let mut events = installer.subscribe();

    let err = installer.start(Platform::Windows).await.unwrap_err();

    assert!(err.is_fatal());
    assert_eq!(installer.phase(), RunPhase::Aborted);
    assert_eq!(drain(&mut events)[0].type_name(), "error");
    assert!(executor.calls().is_empty());
}

#[tokio::test]
async fn suspension_is_in_place_when_event_arrives() {
    let executor = Arc::new(ScriptedExecutor::new().step("a", Scripted::Fail(1)));
    let installer = installer(&executor);
    let mut events = installer.subscribe();
    let plan = plan(vec![step("a").required(true), step("b")]);

    let run = {
        let installer = installer.clone();
        tokio::spawn(async move { installer.run(&plan).await })
    };
    loop {
        let event = events.recv().await.unwrap();
        if let EventKind::StepFailed { suspended, .. } = event.kind {
            assert!(suspended);
            assert!(installer.proceed_anyway());
            break;
        }
    }

    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(executor.ran(), vec!["a", "b"]);
}
