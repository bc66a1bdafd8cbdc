//! Subcommand implementations

use anyhow::{bail, Context, Result};
use rave_installer::{
    dag, EventKind, FileCacheStore, InstallEvent, Installer, InstallerConfig, PathRuntimeLocator,
    Plan, Platform, PrereqChecker, PrereqReport, PrereqStatus, RunSummary, RuntimeLocator,
    SessionProbe, SessionStepExecutor, SkipReason,
};
use rave_session::{
    CrashNotice, Dialect, InterpreterOptions, InterpreterSessions, ManualOutcome, PortPool,
    SessionStatus, ShellSessions,
};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};

const SCRIPT_RUNTIME: &str = "Rscript";
const CONSOLE_RUNTIME: &str = "R";
const CONSOLE_ID: &str = "console";

fn load_plan(config: &InstallerConfig, platform: Platform, file: Option<&Path>) -> Result<Plan> {
    let path = match file {
        Some(path) => path.to_path_buf(),
        None => Plan::path_for(&config.plan_dir, platform),
    };
    Plan::from_file(&path).with_context(|| format!("loading plan {}", path.display()))
}

/// `ravectl plan`
pub(crate) fn plan(
    config: &InstallerConfig,
    platform: Platform,
    file: Option<&Path>,
    json: bool,
) -> Result<()> {
    let plan = load_plan(config, platform, file)?;
    let order = dag::execution_order(&plan)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&order)?);
        return Ok(());
    }

    println!("{} ({} steps)", plan.name, order.len());
    for (i, step) in order.iter().enumerate() {
        let mut flags = vec![step.kind.to_string()];
        if step.required {
            flags.push("required".into());
        }
        if step.manual_execute {
            flags.push("manual".into());
        }
        if step.condition.is_some() {
            flags.push("conditional".into());
        }
        println!("{:>3}. {:<20} {} [{}]", i + 1, step.id, step.name, flags.join(", "));
        if !step.needs.is_empty() {
            println!("     needs: {}", step.needs.join(", "));
        }
    }
    for (step, missing) in dag::unknown_needs(&plan) {
        println!("warning: {step} needs unknown step {missing}");
    }
    Ok(())
}

/// `ravectl check`; returns whether every required item is installed
pub(crate) async fn check(
    config: &InstallerConfig,
    platform: Platform,
    json: bool,
    no_cache: bool,
) -> Result<bool> {
    let probe = Arc::new(SessionProbe::new(Arc::new(ShellSessions::default())));
    let cache = Arc::new(FileCacheStore::new(&config.cache_dir));
    let report = PrereqChecker::new(platform, probe, cache)
        .with_probe_timeout(config.probe_timeout())
        .with_ttl(config.prereq_cache_ttl())
        .check(!no_cache)
        .await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(report.passed)
}

fn print_report(report: &PrereqReport) {
    let source = if report.from_cache { " (cached)" } else { "" };
    println!(
        "Prerequisites for {} {}{source}",
        report.platform, report.os_release
    );
    for item in &report.items {
        let mark = match item.status {
            PrereqStatus::Installed => "ok",
            PrereqStatus::Pending if item.required => "MISSING",
            PrereqStatus::Pending => "optional",
        };
        let detail = item.detail.as_deref().unwrap_or_default();
        println!("  [{mark:^8}] {:<28} {detail}", item.label);
    }

    let pending: Vec<_> = report.pending().collect();
    if pending.is_empty() {
        return;
    }
    println!();
    println!("Remediation:");
    for (i, item) in pending.iter().enumerate() {
        println!("  {}. {} - {}", i + 1, item.label, item.description);
        if let Some(cmd) = &item.install_command {
            println!("       run: {cmd}");
        }
        if let Some(text) = &item.manual_instructions {
            println!("       {text}");
        }
    }
}

/// `ravectl install`; returns whether the run succeeded
pub(crate) async fn install(
    config: InstallerConfig,
    platform: Platform,
    file: Option<PathBuf>,
    assume_yes: bool,
) -> Result<bool> {
    let plan = load_plan(&config, platform, file.as_deref())?;

    let locator = Arc::new(
        PathRuntimeLocator::new(SCRIPT_RUNTIME).with_dirs(config.runtime_search_dirs.clone()),
    );
    let executor = Arc::new(SessionStepExecutor::new(
        Arc::new(ShellSessions::default()),
        locator,
    ));
    let installer = Arc::new(Installer::new(config, executor));

    let ui = tokio::spawn(drive(installer.clone(), installer.subscribe(), assume_yes));
    let interrupt = {
        let installer = installer.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                installer.abort();
            }
        })
    };

    let result = installer.run(&plan).await;
    interrupt.abort();
    match result {
        Ok(summary) => {
            let _ = ui.await;
            print_summary(&summary);
            Ok(summary.success)
        }
        Err(e) => {
            ui.abort();
            Err(e).context("installation did not start")
        }
    }
}

/// Render progress and answer prompts until the run completes
async fn drive(
    installer: Arc<Installer>,
    mut events: broadcast::Receiver<InstallEvent>,
    assume_yes: bool,
) {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "progress display fell behind");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match event.kind {
            EventKind::InstallationStart {
                plan, total_steps, ..
            } => println!("==> {plan} ({total_steps} steps)"),
            EventKind::StepStart {
                name, index, total, ..
            } => println!("[{}/{total}] {name}", index + 1),
            EventKind::StepComplete { step, .. } => println!("      done: {step}"),
            EventKind::StepSkipped { step, reason } => {
                println!("      skipped: {step} ({})", describe(reason));
            }
            EventKind::StepFailed {
                step,
                error,
                output,
                suspended,
                instructions,
                ..
            } => {
                println!("      FAILED: {step}: {error}");
                for line in tail(&output, 10) {
                    println!("        | {line}");
                }
                if suspended {
                    decide(&installer, &mut stdin, &instructions, assume_yes).await;
                }
            }
            EventKind::StepBlocked {
                step,
                unmet,
                suspended,
                instructions,
                ..
            } => {
                println!("      blocked: {step} needs {}", unmet.join(", "));
                if suspended {
                    decide(&installer, &mut stdin, &instructions, assume_yes).await;
                }
            }
            EventKind::StepRequiresAction {
                session_id,
                command,
                instructions,
                ..
            } => {
                println!("      action required in the opened terminal:");
                println!("        $ {command}");
                if let Some(text) = instructions {
                    println!("        {text}");
                }
                let outcome = ask_manual(&mut stdin).await;
                if let Err(e) = installer.respond_to_manual(&session_id, outcome) {
                    warn!(error = %e, "manual response not delivered");
                }
            }
            EventKind::InstallationComplete { .. } => break,
            EventKind::Error { message } => {
                eprintln!("error: {message}");
                break;
            }
        }
    }
}

async fn prompt<R>(stdin: &mut Lines<R>, question: &str) -> Option<String>
where
    R: AsyncBufRead + Unpin,
{
    println!("{question}");
    match stdin.next_line().await {
        Ok(Some(line)) => Some(line.trim().to_ascii_lowercase()),
        Ok(None) => None,
        Err(e) => {
            warn!(error = %e, "stdin unreadable");
            None
        }
    }
}

/// Proceed or abort a suspended run; end of input aborts
async fn decide(
    installer: &Installer,
    stdin: &mut Lines<BufReader<Stdin>>,
    instructions: &str,
    assume_yes: bool,
) {
    if !instructions.is_empty() {
        println!("      to fix: {instructions}");
    }
    if assume_yes {
        info!("proceeding past suspended step (--yes)");
        installer.proceed_anyway();
        return;
    }
    loop {
        match prompt(stdin, "      [p]roceed anyway or [a]bort?").await.as_deref() {
            Some("p" | "proceed") => {
                installer.proceed_anyway();
                return;
            }
            Some("a" | "abort") | None => {
                installer.abort();
                return;
            }
            Some(_) => {}
        }
    }
}

async fn ask_manual(stdin: &mut Lines<BufReader<Stdin>>) -> ManualOutcome {
    loop {
        match prompt(stdin, "      result? [s]uccess, [f]ailed, s[k]ip").await {
            Some(answer) => match answer.parse() {
                Ok(outcome) => return outcome,
                Err(e) => println!("      {e}"),
            },
            None => return ManualOutcome::Failed,
        }
    }
}

fn describe(reason: SkipReason) -> &'static str {
    match reason {
        SkipReason::ConditionMet => "already satisfied",
        SkipReason::DependencyUnsatisfied => "dependency not met",
        SkipReason::OptionalFailure => "optional step failed",
        SkipReason::Overridden => "proceeded anyway",
        SkipReason::ManualSkip => "skipped by user",
    }
}

fn tail(text: &str, n: usize) -> impl Iterator<Item = &str> {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines.into_iter().skip(start)
}

fn print_summary(summary: &RunSummary) {
    println!();
    let verdict = match (summary.aborted, summary.success) {
        (true, _) => "aborted",
        (false, true) => "completed",
        (false, false) => "completed with failures",
    };
    println!(
        "Installation {verdict}: {} done, {} skipped, {} failed, {} blocked",
        summary.completed, summary.skipped, summary.failed, summary.blocked
    );
}

/// `ravectl eval`; runs code in an R session, optionally leaving a server up
pub(crate) async fn eval(
    config: &InstallerConfig,
    code: &str,
    server: Option<&str>,
    timeout: Duration,
) -> Result<bool> {
    let runtime = PathRuntimeLocator::new(CONSOLE_RUNTIME)
        .with_dirs(config.runtime_search_dirs.clone())
        .locate()
        .await
        .context("R is not installed; run `ravectl check`")?;
    info!(path = %runtime.path.display(), version = ?runtime.version, "using R");

    let ports = Arc::new(PortPool::new(config.port_range.start, config.port_range.end)?);
    let sessions = InterpreterSessions::with_server_probe(ports, config.server_probe());
    let options = InterpreterOptions::new(Dialect::R)
        .with_args(["--no-save", "--no-restore", "--quiet", "--no-echo"])
        .headless(config.headless);
    let mut crashes = sessions.crash_events();
    sessions
        .create(CONSOLE_ID, Some(&runtime.path), options)
        .await?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let result = console(
        &sessions,
        &mut crashes,
        &mut stdin,
        config.headless,
        code,
        server,
        timeout,
    )
    .await;
    sessions.shutdown();
    result
}

/// Evaluate, then serve until Ctrl-C; a restart after a crash starts over
async fn console(
    sessions: &InterpreterSessions,
    crashes: &mut broadcast::Receiver<CrashNotice>,
    stdin: &mut Lines<BufReader<Stdin>>,
    headless: bool,
    code: &str,
    server: Option<&str>,
    timeout: Duration,
) -> Result<bool> {
    loop {
        let outcome = sessions.execute(CONSOLE_ID, code, timeout).await?;
        print!("{}", outcome.output);
        if !outcome.stderr.is_empty() {
            eprint!("{}", outcome.stderr);
        }
        if let Some(error) = &outcome.error {
            eprintln!("error: {error}");
        }

        let Some(command) = server else {
            return Ok(outcome.success);
        };
        if !outcome.success {
            bail!("not starting server after failed evaluation");
        }
        let port = sessions
            .info(CONSOLE_ID)
            .and_then(|info| info.port)
            .unwrap_or_default();
        if !sessions.start_interactive_server(CONSOLE_ID, command).await? {
            eprintln!("server on port {port} never responded");
            return Ok(false);
        }
        println!("serving on http://127.0.0.1:{port}/ (Ctrl-C to stop)");

        let stop = async {
            let _ = tokio::signal::ctrl_c().await;
        };
        match supervise(sessions, crashes, stdin, headless, stop).await? {
            Supervision::Stopped => return Ok(true),
            Supervision::Restarted => println!("R restarted; evaluating again"),
            Supervision::CleanedUp => return Ok(false),
        }
    }
}

/// How watching a served console ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Supervision {
    /// Stop requested
    Stopped,
    /// Crashed and recreated with the same executable
    Restarted,
    /// Crashed and discarded
    CleanedUp,
}

/// Wait for `stop` while watching the console for a crash
///
/// Non-headless sessions announce crashes and the user picks restart or
/// cleanup. Headless sessions are silent, so their status is polled and a
/// crash is cleaned up without asking.
async fn supervise<R, F>(
    sessions: &InterpreterSessions,
    crashes: &mut broadcast::Receiver<CrashNotice>,
    stdin: &mut Lines<R>,
    headless: bool,
    stop: F,
) -> Result<Supervision>
where
    R: AsyncBufRead + Unpin,
    F: Future<Output = ()>,
{
    tokio::pin!(stop);
    let mut poll = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            () = &mut stop => return Ok(Supervision::Stopped),
            notice = crashes.recv(), if !headless => match notice {
                Ok(notice) if notice.session_id == CONSOLE_ID => {
                    match notice.exit_code {
                        Some(code) => eprintln!("R exited unexpectedly (exit code {code})"),
                        None => eprintln!("R exited unexpectedly"),
                    }
                    return recover(sessions, stdin).await;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => warn!(missed, "crash notices dropped"),
                Err(RecvError::Closed) => return Ok(Supervision::Stopped),
            },
            _ = poll.tick(), if headless => {
                if sessions.status(CONSOLE_ID) == Some(SessionStatus::Crashed) {
                    warn!(session_id = CONSOLE_ID, "interpreter exited; cleaning up");
                    sessions.terminate(CONSOLE_ID);
                    return Ok(Supervision::CleanedUp);
                }
            }
        }
    }
}

/// Restart or discard a crashed console; end of input discards
async fn recover<R>(sessions: &InterpreterSessions, stdin: &mut Lines<R>) -> Result<Supervision>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        match prompt(stdin, "[r]estart or [c]leanup?").await.as_deref() {
            Some("r" | "restart") => {
                let info = sessions.restart(CONSOLE_ID).await?;
                info!(port = ?info.port, "console restarted");
                return Ok(Supervision::Restarted);
            }
            Some("c" | "cleanup") | None => {
                sessions.terminate(CONSOLE_ID);
                return Ok(Supervision::CleanedUp);
            }
            Some(_) => {}
        }
    }
}
