//! `ravectl` - install and inspect a RAVE environment from the terminal

mod commands;
mod logging;

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use rave_installer::{InstallerConfig, Platform};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

fn cli() -> Command {
    let platform = Arg::new("platform")
        .long("platform")
        .value_parser(value_parser!(Platform))
        .help("Target platform (macos-arm64, macos-x64, linux, windows); detected by default");
    let plan_file = Arg::new("plan")
        .long("plan")
        .value_parser(value_parser!(PathBuf))
        .help("Plan file to use instead of <plan_dir>/<platform>.yaml");

    Command::new("ravectl")
        .version(rave_installer::VERSION)
        .about("RAVE environment installer")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("TOML configuration file"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .global(true)
                .action(ArgAction::Count)
                .help("More log output (repeat for trace)"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines on stderr"),
        )
        .subcommand(
            Command::new("install")
                .about("Run the installation plan")
                .arg(platform.clone())
                .arg(plan_file.clone())
                .arg(
                    Arg::new("yes")
                        .long("yes")
                        .short('y')
                        .action(ArgAction::SetTrue)
                        .help("Proceed past failed or blocked required steps without asking"),
                ),
        )
        .subcommand(
            Command::new("check")
                .about("Check prerequisites and print a remediation plan")
                .arg(platform.clone())
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                )
                .arg(
                    Arg::new("no-cache")
                        .long("no-cache")
                        .action(ArgAction::SetTrue)
                        .help("Ignore a cached passing report"),
                ),
        )
        .subcommand(
            Command::new("plan")
                .about("Print steps in execution order")
                .arg(platform.clone())
                .arg(plan_file)
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(
            Command::new("eval")
                .about("Evaluate R code in a supervised session")
                .arg(Arg::new("code").required(true).help("R code to evaluate"))
                .arg(
                    Arg::new("serve")
                        .long("serve")
                        .help("Server start command to run afterwards; {port} is substituted"),
                )
                .arg(
                    Arg::new("timeout")
                        .long("timeout")
                        .default_value("60")
                        .value_parser(value_parser!(u64))
                        .help("Evaluation timeout in seconds"),
                )
                .arg(
                    Arg::new("headless")
                        .long("headless")
                        .action(ArgAction::SetTrue)
                        .help("Do not offer restart when R exits unexpectedly; clean up instead"),
                ),
        )
}

fn load_config(matches: &ArgMatches) -> Result<InstallerConfig> {
    match matches.get_one::<PathBuf>("config") {
        Some(path) => InstallerConfig::load(path)
            .with_context(|| format!("reading config {}", path.display())),
        None => Ok(InstallerConfig::default()),
    }
}

fn target_platform(args: &ArgMatches) -> Result<Platform> {
    match args.get_one::<Platform>("platform") {
        Some(platform) => Ok(*platform),
        None => Platform::detect().with_context(|| {
            format!(
                "unsupported platform {}-{}; pass --platform",
                std::env::consts::OS,
                std::env::consts::ARCH
            )
        }),
    }
}

/// `--headless` turns headless on; without it the config file decides
fn headless_override(config: InstallerConfig, args: &ArgMatches) -> InstallerConfig {
    if args.get_flag("headless") {
        config.with_headless(true)
    } else {
        config
    }
}

async fn dispatch(matches: ArgMatches) -> Result<bool> {
    let config = load_config(&matches)?;

    match matches.subcommand() {
        Some(("install", args)) => {
            commands::install(
                config,
                target_platform(args)?,
                args.get_one::<PathBuf>("plan").cloned(),
                args.get_flag("yes"),
            )
            .await
        }
        Some(("check", args)) => {
            commands::check(
                &config,
                target_platform(args)?,
                args.get_flag("json"),
                args.get_flag("no-cache"),
            )
            .await
        }
        Some(("plan", args)) => {
            commands::plan(
                &config,
                target_platform(args)?,
                args.get_one::<PathBuf>("plan").map(PathBuf::as_path),
                args.get_flag("json"),
            )?;
            Ok(true)
        }
        Some(("eval", args)) => {
            let code = args
                .get_one::<String>("code")
                .map(String::as_str)
                .unwrap_or_default();
            let timeout = args.get_one::<u64>("timeout").copied().unwrap_or(60);
            commands::eval(
                &headless_override(config, args),
                code,
                args.get_one::<String>("serve").map(String::as_str),
                Duration::from_secs(timeout),
            )
            .await
        }
        _ => Ok(true),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let matches = cli().get_matches();
    logging::init(
        matches.get_count("verbose"),
        matches.get_flag("log-json"),
    );

    match dispatch(matches).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        cli().debug_assert();
    }

    #[test]
    fn parses_check_flags() {
        let matches = cli()
            .try_get_matches_from(["ravectl", "-vv", "check", "--platform", "linux", "--no-cache"])
            .unwrap();
        assert_eq!(matches.get_count("verbose"), 2);

        let (name, args) = matches.subcommand().unwrap();
        assert_eq!(name, "check");
        assert_eq!(target_platform(args).unwrap(), Platform::Linux);
        assert!(args.get_flag("no-cache"));
        assert!(!args.get_flag("json"));
    }

    #[test]
    fn rejects_unknown_platform() {
        let result = cli().try_get_matches_from(["ravectl", "plan", "--platform", "beos"]);
        assert!(result.is_err());
    }

    #[test]
    fn global_config_flag_after_subcommand() {
        let matches = cli()
            .try_get_matches_from(["ravectl", "install", "--config", "rave.toml", "-y"])
            .unwrap();
        assert_eq!(
            matches.get_one::<PathBuf>("config"),
            Some(&PathBuf::from("rave.toml"))
        );
        let (_, args) = matches.subcommand().unwrap();
        assert!(args.get_flag("yes"));
    }

    #[test]
    fn headless_belongs_to_eval() {
        let result = cli().try_get_matches_from(["ravectl", "install", "--headless"]);
        assert!(result.is_err());

        let matches = cli()
            .try_get_matches_from(["ravectl", "eval", "--headless", "1 + 1"])
            .unwrap();
        let (_, args) = matches.subcommand().unwrap();
        assert!(headless_override(InstallerConfig::default(), args).headless);

        let matches = cli().try_get_matches_from(["ravectl", "eval", "1 + 1"]).unwrap();
        let (_, args) = matches.subcommand().unwrap();
        assert!(!headless_override(InstallerConfig::default(), args).headless);
        let configured = InstallerConfig::default().with_headless(true);
        assert!(headless_override(configured, args).headless);
    }
}
