//! Binary entry point for the nodeprep CLI.

use std::env;
use std::io::{self, Write};
use std::process;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use nodeprep::config_store::{ConfigSource, SettingsSnapshot};
use nodeprep::preflight::CheckRecord;
use nodeprep::{
    ArtifactCache, CheckContext, ClusterConfig, ConfigError, ConfigStore, ConfigStoreError,
    ExecutionEngine, Host, HostPaths, LocalArtifactCache, PreflightError, PreflightReport,
    ProcessCommandRunner, RunMode, SettingValue, all_preflight_checks, preflight_checks,
    setting_keys,
};

mod cli;

use cli::{Cli, Command, ConfigCommand, OutputFormat, RunArgs};

const OS_RELEASE: &str = "/etc/os-release";
const DRIVER_NAME: &str = "crc-driver-libvirt";
const DEFAULT_BUNDLE_NAME: &str = "crc.crcbundle";

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] ConfigStoreError),
    #[error(transparent)]
    Preflight(#[from] PreflightError),
    #[error("unknown setting '{0}'; settings are skip-<check> and warn-<check> for known checks")]
    UnknownSetting(String),
    #[error("setting '{key}' expects true or false, got '{value}'")]
    InvalidValue { key: String, value: String },
    #[error("invalid log level '{0}': use error, warn, info, debug, or trace")]
    LogLevel(String),
    #[error("environment error: {0}")]
    Environment(String),
    #[error("failed to write report: {0}")]
    Output(String),
}

fn main() {
    let cli = Cli::parse();
    let exit_code = match init_tracing(&cli.log_level).and_then(|()| dispatch(cli.command)) {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing(level: &str) -> Result<(), CliError> {
    let filter: LevelFilter = level
        .parse()
        .map_err(|_| CliError::LogLevel(level.to_owned()))?;
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(filter)
        .with_target(false)
        .without_time()
        .init();
    Ok(())
}

fn dispatch(command: Command) -> Result<i32, CliError> {
    match command {
        Command::Preflight(args) => run_checks(RunMode::Verify, &args),
        Command::Setup(args) => run_checks(RunMode::Remediate, &args),
        Command::Cleanup(args) => run_checks(RunMode::Cleanup, &args),
        Command::Config(command) => run_config(command),
    }
}

fn load_config() -> Result<ClusterConfig, CliError> {
    let config = ClusterConfig::load_without_cli_args()?;
    config.validate()?;
    Ok(config)
}

fn current_user() -> Result<String, CliError> {
    env::var("USER")
        .or_else(|_| env::var("USERNAME"))
        .map_err(|_| {
            CliError::Environment(String::from(
                "could not determine the current user: set USER",
            ))
        })
}

fn current_executable() -> Utf8PathBuf {
    env::current_exe()
        .ok()
        .and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
        .unwrap_or_else(|| Utf8PathBuf::from("nodeprep"))
}

fn build_host(config: &ClusterConfig) -> Result<Host<ProcessCommandRunner>, CliError> {
    let bundle_source = config.bundle_path.as_deref().map(Utf8PathBuf::from);
    let bundle_name = bundle_source
        .as_deref()
        .and_then(Utf8Path::file_name)
        .unwrap_or(DEFAULT_BUNDLE_NAME)
        .to_owned();
    let driver: Box<dyn ArtifactCache> = Box::new(
        LocalArtifactCache::new(ProcessCommandRunner, DRIVER_NAME, &config.bin_dir())
            .with_source(config.driver_source.as_deref().map(Utf8PathBuf::from)),
    );
    let bundle: Box<dyn ArtifactCache> = Box::new(
        LocalArtifactCache::new(ProcessCommandRunner, bundle_name, &config.cache_dir())
            .with_source(bundle_source),
    );
    let paths = HostPaths {
        cache_dir: config.cache_dir(),
        bin_dir: config.bin_dir(),
        machines_dir: config.machines_dir(),
        executable: current_executable(),
    };
    Ok(Host::new(
        ProcessCommandRunner,
        paths,
        config.vm_name.as_str(),
        current_user()?,
        driver,
        bundle,
    ))
}

fn run_checks(mode: RunMode, args: &RunArgs) -> Result<i32, CliError> {
    let config = load_config()?;
    let network_mode = match &args.network_mode {
        Some(raw) => raw.parse()?,
        None => config.network_mode()?,
    };
    let host = build_host(&config)?;
    let ctx = CheckContext::inspect(host.runner(), Utf8Path::new(OS_RELEASE), network_mode);
    let registered = all_preflight_checks(ctx.os, &host);
    let snapshot = ConfigStore::new().snapshot(&setting_keys(&registered))?;
    let checks = match mode {
        RunMode::Cleanup => registered,
        RunMode::Verify | RunMode::Remediate => preflight_checks(&ctx, &host),
    };

    let report = ExecutionEngine::new(&snapshot).run(mode, &checks);
    write_report(io::stdout(), &report, args.output)?;
    report.into_result()?;
    Ok(0)
}

fn write_report(
    mut target: impl Write,
    report: &PreflightReport,
    format: OutputFormat,
) -> Result<(), CliError> {
    let output_err = |err: io::Error| CliError::Output(err.to_string());
    match format {
        OutputFormat::Json => {
            let rendered = serde_json::to_string_pretty(&report.records)
                .map_err(|err| CliError::Output(err.to_string()))?;
            writeln!(target, "{rendered}").map_err(output_err)
        }
        OutputFormat::Text => {
            for record in &report.records {
                writeln!(target, "{}", render_record(record)).map_err(output_err)?;
            }
            Ok(())
        }
    }
}

fn render_record(record: &CheckRecord) -> String {
    let mut line = format!("{:<21} {}", record.outcome, record.id);
    if let Some(message) = &record.message {
        line.push_str(": ");
        line.push_str(message);
    }
    line
}

/// Settings are editable even while the cluster configuration is invalid,
/// so the key registry loads without semantic validation.
fn known_setting_keys() -> Result<Vec<String>, CliError> {
    let config = ClusterConfig::load_without_cli_args()?;
    let host = build_host(&config)?;
    let os = nodeprep::preflight::HostOs::current();
    Ok(setting_keys(&all_preflight_checks(os, &host)))
}

fn require_known(keys: &[String], key: &str) -> Result<(), CliError> {
    if keys.iter().any(|known| known == key) {
        Ok(())
    } else {
        Err(CliError::UnknownSetting(key.to_owned()))
    }
}

fn run_config(command: ConfigCommand) -> Result<i32, CliError> {
    let keys = known_setting_keys()?;
    let store = ConfigStore::new();
    let mut stdout = io::stdout();
    let output_err = |err: io::Error| CliError::Output(err.to_string());
    match command {
        ConfigCommand::Set { key, value } => {
            require_known(&keys, &key)?;
            let parsed = SettingValue::parse(&value);
            if parsed.as_bool().is_none() {
                return Err(CliError::InvalidValue { key, value });
            }
            let path = store.set(&key, &parsed)?;
            writeln!(stdout, "Set {key} = {parsed} in {path}").map_err(output_err)?;
        }
        ConfigCommand::Get { key } => {
            require_known(&keys, &key)?;
            let snapshot = store.snapshot(&keys)?;
            writeln!(stdout, "{}", describe_setting(&snapshot, &key)).map_err(output_err)?;
        }
        ConfigCommand::Unset { key } => {
            require_known(&keys, &key)?;
            let message = if store.unset(&key)? {
                format!("Unset {key}")
            } else {
                format!("{key} was not set")
            };
            writeln!(stdout, "{message}").map_err(output_err)?;
        }
    }
    Ok(0)
}

fn describe_setting(snapshot: &SettingsSnapshot, key: &str) -> String {
    snapshot
        .get_string(key)
        .map_or_else(|| format!("{key} is not set"), |value| format!("{key} = {value}"))
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
    let guidance = match err {
        CliError::Preflight(failure) => failure.guidance(),
        _ => None,
    };
    if let Some(text) = guidance {
        writeln!(target, "{text}").ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeprep::preflight::CheckOutcome;
    use std::collections::BTreeMap;

    fn record(id: &str, outcome: CheckOutcome, message: Option<&str>) -> CheckRecord {
        CheckRecord {
            id: id.to_owned(),
            description: format!("Checking {id}"),
            outcome,
            message: message.map(str::to_owned),
        }
    }

    fn report() -> PreflightReport {
        PreflightReport {
            records: vec![
                record("check-kvm-enabled", CheckOutcome::Fixed, None),
                record("check-vsock", CheckOutcome::WarnedFailed, Some("vsock is broken")),
            ],
            failure: None,
        }
    }

    #[test]
    fn text_report_lists_every_check() {
        let mut buf = Vec::new();
        write_report(&mut buf, &report(), OutputFormat::Text).expect("write report");
        let rendered = String::from_utf8(buf).expect("utf8");

        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines.first().is_some_and(|line| line.starts_with("fixed") && line.ends_with("check-kvm-enabled")));
        assert!(lines.get(1).is_some_and(|line| line.ends_with("check-vsock: vsock is broken")));
    }

    #[test]
    fn json_report_serialises_records() {
        let mut buf = Vec::new();
        write_report(&mut buf, &report(), OutputFormat::Json).expect("write report");
        let value: serde_json::Value = serde_json::from_slice(&buf).expect("json");

        assert_eq!(value.pointer("/0/outcome").and_then(|v| v.as_str()), Some("fixed"));
        assert_eq!(value.pointer("/1/message").and_then(|v| v.as_str()), Some("vsock is broken"));
        assert!(value.pointer("/0/message").is_none());
    }

    #[test]
    fn unknown_settings_are_rejected() {
        let keys = vec![String::from("skip-check-vsock")];

        assert!(require_known(&keys, "skip-check-vsock").is_ok());
        let err = require_known(&keys, "skip-check-nothing").expect_err("unknown key");
        assert!(err.to_string().contains("skip-check-nothing"));
    }

    #[test]
    fn describes_missing_and_present_settings() {
        let mut file = BTreeMap::new();
        file.insert(String::from("skip-check-vsock"), SettingValue::Bool(true));
        let snapshot = SettingsSnapshot::from_sources(file, &[], Vec::new());

        assert_eq!(describe_setting(&snapshot, "skip-check-vsock"), "skip-check-vsock = true");
        assert_eq!(describe_setting(&snapshot, "warn-check-vsock"), "warn-check-vsock is not set");
    }

    #[test]
    fn write_error_includes_guidance() {
        let failure = PreflightError::CheckFailed {
            id: String::from("check-virt-enabled"),
            description: String::from("Checking if Virtualization is enabled"),
            guidance: Some(String::from("You need to enable virtualization in BIOS")),
            source: Box::new(nodeprep::CheckError::precondition("no vmx flag")),
        };
        let mut buf = Vec::new();
        write_error(&mut buf, &CliError::Preflight(failure));
        let rendered = String::from_utf8(buf).expect("utf8");

        assert!(rendered.contains("no vmx flag"));
        assert!(rendered.contains("enable virtualization in BIOS"));
    }

    #[test]
    fn rejects_unknown_log_levels() {
        assert!(matches!(init_tracing("chatty"), Err(CliError::LogLevel(_))));
    }
}
