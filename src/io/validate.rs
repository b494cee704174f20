//! Validation command execution after an agent reports `done`.
//!
//! Each configured validation runs in the working repository with a timeout
//! and bounded output. Commands marked flaky get retries; when a command's
//! binary is missing or it keeps failing, its configured fallback is tried
//! once. Results fold back into the attempt as plain failure text so the
//! retry classifier handles them like any other failure.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::io::config::ValidationCommand;
use crate::io::process::run_command_with_timeout;

/// Outcome of running the full validation suite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Passed,
    /// First command that failed, with the output tail for the classifier.
    Failed { command: String, detail: String },
}

impl ValidationResult {
    pub fn passed(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

/// Seam for validation so scheduler tests can script results.
pub trait Validator {
    fn validate(&self, workdir: &Path, on_tick: &mut dyn FnMut()) -> Result<ValidationResult>;
}

/// Runs the configured validation commands as child processes.
pub struct CommandValidator {
    commands: Vec<ValidationCommand>,
    timeout: Duration,
    output_limit_bytes: usize,
    tick_interval: Duration,
}

impl CommandValidator {
    pub fn new(
        commands: Vec<ValidationCommand>,
        timeout: Duration,
        output_limit_bytes: usize,
        tick_interval: Duration,
    ) -> Self {
        Self {
            commands,
            timeout,
            output_limit_bytes,
            tick_interval,
        }
    }

    #[instrument(skip_all, fields(argv = %argv.join(" ")))]
    fn run_once(
        &self,
        workdir: &Path,
        argv: &[String],
        on_tick: &mut dyn FnMut(),
    ) -> Result<RunOutcome> {
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]).current_dir(workdir);
        match run_command_with_timeout(
            cmd,
            None,
            self.timeout,
            self.output_limit_bytes,
            self.tick_interval,
            on_tick,
        ) {
            Ok(output) if output.status.success() && !output.timed_out => Ok(RunOutcome::Passed),
            Ok(output) => Ok(RunOutcome::Failed(output.failure_tail(2000))),
            // A spawn error usually means the binary is absent; let the
            // fallback command take over instead of aborting the cycle.
            Err(err) => {
                warn!(err = %err, "validation command could not run");
                Ok(RunOutcome::Unrunnable(format!("{err:#}")))
            }
        }
    }

    fn run_with_retries(
        &self,
        workdir: &Path,
        argv: &[String],
        retries: u32,
        on_tick: &mut dyn FnMut(),
    ) -> Result<RunOutcome> {
        let mut last = RunOutcome::Unrunnable("empty command".to_string());
        for run in 0..=retries {
            last = self.run_once(workdir, argv, on_tick)?;
            match &last {
                RunOutcome::Passed => return Ok(last),
                RunOutcome::Unrunnable(_) => return Ok(last),
                RunOutcome::Failed(_) if run < retries => {
                    debug!(run, retries, "validation failed, retrying");
                }
                RunOutcome::Failed(_) => {}
            }
        }
        Ok(last)
    }
}

#[derive(Debug, Clone)]
enum RunOutcome {
    Passed,
    Failed(String),
    Unrunnable(String),
}

impl Validator for CommandValidator {
    #[instrument(skip_all, fields(workdir = %workdir.display()))]
    fn validate(&self, workdir: &Path, on_tick: &mut dyn FnMut()) -> Result<ValidationResult> {
        for validation in &self.commands {
            if validation.command.is_empty() {
                return Err(anyhow!("validation command must be non-empty"));
            }
            let command_display = validation.command.join(" ");
            let outcome =
                self.run_with_retries(workdir, &validation.command, validation.retries, on_tick)?;
            let failure = match outcome {
                RunOutcome::Passed => {
                    info!(command = %command_display, "validation passed");
                    continue;
                }
                RunOutcome::Failed(detail) => detail,
                RunOutcome::Unrunnable(detail) => detail,
            };
            if !validation.fallback.is_empty() {
                let fallback_display = validation.fallback.join(" ");
                info!(command = %command_display, fallback = %fallback_display, "trying fallback validation");
                match self.run_with_retries(workdir, &validation.fallback, 0, on_tick)? {
                    RunOutcome::Passed => continue,
                    RunOutcome::Failed(detail) | RunOutcome::Unrunnable(detail) => {
                        return Ok(ValidationResult::Failed {
                            command: fallback_display,
                            detail,
                        });
                    }
                }
            }
            return Ok(ValidationResult::Failed {
                command: command_display,
                detail: failure,
            });
        }
        Ok(ValidationResult::Passed)
    }
}

/// Resolve a command's binary on `PATH`; used by preflight checks.
pub fn find_on_path(bin: &str) -> Option<PathBuf> {
    let candidate = Path::new(bin);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(bin))
        .find(|full| full.is_file())
}

/// Error out early when any validation command's binary is missing and has
/// no runnable fallback.
pub fn preflight(commands: &[ValidationCommand]) -> Result<()> {
    for validation in commands {
        let primary = validation.command.first().map(String::as_str).unwrap_or("");
        if find_on_path(primary).is_some() {
            continue;
        }
        let fallback = validation.fallback.first().map(String::as_str);
        if let Some(fallback_bin) = fallback
            && find_on_path(fallback_bin).is_some()
        {
            continue;
        }
        return Err(anyhow!("validation binary '{primary}' not found on PATH"))
            .context("validation preflight");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator(commands: Vec<ValidationCommand>) -> CommandValidator {
        CommandValidator::new(
            commands,
            Duration::from_secs(10),
            50_000,
            Duration::from_secs(1),
        )
    }

    fn vc(command: &[&str], fallback: &[&str], retries: u32) -> ValidationCommand {
        ValidationCommand {
            command: command.iter().map(|s| s.to_string()).collect(),
            fallback: fallback.iter().map(|s| s.to_string()).collect(),
            retries,
        }
    }

    #[test]
    fn passing_command_yields_passed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = validator(vec![vc(&["true"], &[], 0)])
            .validate(temp.path(), &mut || {})
            .expect("validate");
        assert!(result.passed());
    }

    #[test]
    fn failing_command_reports_command_and_tail() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = validator(vec![vc(&["sh", "-c", "echo boom >&2; exit 1"], &[], 0)])
            .validate(temp.path(), &mut || {})
            .expect("validate");
        match result {
            ValidationResult::Failed { command, detail } => {
                assert!(command.starts_with("sh"));
                assert!(detail.contains("boom"));
            }
            ValidationResult::Passed => panic!("expected failure"),
        }
    }

    #[test]
    fn missing_binary_falls_back() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = validator(vec![vc(&["no-such-binary-zz"], &["true"], 0)])
            .validate(temp.path(), &mut || {})
            .expect("validate");
        assert!(result.passed());
    }

    #[test]
    fn retries_rerun_flaky_commands() {
        let temp = tempfile::tempdir().expect("tempdir");
        let marker = temp.path().join("marker");
        // Fails on the first run, passes once the marker exists.
        let script = format!(
            "if [ -f {m} ]; then exit 0; else touch {m}; exit 1; fi",
            m = marker.display()
        );
        let result = validator(vec![vc(&["sh", "-c", &script], &[], 1)])
            .validate(temp.path(), &mut || {})
            .expect("validate");
        assert!(result.passed());
    }

    #[test]
    fn stops_at_first_failing_command() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = validator(vec![vc(&["false"], &[], 0), vc(&["true"], &[], 0)])
            .validate(temp.path(), &mut || {})
            .expect("validate");
        assert!(!result.passed());
    }

    #[test]
    fn preflight_accepts_present_and_rejects_missing() {
        preflight(&[vc(&["sh", "-c", "true"], &[], 0)]).expect("sh exists");
        assert!(preflight(&[vc(&["no-such-binary-zz"], &[], 0)]).is_err());
        preflight(&[vc(&["no-such-binary-zz"], &["sh"], 0)]).expect("fallback rescues");
    }

    #[test]
    fn find_on_path_resolves_sh() {
        assert!(find_on_path("sh").is_some());
        assert!(find_on_path("definitely-not-a-binary-zz").is_none());
    }
}
