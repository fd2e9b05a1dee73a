pub mod completions;
pub mod env;
pub mod inspect;
pub mod resource;
pub mod unlock;

use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use liftoff_core::{Bindings, Context, CoreError, RunReport, UnitOutcome};
use liftoff_schema::parse_config_file;
use std::io::{stderr, stdin, IsTerminal};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_LOCK_HELD: u8 = 3;
pub const EXIT_CANCELLED: u8 = 130;

pub fn exit_code(error: &CoreError) -> u8 {
    if error.is_configuration() {
        EXIT_CONFIG_ERROR
    } else if error.is_lock_contention() {
        EXIT_LOCK_HELD
    } else if matches!(error, CoreError::Cancelled) {
        EXIT_CANCELLED
    } else {
        EXIT_FAILURE
    }
}

/// Load `liftoff.toml` and open its state backend with the local engine
/// and container tool.
pub fn open_context(config_path: &Path) -> Result<Arc<Context>, CoreError> {
    let config = parse_config_file(config_path)?;
    let root = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();
    let bindings = Bindings::local_tools(&config.settings);
    Ok(Arc::new(Context::open(config, &root, bindings)?))
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, CoreError> {
    Ok(serde_json::to_string_pretty(value)?)
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        pb.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn finish(pb: &ProgressBar, msg: String) {
    if let Ok(style) = ProgressStyle::with_template("{msg}") {
        pb.set_style(style);
    }
    pb.finish_with_message(msg);
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    finish(pb, format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    finish(pb, format!("✗ {msg}"));
}

pub fn colorize_status(status: &str) -> String {
    use console::Style;
    match status {
        "ready" | "succeeded" => Style::new().green().apply_to(status).to_string(),
        "creating" | "deleting" => Style::new().yellow().apply_to(status).to_string(),
        "failed" | "deploy_failed" | "promote_failed" => {
            Style::new().red().bold().apply_to(status).to_string()
        }
        "skipped" => Style::new().dim().apply_to(status).to_string(),
        other => other.to_owned(),
    }
}

/// Ask before a destructive step. `--yes` skips the prompt; without a
/// terminal the answer is no.
pub fn confirm(prompt: &str, yes: bool) -> Result<bool, CoreError> {
    if yes {
        return Ok(true);
    }
    if !(stdin().is_terminal() && stderr().is_terminal()) {
        eprintln!("refusing to {prompt} without a terminal (pass --yes)");
        return Ok(false);
    }
    Confirm::new()
        .with_prompt(format!("{prompt}?"))
        .default(false)
        .interact()
        .map_err(|e| CoreError::Io(std::io::Error::other(format!("prompt failed: {e}"))))
}

/// Print a run report; the exit code reflects whether every unit succeeded.
pub fn print_report(report: &RunReport, json: bool) -> Result<u8, CoreError> {
    if json {
        println!("{}", json_pretty(report)?);
    } else {
        for unit in &report.units {
            match &unit.outcome {
                UnitOutcome::Succeeded => {
                    println!(
                        "{:<10} {:<20} {}",
                        unit.kind.to_string(),
                        unit.name,
                        colorize_status("succeeded")
                    );
                }
                UnitOutcome::Failed { error, .. } => {
                    println!(
                        "{:<10} {:<20} {}",
                        unit.kind.to_string(),
                        unit.name,
                        colorize_status("failed")
                    );
                    println!("  {error}");
                    if let Some(log) = &unit.log_ref {
                        println!("  log: {log}");
                    }
                }
                UnitOutcome::Skipped { reason } => {
                    println!(
                        "{:<10} {:<20} {} ({reason})",
                        unit.kind.to_string(),
                        unit.name,
                        colorize_status("skipped")
                    );
                }
            }
        }
        println!("{}: {}", report.operation, report.summary());
    }
    Ok(if report.is_success() {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use liftoff_store::StoreError;

    #[test]
    fn json_pretty_serializes_object() {
        let val = serde_json::json!({"key": "value"});
        let result = json_pretty(&val).unwrap();
        assert!(result.contains("\"key\""));
        assert!(result.contains("\"value\""));
    }

    #[test]
    fn colorize_status_keeps_text() {
        for status in ["ready", "creating", "failed", "deploy_failed", "skipped"] {
            assert!(colorize_status(status).contains(status));
        }
        assert_eq!(colorize_status("unknown"), "unknown");
    }

    #[test]
    fn exit_codes_follow_error_class() {
        assert_eq!(
            exit_code(&CoreError::EnvironmentNotFound("dev".to_owned())),
            EXIT_CONFIG_ERROR
        );
        assert_eq!(exit_code(&CoreError::Cancelled), EXIT_CANCELLED);
        assert_eq!(
            exit_code(&CoreError::Store(StoreError::Backend("down".to_owned()))),
            EXIT_FAILURE
        );
    }

    #[test]
    fn exit_codes_are_distinct() {
        let codes = [
            EXIT_SUCCESS,
            EXIT_FAILURE,
            EXIT_CONFIG_ERROR,
            EXIT_LOCK_HELD,
            EXIT_CANCELLED,
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn confirm_with_yes_skips_prompt() {
        assert!(confirm("delete everything", true).unwrap());
    }

    #[test]
    fn open_context_reports_missing_config() {
        let dir = tempfile::tempdir().unwrap();
        let err = open_context(&dir.path().join("liftoff.toml")).err().unwrap();
        assert!(err.is_configuration(), "{err}");
    }

    #[test]
    fn spinner_finishes() {
        let pb = spinner("testing...");
        spin_ok(&pb, "done");
        let pb = spinner("testing...");
        spin_fail(&pb, "failed");
    }
}
