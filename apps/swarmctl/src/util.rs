use anyhow::{bail, Result};
use std::process::Command;

pub const MAX_LOG_LINES: usize = 200;

pub fn trim_logs(logs: &mut Vec<String>) {
    if logs.len() > MAX_LOG_LINES {
        let excess = logs.len() - MAX_LOG_LINES;
        logs.drain(..excess);
    }
}

pub fn shell_quote(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }
    let escaped = value.replace('\'', "'\"'\"'");
    format!("'{escaped}'")
}

/// Last `max_lines` non-empty lines of command output, for error messages.
pub fn output_tail(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

pub fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn validate_username(username: &str) -> Result<()> {
    let trimmed = username.trim();
    if trimmed.is_empty() {
        bail!("Username is required");
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        bail!("Username contains unsupported characters");
    }
    Ok(())
}

pub fn run_cmd(mut command: Command) -> Result<()> {
    let status = command.status()?;
    if !status.success() {
        bail!("Command failed: {command:?}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_wraps_and_escapes_single_quotes() {
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), "'it'\"'\"'s'");
    }

    #[test]
    fn trim_logs_keeps_most_recent_lines() {
        let mut logs: Vec<String> = (0..MAX_LOG_LINES + 5).map(|i| i.to_string()).collect();
        trim_logs(&mut logs);
        assert_eq!(logs.len(), MAX_LOG_LINES);
        assert_eq!(logs.first().map(String::as_str), Some("5"));
    }

    #[test]
    fn output_tail_skips_blank_lines() {
        let tail = output_tail("a\n\nb\nc\n\n", 2);
        assert_eq!(tail, "b\nc");
    }

    #[test]
    fn validate_username_rejects_shell_metacharacters() {
        assert!(validate_username("pi").is_ok());
        assert!(validate_username("ops.admin").is_ok());
        assert!(validate_username("").is_err());
        assert!(validate_username("pi; rm -rf /").is_err());
    }
}
