//! Crash detection from worker stderr and end-reason derivation.

use std::path::Path;
use ttycast_core::EndReason;

/// What a crash marker line told us.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrashInfo {
    pub message: Option<String>,
    pub dump_url: Option<String>,
}

impl CrashInfo {
    /// Later markers refine earlier ones.
    pub fn merge(&mut self, other: CrashInfo) {
        if other.message.is_some() {
            self.message = other.message;
        }
        if other.dump_url.is_some() {
            self.dump_url = other.dump_url;
        }
    }
}

fn dump_url(morgue_url: Option<&str>, path: &str) -> Option<String> {
    let base = morgue_url?;
    let stem = Path::new(path.trim()).file_stem()?.to_string_lossy();
    Some(format!("{base}{stem}"))
}

/// Recognise a crash marker on a worker stderr line.
pub fn classify_error_line(line: &str, morgue_url: Option<&str>) -> Option<CrashInfo> {
    if line.starts_with("ERROR") {
        return Some(CrashInfo {
            message: line.rsplit_once(':').map(|(_, msg)| msg.trim().to_string()),
            dump_url: None,
        });
    }
    if let Some((_, path)) = line.split_once("crash report: ") {
        return Some(CrashInfo {
            message: None,
            dump_url: dump_url(morgue_url, path),
        });
    }
    if line.starts_with("We crashed!") {
        let path = line
            .split_once('(')
            .and_then(|(_, rest)| rest.split_once(')'))
            .map(|(path, _)| path);
        return Some(CrashInfo {
            message: None,
            dump_url: path.and_then(|p| dump_url(morgue_url, p)),
        });
    }
    if line.starts_with("Writing crash info to") {
        let path = line.trim_start_matches("Writing crash info to").trim();
        return Some(CrashInfo {
            message: None,
            dump_url: dump_url(morgue_url, path),
        });
    }
    None
}

/// How a worker's process exit should be reported when the worker itself
/// did not say.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitContext {
    /// The broker sent the graceful stop signal.
    pub stop_requested: bool,
    /// The broker escalated to the forceful signal.
    pub escalated: bool,
}

/// End reason derived from the exit code alone.
pub fn reason_from_exit(exit_code: Option<i32>, ctx: ExitContext) -> EndReason {
    match exit_code {
        Some(0) => EndReason::Normal,
        Some(code) if code > 0 => EndReason::Error,
        Some(_) if ctx.escalated => EndReason::Forced,
        Some(_) if ctx.stop_requested => EndReason::Normal,
        Some(_) => EndReason::Crash,
        None => EndReason::Error,
    }
}
