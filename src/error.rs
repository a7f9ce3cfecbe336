// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Actionable error text for the command line.
//!
//! Failures are printed with a title, likely causes and numbered fixes, so a
//! user who sees "download failed" also sees what to try next.

use std::fmt;

use crate::download::{TransferSnapshot, TransferStatus};

/// Closing line of every formatted error.
pub const HELP_HINT: &str = "Run again with -v (or RUST_LOG=fetchpool=debug) for detailed logs.";

/// Formats an error message with title, causes, fixes, and help hint.
///
/// # Example
///
/// ```
/// use fetchpool::error::format_error;
///
/// let error = format_error(
///     "Failed to download archive.tar.gz",
///     &["Server unreachable", "File removed from the mirror"],
///     &["Check the URL in a browser", "Retry with more attempts: fetchpool -r 10 <URL>"],
/// );
/// println!("{}", error);
/// ```
pub fn format_error(title: &str, causes: &[&str], fixes: &[&str]) -> String {
    let mut output = format!("[✗] {}\n\n", title);

    if !causes.is_empty() {
        output.push_str("Possible causes:\n");
        for cause in causes {
            output.push_str(&format!("  - {}\n", cause));
        }
        output.push('\n');
    }

    if !fixes.is_empty() {
        output.push_str("Try these fixes:\n");
        for (i, fix) in fixes.iter().enumerate() {
            output.push_str(&format!("  {}. {}\n", i + 1, fix));
        }
        output.push('\n');
    }

    output.push_str(HELP_HINT);
    output
}

/// Builder for constructing formatted error messages.
///
/// # Example
///
/// ```
/// use fetchpool::error::ErrorBuilder;
///
/// let error = ErrorBuilder::new("2 downloads failed")
///     .cause("a.bin: server responded with HTTP 404")
///     .fix("Check the URL is still valid")
///     .build();
/// assert!(error.contains("a.bin"));
/// ```
#[derive(Debug, Clone)]
pub struct ErrorBuilder {
    title: String,
    causes: Vec<String>,
    fixes: Vec<String>,
}

impl ErrorBuilder {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            causes: Vec::new(),
            fixes: Vec::new(),
        }
    }

    pub fn cause(mut self, cause: impl Into<String>) -> Self {
        self.causes.push(cause.into());
        self
    }

    /// Add a fix unless an identical one is already listed.
    pub fn fix(mut self, fix: impl Into<String>) -> Self {
        let fix = fix.into();
        if !self.fixes.contains(&fix) {
            self.fixes.push(fix);
        }
        self
    }

    pub fn build(&self) -> String {
        let causes: Vec<&str> = self.causes.iter().map(String::as_str).collect();
        let fixes: Vec<&str> = self.fixes.iter().map(String::as_str).collect();
        format_error(&self.title, &causes, &fixes)
    }
}

impl fmt::Display for ErrorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.build())
    }
}

/// Summarise failed transfers, or `None` when nothing failed.
///
/// Each failed transfer becomes a cause; fixes are chosen from its last
/// error message.
pub fn failure_report(snapshots: &[TransferSnapshot]) -> Option<String> {
    let failed: Vec<&TransferSnapshot> = snapshots
        .iter()
        .filter(|s| s.status == TransferStatus::Failed)
        .collect();
    if failed.is_empty() {
        return None;
    }

    let title = match failed.len() {
        1 => "1 download failed".to_string(),
        n => format!("{} downloads failed", n),
    };
    let mut builder = ErrorBuilder::new(title);

    for snapshot in failed {
        let reason = snapshot.last_error.as_deref().unwrap_or("unknown error");
        builder = builder.cause(format!("{}: {}", snapshot.source, reason));
        builder = builder.fix(fix_for(reason));
    }

    Some(builder.build())
}

fn fix_for(reason: &str) -> &'static str {
    if reason.starts_with("file exists") {
        "Move or delete the existing file, or choose another directory with -o <DIR>"
    } else if reason.contains("HTTP 4") {
        "Check the URL is correct and still available"
    } else if reason.starts_with("write failed") {
        "Check free disk space and write permission on the download directory"
    } else {
        "Check your connection, then retry with more attempts: -r <N> --backoff <SECS>"
    }
}
