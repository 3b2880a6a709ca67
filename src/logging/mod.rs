//! Logging and output control
//!
//! This module provides the [`Logger`] for controlling output verbosity and
//! formatting log lines. The logger is injected: the dispatcher clones it into
//! every worker, and per-image lines carry a grep-stable `IMG=<id>` field tag.

use std::time::Duration;

/// Logger responsible for all user-visible output
#[derive(Debug, Clone)]
pub struct Logger {
    pub verbose: bool,
    pub quiet: bool,
}

impl Logger {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            quiet: false,
        }
    }

    pub fn new_quiet() -> Self {
        Self {
            verbose: false,
            quiet: true,
        }
    }

    /// Main section heading
    pub fn section(&self, title: &str) {
        if !self.quiet {
            println!("\n=== {} ===", title);
        }
    }

    /// Information message
    pub fn info(&self, message: &str) {
        if !self.quiet {
            println!("ℹ️  {}", message);
        }
    }

    /// Success message
    pub fn success(&self, message: &str) {
        if !self.quiet {
            println!("✅ {}", message);
        }
    }

    /// Warning message
    pub fn warning(&self, message: &str) {
        if !self.quiet {
            println!("⚠️  WARNING: {}", message);
        }
    }

    /// Error message
    pub fn error(&self, message: &str) {
        eprintln!("❌ ERROR: {}", message);
    }

    pub fn debug(&self, message: &str) {
        if self.verbose && !self.quiet {
            println!("🐛 DEBUG: {}", message);
        }
    }

    /// Detailed information (only shown in verbose mode)
    pub fn detail(&self, message: &str) {
        if self.verbose && !self.quiet {
            println!("   {}", message);
        }
    }

    /// Image-scoped view prefixing every line with `IMG=<id>`
    pub fn img(&self, id: usize) -> ImageLog<'_> {
        ImageLog { logger: self, id }
    }

    /// Format file size in human-readable units
    pub fn format_size(&self, bytes: u64) -> String {
        if bytes < 1024 {
            format!("{} B", bytes)
        } else if bytes < 1024 * 1024 {
            format!("{:.1} KB", bytes as f64 / 1024.0)
        } else if bytes < 1024 * 1024 * 1024 {
            format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
        } else {
            format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
        }
    }

    /// Format duration in human-readable format
    pub fn format_duration(&self, duration: Duration) -> String {
        let secs = duration.as_secs();
        if secs < 60 {
            format!("{}s", secs)
        } else if secs < 3600 {
            format!("{}m{}s", secs / 60, secs % 60)
        } else {
            format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
        }
    }
}

/// Logger view bound to one job id
#[derive(Debug, Clone, Copy)]
pub struct ImageLog<'a> {
    logger: &'a Logger,
    id: usize,
}

impl ImageLog<'_> {
    pub fn info(&self, message: &str) {
        self.logger.info(&format!("IMG={} {}", self.id, message));
    }

    pub fn warning(&self, message: &str) {
        self.logger.warning(&format!("IMG={} {}", self.id, message));
    }

    pub fn error(&self, message: &str) {
        self.logger.error(&format!("IMG={} {}", self.id, message));
    }

    pub fn debug(&self, message: &str) {
        self.logger.debug(&format!("IMG={} {}", self.id, message));
    }
}
