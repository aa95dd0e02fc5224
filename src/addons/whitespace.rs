//! Prompt whitespace minimizer.
//!
//! Collapses runs of spaces and tabs, trims line ends and caps blank lines
//! so fewer input tokens are billed. Fenced code blocks are left untouched.

use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use serde::Serialize;

use super::{Addon, AddonContext, AddonError, Interception};

pub const WHITESPACE_ADDON_NAME: &str = "whitespace_minimizer";

const FENCE: &str = "```";

/// Knobs for [`minimize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinimizeOptions {
    /// Leave fenced code blocks exactly as written.
    pub preserve_code_blocks: bool,
    /// Longest allowed run of consecutive newlines.
    pub max_consecutive_newlines: usize,
    /// Join prose lines with single spaces.
    pub aggressive: bool,
}

impl Default for MinimizeOptions {
    fn default() -> Self {
        Self {
            preserve_code_blocks: true,
            max_consecutive_newlines: 2,
            aggressive: false,
        }
    }
}

enum Line {
    Text(String),
    Blank,
    Code(String),
}

/// Minimize whitespace in `text`.
pub fn minimize(text: &str, options: &MinimizeOptions) -> String {
    let mut lines = Vec::new();
    let mut in_code = false;

    for raw in text.lines() {
        let is_fence = raw.trim_start().starts_with(FENCE);
        if options.preserve_code_blocks && (in_code || is_fence) {
            if is_fence {
                in_code = !in_code;
            }
            lines.push(Line::Code(raw.to_string()));
            continue;
        }
        let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        lines.push(if collapsed.is_empty() {
            Line::Blank
        } else {
            Line::Text(collapsed)
        });
    }

    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0usize;
    let mut previous_was_text = false;

    for line in lines {
        match line {
            Line::Blank => {
                blank_run += 1;
                if !options.aggressive && blank_run < options.max_consecutive_newlines {
                    out.push('\n');
                }
                previous_was_text = false;
            }
            Line::Text(content) => {
                if !out.is_empty() {
                    let joined = options.aggressive && previous_was_text && blank_run == 0;
                    out.push(if joined { ' ' } else { '\n' });
                }
                out.push_str(&content);
                blank_run = 0;
                previous_was_text = true;
            }
            Line::Code(content) => {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(&content);
                blank_run = 0;
                previous_was_text = false;
            }
        }
    }

    out.trim().to_string()
}

/// Minimizer statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MinimizerStats {
    pub requests: u64,
    pub chars_saved: u64,
}

/// Rewrites the effective prompt (and system message) before it is sent.
pub struct WhitespaceMinimizerAddon {
    options: MinimizeOptions,
    requests: AtomicU64,
    chars_saved: AtomicU64,
}

impl WhitespaceMinimizerAddon {
    pub fn new(options: MinimizeOptions) -> Self {
        Self {
            options,
            requests: AtomicU64::new(0),
            chars_saved: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> MinimizerStats {
        MinimizerStats {
            requests: self.requests.load(Ordering::Relaxed),
            chars_saved: self.chars_saved.load(Ordering::Relaxed),
        }
    }

    fn shrink(&self, text: &mut String) -> u64 {
        let before = text.chars().count();
        *text = minimize(text, &self.options);
        before.saturating_sub(text.chars().count()) as u64
    }
}

impl Default for WhitespaceMinimizerAddon {
    fn default() -> Self {
        Self::new(MinimizeOptions::default())
    }
}

impl Addon for WhitespaceMinimizerAddon {
    fn name(&self) -> &str {
        WHITESPACE_ADDON_NAME
    }

    fn description(&self) -> &str {
        "Collapses redundant whitespace in prompts"
    }

    fn pre_request<'a>(
        &'a self,
        ctx: &'a mut AddonContext,
    ) -> BoxFuture<'a, Result<Option<Interception>, AddonError>> {
        Box::pin(async move {
            let mut saved = self.shrink(&mut ctx.prompt);
            if let Some(system) = ctx.params.system_message.as_mut() {
                saved += self.shrink(system);
            }
            self.requests.fetch_add(1, Ordering::Relaxed);
            self.chars_saved.fetch_add(saved, Ordering::Relaxed);
            if saved > 0 {
                tracing::debug!(request_id = %ctx.request_id, chars_saved = saved, "Prompt minimized");
            }
            Ok(None)
        })
    }
}
