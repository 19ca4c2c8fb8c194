//! Display substitution at the SSE boundary
//!
//! Fragments leave the relay untouched. Browsers that paste fragments into
//! HTML lose runs of spaces and newlines, so the daemon can optionally
//! replace them with printable tokens right before framing an event.
//!
//! Carriage returns are always folded into `\n`: an SSE `data` field cannot
//! carry a bare `\r`.

use relay_core::config::DisplaySettings;

/// Rewrites whitespace in outgoing fragments
#[derive(Clone, Debug)]
pub struct DisplayEscaper {
    enabled: bool,
    space_token: String,
    newline_token: String,
}

impl DisplayEscaper {
    /// Build from resolved settings
    #[must_use]
    pub fn new(settings: &DisplaySettings) -> Self {
        Self {
            enabled: settings.escape_whitespace,
            space_token: settings.space_token.clone(),
            newline_token: settings.newline_token.clone(),
        }
    }

    /// Rewrite one fragment for the wire
    #[must_use]
    pub fn apply(&self, fragment: &str) -> String {
        let mut out = String::with_capacity(fragment.len());
        let mut chars = fragment.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '\r' => {
                    if chars.peek() == Some(&'\n') {
                        chars.next();
                    }
                    self.push_newline(&mut out);
                }
                '\n' => self.push_newline(&mut out),
                ' ' if self.enabled => out.push_str(&self.space_token),
                other => out.push(other),
            }
        }
        out
    }

    fn push_newline(&self, out: &mut String) {
        if self.enabled {
            out.push_str(&self.newline_token);
        } else {
            out.push('\n');
        }
    }
}
