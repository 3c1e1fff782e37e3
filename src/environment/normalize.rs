//! Platform-specific command rewriting.

use regex::{Captures, Regex};
use std::borrow::Cow;
use std::sync::OnceLock;

/// Host platform, as far as command syntax is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    MacOs,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Other
        }
    }
}

fn sed_in_place() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\bsed\s+-i\s+('[^']*'|"[^"]*")"#).expect("Invalid regex for sed -i")
    })
}

/// Rewrites GNU-isms that BSD userland rejects.
///
/// BSD `sed -i` requires a backup suffix argument, so `sed -i 's/a/b/' f`
/// becomes `sed -i '' 's/a/b/' f` on macOS. Other platforms pass through.
#[derive(Debug, Clone, Copy)]
pub struct CommandNormalizer {
    platform: Platform,
}

impl Default for CommandNormalizer {
    fn default() -> Self {
        Self::new(Platform::current())
    }
}

impl CommandNormalizer {
    pub fn new(platform: Platform) -> Self {
        Self { platform }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn normalize<'a>(&self, command: &'a str) -> Cow<'a, str> {
        if self.platform != Platform::MacOs {
            return Cow::Borrowed(command);
        }
        sed_in_place().replace_all(command, |caps: &Captures<'_>| {
            let expr = &caps[1];
            if expr == "''" || expr == "\"\"" {
                caps[0].to_string()
            } else {
                format!("sed -i '' {}", expr)
            }
        })
    }
}
