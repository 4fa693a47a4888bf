//! Diagnostic sink
//!
//! Every phase reports problems here instead of aborting: errors accumulate
//! and analysis continues at the nearest synchronization point, so one run
//! can surface several diagnostics. Phase boundaries check `error_count()`
//! and skip later phases when it is nonzero. Only `fatal` stops a phase
//! immediately, by returning an error the driver propagates.
//!
//! Warning identity and grouping live in `warnings.toml` (embedded at build
//! time): each warning has an id and a group deciding whether it is on by
//! default or enabled by `-Wall` / `-Wextra`. `-Werror` promotes warnings
//! to errors at report time.

use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

/// Embedded warning registry.
pub static WARNING_DEFS: &str = include_str!("warnings.toml");

/// A position in the preprocessed source.
///
/// Attached to every token, AST node, symbol, and diagnostic. Line and
/// column are 1-indexed for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLoc {
    pub file: Rc<str>,
    pub line: u32,
    pub col: u32,
}

impl SourceLoc {
    pub fn new(file: Rc<str>, line: u32, col: u32) -> Self {
        SourceLoc { file, line, col }
    }

    /// Location for diagnostics that have no useful position.
    pub fn builtin() -> Self {
        SourceLoc {
            file: Rc::from("<built-in>"),
            line: 0,
            col: 0,
        }
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.col)
    }
}

/// Severity of a recorded diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Note,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Note => write!(f, "note"),
        }
    }
}

/// Warning group from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum WarningGroup {
    Default,
    All,
    Extra,
}

/// One entry from `warnings.toml`.
#[derive(Debug, Clone, Deserialize)]
struct WarningDef {
    id: String,
    group: WarningGroup,
    #[allow(dead_code)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct WarningFile {
    warning: Vec<WarningDef>,
}

/// A single recorded diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub loc: SourceLoc,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.loc, self.severity, self.message)
    }
}

/// The diagnostic sink.
///
/// Owned by the compilation session; passed by `&mut` through the phases.
pub struct Diagnostics {
    messages: Vec<Diagnostic>,
    errors: usize,
    warnings: usize,
    werror: bool,
    enabled: HashSet<String>,
}

impl Diagnostics {
    /// Build a sink from the embedded registry and the `-W` flags.
    pub fn new(wall: bool, wextra: bool, werror: bool) -> Self {
        let defs: WarningFile =
            toml::from_str(WARNING_DEFS).expect("embedded warnings.toml must parse");
        let mut enabled = HashSet::new();
        for def in defs.warning {
            let on = match def.group {
                WarningGroup::Default => true,
                WarningGroup::All => wall || wextra,
                WarningGroup::Extra => wextra,
            };
            if on {
                enabled.insert(def.id);
            }
        }
        Diagnostics {
            messages: Vec::new(),
            errors: 0,
            warnings: 0,
            werror,
            enabled,
        }
    }

    /// Record an error at `loc`. Analysis continues.
    pub fn error_at(&mut self, loc: &SourceLoc, message: impl Into<String>) {
        self.errors += 1;
        self.messages.push(Diagnostic {
            severity: Severity::Error,
            loc: loc.clone(),
            message: message.into(),
        });
    }

    /// Record an always-on warning at `loc`.
    pub fn warning_at(&mut self, loc: &SourceLoc, message: impl Into<String>) {
        self.push_warning(loc, message.into());
    }

    /// Record a registered warning, if its group is enabled.
    pub fn warn(&mut self, id: &str, loc: &SourceLoc, message: impl Into<String>) {
        debug_assert!(
            WARNING_DEFS.contains(id),
            "warning id {:?} missing from warnings.toml",
            id
        );
        if self.enabled.contains(id) {
            let msg = format!("{} [-W{}]", message.into(), id);
            self.push_warning(loc, msg);
        }
    }

    fn push_warning(&mut self, loc: &SourceLoc, message: String) {
        if self.werror {
            self.errors += 1;
            self.messages.push(Diagnostic {
                severity: Severity::Error,
                loc: loc.clone(),
                message,
            });
        } else {
            self.warnings += 1;
            self.messages.push(Diagnostic {
                severity: Severity::Warning,
                loc: loc.clone(),
                message,
            });
        }
    }

    /// Record an unrecoverable problem and produce the error value the
    /// current phase returns to the driver.
    pub fn fatal(&mut self, message: impl Into<String>) -> String {
        let message = message.into();
        self.errors += 1;
        self.messages.push(Diagnostic {
            severity: Severity::Error,
            loc: SourceLoc::builtin(),
            message: message.clone(),
        });
        message
    }

    pub fn error_count(&self) -> usize {
        self.errors
    }

    pub fn warning_count(&self) -> usize {
        self.warnings
    }

    pub fn has_errors(&self) -> bool {
        self.errors > 0
    }

    pub fn messages(&self) -> &[Diagnostic] {
        &self.messages
    }

    /// Render every diagnostic plus the closing summary line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for m in &self.messages {
            out.push_str(&m.to_string());
            out.push('\n');
        }
        if self.errors > 0 || self.warnings > 0 {
            out.push_str(&format!(
                "{} error(s), {} warning(s)\n",
                self.errors, self.warnings
            ));
        }
        out
    }

    /// True when any recorded message contains `needle`. Test helper used
    /// throughout the suites.
    pub fn contains(&self, needle: &str) -> bool {
        self.messages.iter().any(|m| m.message.contains(needle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc() -> SourceLoc {
        SourceLoc::new(Rc::from("t.c"), 3, 7)
    }

    #[test]
    fn test_error_formatting() {
        let mut diags = Diagnostics::new(false, false, false);
        diags.error_at(&loc(), "undeclared identifier 'x'");
        let rendered = diags.render();
        assert!(rendered.contains("t.c:3:7: error: undeclared identifier 'x'"));
        assert!(rendered.contains("1 error(s), 0 warning(s)"));
    }

    #[test]
    fn test_warning_groups() {
        // unused-variable is in group "all": off by default.
        let mut diags = Diagnostics::new(false, false, false);
        diags.warn("unused-variable", &loc(), "local 'x' is never used");
        assert_eq!(diags.warning_count(), 0);

        let mut diags = Diagnostics::new(true, false, false);
        diags.warn("unused-variable", &loc(), "local 'x' is never used");
        assert_eq!(diags.warning_count(), 1);
        assert!(diags.contains("[-Wunused-variable]"));
    }

    #[test]
    fn test_wextra_implies_wall_group() {
        let mut diags = Diagnostics::new(false, true, false);
        diags.warn("unused-variable", &loc(), "local 'x' is never used");
        diags.warn("unused-parameter", &loc(), "parameter 'p' is never used");
        assert_eq!(diags.warning_count(), 2);
    }

    #[test]
    fn test_werror_promotion() {
        let mut diags = Diagnostics::new(false, false, true);
        diags.warning_at(&loc(), "something dubious");
        assert_eq!(diags.error_count(), 1);
        assert_eq!(diags.warning_count(), 0);
        assert!(diags.has_errors());
    }

    #[test]
    fn test_fatal_counts_as_error() {
        let mut diags = Diagnostics::new(false, false, false);
        let msg = diags.fatal("unsupported target 'vax'");
        assert_eq!(msg, "unsupported target 'vax'");
        assert!(diags.has_errors());
    }
}
