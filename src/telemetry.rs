//! Injected logging context.
//!
//! Components never log through an implicit per-module logger. They hold a
//! `LogContext` handed to them by their owner, carrying a log target and a
//! scope string (`session=7 patient=12`) that prefixes every line.

use log::Level;
use std::fmt;

#[derive(Clone, Debug)]
pub struct LogContext {
    target: &'static str,
    scope: String,
}

impl LogContext {
    pub fn new(target: &'static str) -> Self {
        Self {
            target,
            scope: String::new(),
        }
    }

    /// Child context with `key=value` appended to the scope.
    pub fn scoped(&self, key: &str, value: impl fmt::Display) -> Self {
        let scope = if self.scope.is_empty() {
            format!("{}={}", key, value)
        } else {
            format!("{} {}={}", self.scope, key, value)
        };
        Self {
            target: self.target,
            scope,
        }
    }

    /// Same scope, different target.
    pub fn with_target(&self, target: &'static str) -> Self {
        Self {
            target,
            scope: self.scope.clone(),
        }
    }

    pub fn target(&self) -> &'static str {
        self.target
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        if self.scope.is_empty() {
            log::log!(target: self.target, level, "{}", args);
        } else {
            log::log!(target: self.target, level, "[{}] {}", self.scope, args);
        }
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Error, args);
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, args);
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Info, args);
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, args);
    }
}

impl Default for LogContext {
    fn default() -> Self {
        Self::new("ward_motion")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_accumulate() {
        let root = LogContext::new("ward_motion::session");
        let child = root.scoped("session", 7).scoped("patient", 12);
        assert_eq!(child.scope(), "session=7 patient=12");
        assert_eq!(child.target(), "ward_motion::session");
        assert!(root.scope().is_empty());
    }

    #[test]
    fn retargeting_keeps_scope() {
        let ctx = LogContext::new("a").scoped("patient", 3).with_target("b");
        assert_eq!(ctx.target(), "b");
        assert_eq!(ctx.scope(), "patient=3");
    }
}
