// src/exam/violation.rs

use serde::{Deserialize, Serialize};

/// Signals raised by the exam client while a supervised attempt runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    TabSwitch,
    FullscreenExit,
    DevtoolsOpen,
    Copy,
    Paste,
    ContextMenu,
    WindowBlur,
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::TabSwitch => "tab_switch",
            ViolationKind::FullscreenExit => "fullscreen_exit",
            ViolationKind::DevtoolsOpen => "devtools_open",
            ViolationKind::Copy => "copy",
            ViolationKind::Paste => "paste",
            ViolationKind::ContextMenu => "context_menu",
            ViolationKind::WindowBlur => "window_blur",
        }
    }

    /// Opening developer tools ends the attempt regardless of tolerance.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ViolationKind::DevtoolsOpen)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViolationPolicy {
    /// Violations allowed before the attempt is terminated.
    pub tolerance: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViolationOutcome {
    pub count: i32,
    pub terminate: bool,
}

impl ViolationPolicy {
    pub fn new(tolerance: u32) -> Self {
        Self { tolerance }
    }

    /// Counts a new violation on top of `prior_count` and decides termination.
    pub fn evaluate(&self, prior_count: i32, kind: ViolationKind) -> ViolationOutcome {
        let count = prior_count.saturating_add(1);
        let over_budget = i64::from(count) > i64::from(self.tolerance);

        ViolationOutcome {
            count,
            terminate: kind.is_fatal() || over_budget,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_tolerance_terminates_immediately() {
        let policy = ViolationPolicy::new(0);
        let outcome = policy.evaluate(0, ViolationKind::TabSwitch);
        assert_eq!(
            outcome,
            ViolationOutcome {
                count: 1,
                terminate: true
            }
        );
    }

    #[test]
    fn test_tolerance_allows_some_violations() {
        let policy = ViolationPolicy::new(2);
        assert!(!policy.evaluate(0, ViolationKind::Copy).terminate);
        assert!(!policy.evaluate(1, ViolationKind::Paste).terminate);
        let third = policy.evaluate(2, ViolationKind::FullscreenExit);
        assert_eq!(third.count, 3);
        assert!(third.terminate);
    }

    #[test]
    fn test_devtools_is_always_fatal() {
        let policy = ViolationPolicy::new(10);
        assert!(policy.evaluate(0, ViolationKind::DevtoolsOpen).terminate);
    }

    #[test]
    fn test_kind_wire_names() {
        let kind: ViolationKind = serde_json::from_str("\"fullscreen_exit\"").unwrap();
        assert_eq!(kind, ViolationKind::FullscreenExit);
        assert_eq!(ViolationKind::WindowBlur.as_str(), "window_blur");
        assert!(serde_json::from_str::<ViolationKind>("\"screenshot\"").is_err());
    }
}
