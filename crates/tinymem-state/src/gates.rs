//! Gate evaluation results and the reason-string format.
//!
//! Every promotion attempt records all three gate results in a single
//! transition reason, pass or fail, so the ledger alone explains every
//! decision the machine ever made.

use std::fmt;

/// Outcome of one gate evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct GateResult {
    /// "A", "B", or "C".
    pub gate: &'static str,
    /// Whether the gate allows promotion. An abstaining gate allows.
    pub passed: bool,
    /// Human-readable detail: what was checked and what was found.
    pub detail: String,
}

impl GateResult {
    /// A passing result.
    pub fn pass(gate: &'static str, detail: impl Into<String>) -> Self {
        Self {
            gate,
            passed: true,
            detail: detail.into(),
        }
    }

    /// A failing result.
    pub fn fail(gate: &'static str, detail: impl Into<String>) -> Self {
        Self {
            gate,
            passed: false,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for GateResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.passed { "pass" } else { "fail" };
        if self.detail.is_empty() {
            write!(f, "gate_{}={}", self.gate.to_lowercase(), verdict)
        } else {
            write!(
                f,
                "gate_{}={}({})",
                self.gate.to_lowercase(),
                verdict,
                self.detail
            )
        }
    }
}

/// Join the three gate results and the decision into one reason string.
pub fn summarize(a: &GateResult, b: &GateResult, c: &GateResult, decision: &str) -> String {
    format!("{a}, {b}, {c}; {decision}")
}
