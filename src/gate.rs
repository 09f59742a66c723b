use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Whether a stage failure halts the run or is only recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GatePolicy {
    #[default]
    Blocking,
    Advisory,
}

impl From<bool> for GatePolicy {
    /// `abort_on_failure` flag as a policy.
    fn from(abort_on_failure: bool) -> Self {
        if abort_on_failure {
            GatePolicy::Blocking
        } else {
            GatePolicy::Advisory
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verdict {
    Passed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GateResult {
    Proceed,
    HaltRun,
}

pub fn evaluate(verdict: Verdict, policy: GatePolicy) -> GateResult {
    match (verdict, policy) {
        (Verdict::Failed, GatePolicy::Blocking) => GateResult::HaltRun,
        _ => GateResult::Proceed,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GateRecord {
    pub stage: String,
    pub verdict: Verdict,
    pub policy: GatePolicy,
    pub result: GateResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Gate decisions for one run, kept for audit whatever the outcome.
#[derive(Debug, Default)]
pub struct QualityGate {
    records: Vec<GateRecord>,
}

impl QualityGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn evaluate(
        &mut self,
        stage: &str,
        verdict: Verdict,
        policy: GatePolicy,
        detail: Option<String>,
    ) -> GateResult {
        let result = evaluate(verdict, policy);
        match (verdict, result) {
            (Verdict::Passed, _) => info!(stage, "Quality gate passed"),
            (Verdict::Failed, GateResult::Proceed) => {
                warn!(stage, "Quality gate failed (advisory, run continues)")
            }
            (Verdict::Failed, GateResult::HaltRun) => warn!(stage, "Quality gate failed"),
        }
        self.records.push(GateRecord {
            stage: stage.to_string(),
            verdict,
            policy,
            result,
            detail,
        });
        result
    }

    pub fn records(&self) -> &[GateRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<GateRecord> {
        self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advisory_policy_always_proceeds() {
        for verdict in [Verdict::Passed, Verdict::Failed] {
            assert_eq!(evaluate(verdict, GatePolicy::from(false)), GateResult::Proceed);
        }
    }

    #[test]
    fn blocking_policy_halts_on_failure_only() {
        assert_eq!(evaluate(Verdict::Failed, GatePolicy::from(true)), GateResult::HaltRun);
        assert_eq!(evaluate(Verdict::Passed, GatePolicy::Blocking), GateResult::Proceed);
    }

    #[test]
    fn advisory_failures_are_still_recorded() {
        let mut gate = QualityGate::new();
        gate.evaluate("sonarqube", Verdict::Failed, GatePolicy::Advisory, None);
        let record = &gate.records()[0];
        assert_eq!(record.verdict, Verdict::Failed);
        assert_eq!(record.result, GateResult::Proceed);
    }
}
