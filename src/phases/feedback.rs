//! Feedback phase (`spec.md` §4.8.4): turns a failing verification report
//! into a string for the next Build invocation. Never fails; empty
//! feedback is a legal result.

use crate::models::VerificationReport;

pub fn generate(report: &VerificationReport) -> String {
    let failing = report.failing_checks();
    if failing.is_empty() {
        return String::new();
    }
    let mut out = String::from("The following checks are still failing:\n");
    for check in failing {
        out.push_str(&format!("- {}: {}\n", check.name, check.message));
    }
    out
}
