//! Gate Pipeline (`spec.md` §4.10): ordered gate evaluation with a tiny,
//! total expression language for `skipIf`.

use crate::drivers::{DriverRegistry, GateRunnerContext};
use crate::models::{Gate, GateCondition, GateResult, GateSuccessAction, GatePipelineResult, VerificationReport};

impl Gate {
    fn check_type_key(&self) -> &'static str {
        use crate::models::GateCheck::*;
        match &self.check {
            VerificationLevels => "verification-levels",
            CiPoll => "ci-poll",
            CustomCommand { .. } => "custom-command",
            Approval => "approval",
            Convergence => "convergence",
        }
    }
}

/// Evaluates `gate.<name>.passed` and `iteration <op> <int>` against prior
/// results and the current iteration. Unknown expressions are not an
/// error: they simply evaluate to `false` (do not skip), per spec.
fn eval_skip_if(expr: &str, prior_results: &[GateResult], iteration: u32) -> bool {
    let expr = expr.trim();
    if let Some(name) = expr.strip_prefix("gate.").and_then(|s| s.strip_suffix(".passed")) {
        return prior_results.iter().any(|r| r.gate_name == name && r.passed);
    }
    let parts: Vec<&str> = expr.splitn(2, char::is_whitespace).collect();
    if parts.len() == 2 && parts[0] == "iteration" {
        let rest = parts[1].trim();
        for op in ["<=", ">=", "==", "<", ">"] {
            if let Some(value) = rest.strip_prefix(op) {
                if let Ok(n) = value.trim().parse::<i64>() {
                    let it = iteration as i64;
                    return match op {
                        "<=" => it <= n,
                        ">=" => it >= n,
                        "==" => it == n,
                        "<" => it < n,
                        ">" => it > n,
                        _ => false,
                    };
                }
            }
        }
    }
    false
}

/// Runs every gate in order against the registry's runners, collecting
/// results and formatting a single feedback string for any failures.
pub async fn run_pipeline(
    gates: &[Gate],
    registry: &DriverRegistry,
    workspace_path: &str,
    iteration: u32,
    files_changed: u32,
    verification_report: Option<VerificationReport>,
) -> GatePipelineResult {
    let mut results: Vec<GateResult> = Vec::new();

    for gate in gates {
        let skip = match gate.condition {
            GateCondition::Manual => true,
            GateCondition::OnChange if files_changed == 0 => true,
            _ => gate.skip_if.as_deref().map(|e| eval_skip_if(e, &results, iteration)).unwrap_or(false),
        };
        if skip {
            results.push(GateResult {
                gate_name: gate.name.clone(),
                passed: true,
                skipped: true,
                message: "skipped".to_string(),
                duration_ms: 0,
                details: None,
            });
            continue;
        }

        let Some(runner) = registry.gate_runners.get(gate.check_type_key()) else {
            let result = GateResult {
                gate_name: gate.name.clone(),
                passed: false,
                skipped: false,
                message: format!("No runner for type '{}'", gate.check_type_key()),
                duration_ms: 0,
                details: None,
            };
            results.push(result);
            return finish(results, Some(gate.name.clone()));
        };

        let ctx = GateRunnerContext {
            gate_name: gate.name.clone(),
            workspace_path: workspace_path.to_string(),
            prior_results: results.clone(),
            verification_report: verification_report.clone(),
        };
        let result = match runner.run(gate, &ctx).await {
            Ok(r) => r,
            Err(e) => GateResult {
                gate_name: gate.name.clone(),
                passed: false,
                skipped: false,
                message: e.to_string(),
                duration_ms: 0,
                details: None,
            },
        };
        let passed = result.passed;
        results.push(result);

        if passed {
            if gate.on_success == Some(GateSuccessAction::SkipRemaining) {
                return finish(results, None);
            }
        } else if matches!(gate.on_failure.action, crate::models::GateFailureAction::Stop) {
            return finish(results, Some(gate.name.clone()));
        }
    }

    finish(results, None)
}

fn finish(results: Vec<GateResult>, stopped_at: Option<String>) -> GatePipelineResult {
    let failing: Vec<&GateResult> = results.iter().filter(|r| !r.passed && !r.skipped).collect();
    let feedback = if failing.is_empty() {
        None
    } else {
        let mut out = String::from("## Gate Check Results\n");
        for result in &failing {
            out.push_str(&format!("- {}: {}\n", result.gate_name, result.message));
        }
        Some(out)
    };
    let passed = results.iter().all(|r| r.passed || r.skipped);
    GatePipelineResult { passed, results, stopped_at, feedback }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_if_gate_passed_reference() {
        let prior = vec![GateResult {
            gate_name: "lint".to_string(),
            passed: true,
            skipped: false,
            message: String::new(),
            duration_ms: 0,
            details: None,
        }];
        assert!(eval_skip_if("gate.lint.passed", &prior, 0));
        assert!(!eval_skip_if("gate.missing.passed", &prior, 0));
    }

    #[test]
    fn skip_if_iteration_comparison() {
        assert!(eval_skip_if("iteration >= 3", &[], 3));
        assert!(!eval_skip_if("iteration >= 3", &[], 2));
        assert!(eval_skip_if("iteration < 3", &[], 1));
    }

    #[test]
    fn skip_if_unknown_expression_does_not_skip() {
        assert!(!eval_skip_if("garbage expression", &[], 0));
    }
}
