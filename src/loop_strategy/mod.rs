//! Loop Strategy (`spec.md` §4.9): a small polymorphic capability set
//! rather than a class hierarchy — one trait, four implementations
//! resolved by name at configure time (`spec.md` §9).

use std::collections::VecDeque;

/// Per-iteration facts the strategies reason over. Built by the Engine
/// from the iteration's `IterationData` plus the verification report.
#[derive(Debug, Clone)]
pub struct IterationSignal {
    pub iteration: u32,
    pub verification_passed: bool,
    pub files_changed: u32,
    pub loop_detection_confidence: f64,
    pub ci_pass: Option<bool>,
    pub progress_score: f64,
    pub fingerprint: String,
}

#[derive(Debug, Clone)]
pub struct LoopContext {
    pub max_iterations: u32,
    pub history: Vec<IterationSignal>,
}

impl LoopContext {
    pub fn current(&self) -> Option<&IterationSignal> {
        self.history.last()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Continue,
    Stop(String),
    Pause,
}

/// `{initialize, onLoopStart, onIterationStart, shouldContinue,
/// onIterationEnd, onLoopEnd, getProgress, detectLoop, reset}` from
/// `spec.md` §4.9. Default bodies give the no-op behaviour most variants
/// don't need to override.
pub trait LoopStrategy: Send + Sync {
    fn on_loop_start(&mut self, _ctx: &LoopContext) {}
    fn on_iteration_start(&mut self, _ctx: &LoopContext) {}
    fn should_continue(&mut self, ctx: &LoopContext) -> Decision;
    fn on_iteration_end(&mut self, _ctx: &LoopContext, _decision: &Decision) {}
    fn on_loop_end(&mut self, _ctx: &LoopContext, _final_decision: &Decision) {}

    fn get_progress(&self, ctx: &LoopContext) -> f64 {
        if ctx.max_iterations == 0 {
            return 1.0;
        }
        (ctx.history.len() as f64 / ctx.max_iterations as f64).min(1.0)
    }

    fn detect_loop(&self, ctx: &LoopContext) -> bool {
        ctx.current().map(|s| s.loop_detection_confidence >= 0.8).unwrap_or(false)
    }

    fn reset(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionSignal {
    VerificationPass,
    NoChanges,
    LoopDetection,
    CiPass,
}

/// Continues until `maxIterations`, or any enabled completion signal
/// triggers.
pub struct FixedStrategy {
    pub enabled_signals: Vec<CompletionSignal>,
}

impl LoopStrategy for FixedStrategy {
    fn should_continue(&mut self, ctx: &LoopContext) -> Decision {
        let Some(current) = ctx.current() else {
            return Decision::Continue;
        };
        if current.iteration + 1 >= ctx.max_iterations {
            return Decision::Stop("max_iterations".to_string());
        }
        for signal in &self.enabled_signals {
            let triggered = match signal {
                CompletionSignal::VerificationPass => current.verification_passed,
                CompletionSignal::NoChanges => current.files_changed == 0,
                CompletionSignal::LoopDetection => current.loop_detection_confidence >= 0.8,
                CompletionSignal::CiPass => current.ci_pass == Some(true),
            };
            if triggered {
                let reason = match signal {
                    CompletionSignal::VerificationPass => "verification_pass",
                    CompletionSignal::NoChanges => "no_changes",
                    CompletionSignal::LoopDetection => "loop_detection",
                    CompletionSignal::CiPass => "ci_pass",
                };
                return Decision::Stop(reason.to_string());
            }
        }
        Decision::Continue
    }
}

/// Fixed `base_iterations`, then up to `bonus_iterations` more while
/// measured progress stays above `progress_threshold`.
pub struct HybridStrategy {
    pub base_iterations: u32,
    pub bonus_iterations: u32,
    pub progress_threshold: f64,
}

impl LoopStrategy for HybridStrategy {
    fn should_continue(&mut self, ctx: &LoopContext) -> Decision {
        let Some(current) = ctx.current() else {
            return Decision::Continue;
        };
        let done = current.iteration + 1;
        if done < self.base_iterations {
            return Decision::Continue;
        }
        let bonus_used = done.saturating_sub(self.base_iterations);
        if bonus_used >= self.bonus_iterations {
            return Decision::Stop("bonus_iterations_exhausted".to_string());
        }
        if current.progress_score < self.progress_threshold {
            return Decision::Stop("progress_below_threshold".to_string());
        }
        Decision::Continue
    }
}

/// "ralph" strategy: stop once a rolling window of recent fingerprints is
/// pairwise-similar above `convergence_threshold`, and the minimum
/// iteration count has been met.
pub struct ConvergenceStrategy {
    pub window_size: usize,
    pub convergence_threshold: f64,
    pub min_iterations: u32,
    window: VecDeque<String>,
}

impl ConvergenceStrategy {
    pub fn new(window_size: usize, convergence_threshold: f64, min_iterations: u32) -> Self {
        Self { window_size, convergence_threshold, min_iterations, window: VecDeque::new() }
    }

    /// Jaccard similarity over whitespace tokens — cheap, total, and
    /// order-independent, matching the other example repos' fingerprinting.
    fn similarity(a: &str, b: &str) -> f64 {
        use std::collections::HashSet;
        let set_a: HashSet<&str> = a.split_whitespace().collect();
        let set_b: HashSet<&str> = b.split_whitespace().collect();
        if set_a.is_empty() && set_b.is_empty() {
            return 1.0;
        }
        let intersection = set_a.intersection(&set_b).count();
        let union = set_a.union(&set_b).count();
        if union == 0 {
            0.0
        } else {
            intersection as f64 / union as f64
        }
    }

    fn pairwise_similarity(&self) -> f64 {
        if self.window.len() < 2 {
            return 0.0;
        }
        let items: Vec<&String> = self.window.iter().collect();
        let mut total = 0.0;
        let mut pairs = 0u32;
        for i in 0..items.len() {
            for j in (i + 1)..items.len() {
                total += Self::similarity(items[i], items[j]);
                pairs += 1;
            }
        }
        if pairs == 0 {
            0.0
        } else {
            total / pairs as f64
        }
    }
}

impl LoopStrategy for ConvergenceStrategy {
    fn on_iteration_end(&mut self, ctx: &LoopContext, _decision: &Decision) {
        if let Some(current) = ctx.current() {
            self.window.push_back(current.fingerprint.clone());
            while self.window.len() > self.window_size {
                self.window.pop_front();
            }
        }
    }

    fn should_continue(&mut self, ctx: &LoopContext) -> Decision {
        let Some(current) = ctx.current() else {
            return Decision::Continue;
        };
        if current.iteration + 1 >= ctx.max_iterations {
            return Decision::Stop("max_iterations".to_string());
        }
        if current.iteration + 1 < self.min_iterations {
            return Decision::Continue;
        }
        if self.window.len() >= self.window_size && self.pairwise_similarity() >= self.convergence_threshold {
            return Decision::Stop("converged".to_string());
        }
        Decision::Continue
    }

    fn reset(&mut self) {
        self.window.clear();
    }
}

/// Delegates the whole capability set to a user-supplied implementation
/// resolved at configure time. Errors during delegation are fatal for the
/// run, so this variant deliberately has no fallback behaviour of its own.
pub struct CustomStrategy {
    pub delegate: Box<dyn LoopStrategy>,
}

impl LoopStrategy for CustomStrategy {
    fn on_loop_start(&mut self, ctx: &LoopContext) {
        self.delegate.on_loop_start(ctx);
    }

    fn on_iteration_start(&mut self, ctx: &LoopContext) {
        self.delegate.on_iteration_start(ctx);
    }

    fn should_continue(&mut self, ctx: &LoopContext) -> Decision {
        self.delegate.should_continue(ctx)
    }

    fn on_iteration_end(&mut self, ctx: &LoopContext, decision: &Decision) {
        self.delegate.on_iteration_end(ctx, decision);
    }

    fn on_loop_end(&mut self, ctx: &LoopContext, final_decision: &Decision) {
        self.delegate.on_loop_end(ctx, final_decision);
    }

    fn get_progress(&self, ctx: &LoopContext) -> f64 {
        self.delegate.get_progress(ctx)
    }

    fn detect_loop(&self, ctx: &LoopContext) -> bool {
        self.delegate.detect_loop(ctx)
    }

    fn reset(&mut self) {
        self.delegate.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(iteration: u32, passed: bool, files_changed: u32) -> IterationSignal {
        IterationSignal {
            iteration,
            verification_passed: passed,
            files_changed,
            loop_detection_confidence: 0.0,
            ci_pass: None,
            progress_score: 1.0,
            fingerprint: format!("fp-{iteration}"),
        }
    }

    #[test]
    fn fixed_stops_on_verification_pass() {
        let mut strategy = FixedStrategy { enabled_signals: vec![CompletionSignal::VerificationPass] };
        let ctx = LoopContext { max_iterations: 5, history: vec![signal(0, true, 1)] };
        assert_eq!(strategy.should_continue(&ctx), Decision::Stop("verification_pass".to_string()));
    }

    #[test]
    fn fixed_stops_at_max_iterations() {
        let mut strategy = FixedStrategy { enabled_signals: vec![] };
        let ctx = LoopContext { max_iterations: 2, history: vec![signal(1, false, 1)] };
        assert_eq!(strategy.should_continue(&ctx), Decision::Stop("max_iterations".to_string()));
    }

    #[test]
    fn hybrid_grants_bonus_while_progress_holds() {
        let mut strategy = HybridStrategy { base_iterations: 2, bonus_iterations: 2, progress_threshold: 0.3 };
        let mut ctx = LoopContext { max_iterations: 10, history: vec![signal(1, false, 1)] };
        assert_eq!(strategy.should_continue(&ctx), Decision::Continue);
        ctx.history.push(signal(2, false, 1));
        assert_eq!(strategy.should_continue(&ctx), Decision::Continue);
    }

    #[test]
    fn convergence_stops_once_window_is_similar() {
        let mut strategy = ConvergenceStrategy::new(2, 0.99, 1);
        let mut ctx = LoopContext {
            max_iterations: 10,
            history: vec![IterationSignal { fingerprint: "a b c".into(), ..signal(0, false, 1) }],
        };
        strategy.on_iteration_end(&ctx, &Decision::Continue);
        ctx.history.push(IterationSignal { fingerprint: "a b c".into(), ..signal(1, false, 1) });
        strategy.on_iteration_end(&ctx, &Decision::Continue);
        assert_eq!(strategy.should_continue(&ctx), Decision::Stop("converged".to_string()));
    }
}
