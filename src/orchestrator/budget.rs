//! Budget evaluation against the cumulative accumulators of a run.

use super::state::RunState;

/// The first budget dimension found at or over its ceiling.
#[derive(Debug, Clone, PartialEq)]
pub struct StopCheck {
    pub reason: &'static str,
    pub detail: String,
}

/// Check ceilings in fixed priority order: iterations, cost, tokens, wall time.
///
/// Unset ceilings never trigger. Returns `None` when the loop may continue.
pub fn evaluate_budget(state: &RunState) -> Option<StopCheck> {
    let limits = &state.limits;

    if let Some(max) = limits.max_iterations
        && state.iteration >= max
    {
        return Some(StopCheck {
            reason: "max_iterations_reached",
            detail: format!("iteration={}", state.iteration),
        });
    }

    if let Some(max) = limits.max_cost_usd
        && state.cumulative_cost_usd >= max
    {
        return Some(StopCheck {
            reason: "max_cost_reached",
            detail: format!("cost_usd={:.4}", state.cumulative_cost_usd),
        });
    }

    if let Some(max) = limits.max_tokens_total
        && state.cumulative_tokens >= max
    {
        return Some(StopCheck {
            reason: "max_tokens_reached",
            detail: format!("tokens={}", state.cumulative_tokens),
        });
    }

    if let Some(max) = limits.max_time_minutes {
        let minutes = state.cumulative_wall_time_minutes();
        if minutes >= max as f64 {
            return Some(StopCheck {
                reason: "max_time_reached",
                detail: format!("minutes={:.2}", minutes),
            });
        }
    }

    None
}

/// Spend left under the cost ceiling, floored at zero. `None` without a ceiling.
pub fn remaining_budget_usd(state: &RunState) -> Option<f64> {
    state
        .limits
        .max_cost_usd
        .map(|max| (max - state.cumulative_cost_usd).max(0.0))
}
