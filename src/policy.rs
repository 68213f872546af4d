//! Policy engine: `(kind, RiskScore, context)` → recommended action.
//! Pure; the only side effect is a debug trace.

use tracing::debug;

use crate::decision::{Action, RiskScore, Tier};
use crate::request::AnalysisKind;

/// Request context the policy may consult.
#[derive(Debug, Clone, Default)]
pub struct PolicyContext {
    /// Anonymized requester fingerprint, for tracing only.
    pub requester: String,
    /// Degraded evidence entries in the score.
    pub degraded: usize,
}

pub fn decide(kind: AnalysisKind, score: &RiskScore, ctx: &PolicyContext) -> Action {
    let action = match (score.tier(), kind) {
        (Tier::Low, _) => Action::Allow,
        (Tier::Medium, _) => Action::Warn,
        // A payment can be rescued by a second factor instead of refused.
        (Tier::High, AnalysisKind::Transaction) => Action::StepUp,
        (Tier::High, _) => Action::Block,
    };
    debug!(
        kind = %kind,
        requester = %ctx.requester,
        numeric = score.numeric(),
        degraded = ctx.degraded,
        action = action.as_str(),
        "policy decision"
    );
    action
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_map_to_actions() {
        let ctx = PolicyContext::default();
        for kind in AnalysisKind::ALL {
            assert_eq!(decide(kind, &RiskScore::new(10), &ctx), Action::Allow);
            assert_eq!(decide(kind, &RiskScore::new(40), &ctx), Action::Warn);
        }
        assert_eq!(decide(AnalysisKind::Transaction, &RiskScore::new(90), &ctx), Action::StepUp);
        for kind in [AnalysisKind::Text, AnalysisKind::Url, AnalysisKind::CustomerCare, AnalysisKind::Vishing] {
            assert_eq!(decide(kind, &RiskScore::new(75), &ctx), Action::Block);
        }
    }

    #[test]
    fn decision_is_deterministic() {
        let ctx = PolicyContext {
            requester: "abc".into(),
            degraded: 3,
        };
        let s = RiskScore::new(77);
        assert_eq!(
            decide(AnalysisKind::Url, &s, &ctx),
            decide(AnalysisKind::Url, &s, &PolicyContext::default())
        );
    }
}
