use std::sync::Arc;

use murmur_schema::{ConversationContext, ConversationPace, RoleType, RoleWeights};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use crate::{RoleCatalog, SelectorConfig};

/// Weighted stochastic role choice, filtered by what fits the current moment.
#[derive(Debug, Clone)]
pub struct RoleSelector {
    catalog: Arc<RoleCatalog>,
    config: SelectorConfig,
}

impl RoleSelector {
    pub fn new(catalog: Arc<RoleCatalog>, config: SelectorConfig) -> Self {
        Self { catalog, config }
    }

    pub fn is_eligible(&self, role: RoleType, context: &ConversationContext) -> bool {
        let transcript = context.recent_transcript.as_str();
        match role {
            RoleType::Greeting => {
                context.session_duration_ms <= self.config.greeting_window_ms
                    || self.catalog.matches(role, transcript)
            }
            RoleType::Departure => {
                context.session_duration_ms >= self.config.departure_after_ms
                    || self.catalog.matches(role, transcript)
            }
            RoleType::Question => !transcript.trim().is_empty(),
            RoleType::Insider => context.comment_history.len() >= self.config.insider_min_history,
            RoleType::Playful => context.conversation_pace != ConversationPace::Slow,
            RoleType::Reaction | RoleType::Agreement | RoleType::Support => true,
        }
    }

    /// Eligible roles with their weights after pattern boosting.
    pub fn effective_weights(
        &self,
        weights: &RoleWeights,
        context: &ConversationContext,
    ) -> Vec<(RoleType, f64)> {
        weights
            .iter()
            .filter(|(role, _)| self.is_eligible(*role, context))
            .map(|(role, weight)| {
                let boosted = if self.catalog.matches(role, &context.recent_transcript) {
                    weight * self.config.pattern_boost
                } else {
                    weight
                };
                (role, boosted.max(0.0))
            })
            .collect()
    }

    pub fn select_role<R: Rng + ?Sized>(
        &self,
        weights: &RoleWeights,
        context: &ConversationContext,
        rng: &mut R,
    ) -> RoleType {
        let candidates = self.effective_weights(weights, context);
        match WeightedIndex::new(candidates.iter().map(|(_, weight)| *weight)) {
            Ok(dist) => candidates[dist.sample(rng)].0,
            Err(err) => {
                tracing::debug!(error = %err, "no weighted role available, falling back to reaction");
                RoleType::Reaction
            }
        }
    }
}
