//! Property-based tests for the context pruner.
//!
//! These tests verify that, for arbitrary candidate sets:
//!
//! - No strategy ever exceeds the token budget
//! - Knapsack's total value is never below greedy's
//! - Included and excluded counts account for every input item
//! - Coverage stays within [0, 1]

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::config::PrunerConfig;
    use crate::context::{ContextItem, ContextPruner, PruneStrategy};

    fn arb_strategy() -> impl Strategy<Value = PruneStrategy> {
        prop_oneof![
            Just(PruneStrategy::Greedy),
            Just(PruneStrategy::Knapsack),
            Just(PruneStrategy::Diversity),
        ]
    }

    fn arb_score() -> impl Strategy<Value = f64> {
        prop_oneof![Just(0.0), Just(0.1), Just(1.0), 0.0f64..=1.0]
    }

    fn arb_items() -> impl Strategy<Value = Vec<ContextItem>> {
        prop::collection::vec(
            (0usize..120, arb_score(), arb_score(), arb_score(), prop::option::of((-1.0f32..1.0, -1.0f32..1.0))),
            0..16,
        )
        .prop_map(|raw| {
            raw.into_iter()
                .enumerate()
                .map(|(i, (tokens, relevance, recency, importance, embedding))| {
                    let mut item = ContextItem::new(format!("item-{}", i), "text", tokens)
                        .with_relevance(relevance)
                        .with_recency(recency)
                        .with_importance(importance);
                    if let Some((x, y)) = embedding {
                        item = item.with_embedding(vec![x, y]);
                    }
                    item
                })
                .collect()
        })
    }

    // =========================================================================
    // Budget
    // =========================================================================

    proptest! {
        /// total_tokens never exceeds max_tokens, for every strategy.
        #[test]
        fn budget_is_respected(
            items in arb_items(),
            max_tokens in 0usize..400,
            strategy in arb_strategy(),
        ) {
            let pruner = ContextPruner::default();
            let result = pruner.prune(&items, max_tokens, strategy).unwrap();

            prop_assert!(
                result.total_tokens <= max_tokens,
                "{} used {} of {}", strategy, result.total_tokens, max_tokens
            );
            let summed: usize = result.items.iter().map(|i| i.token_count).sum();
            prop_assert_eq!(summed, result.total_tokens);
        }

        /// Every input item is either included or excluded.
        #[test]
        fn counts_account_for_every_item(
            items in arb_items(),
            max_tokens in 0usize..400,
            strategy in arb_strategy(),
        ) {
            let pruner = ContextPruner::default();
            let result = pruner.prune(&items, max_tokens, strategy).unwrap();

            prop_assert_eq!(result.items_included, result.items.len());
            prop_assert_eq!(result.items_included + result.items_excluded, items.len());
            prop_assert!((0.0..=1.0).contains(&result.coverage));
        }

        /// Nothing below the relevance floor is ever selected.
        #[test]
        fn relevance_floor_is_applied(
            items in arb_items(),
            max_tokens in 0usize..400,
            strategy in arb_strategy(),
        ) {
            let pruner = ContextPruner::default();
            let floor = pruner.config().min_relevance;
            let result = pruner.prune(&items, max_tokens, strategy).unwrap();

            prop_assert!(result.items.iter().all(|i| i.relevance >= floor));
        }
    }

    // =========================================================================
    // Optimality
    // =========================================================================

    proptest! {
        /// The knapsack's total score is at least the greedy pack's.
        #[test]
        fn knapsack_at_least_greedy(
            items in arb_items(),
            max_tokens in 0usize..400,
        ) {
            let pruner = ContextPruner::default();
            let greedy = pruner.prune(&items, max_tokens, PruneStrategy::Greedy).unwrap();
            let knapsack = pruner.prune(&items, max_tokens, PruneStrategy::Knapsack).unwrap();
            prop_assert_eq!(knapsack.strategy, PruneStrategy::Knapsack);

            let total = |selected: &[ContextItem]| -> f64 {
                selected.iter().map(|i| pruner.score(i)).sum()
            };
            prop_assert!(
                total(&knapsack.items) >= total(&greedy.items) - 1e-9,
                "knapsack {} < greedy {}", total(&knapsack.items), total(&greedy.items)
            );
        }

        /// With a budget covering every item, greedy takes every eligible item.
        #[test]
        fn generous_budget_takes_every_eligible_item(items in arb_items()) {
            let pruner = ContextPruner::new(PrunerConfig::default()).unwrap();
            let budget: usize = items.iter().map(|i| i.token_count).sum();
            let eligible = items
                .iter()
                .filter(|i| i.relevance >= pruner.config().min_relevance)
                .count();

            let greedy = pruner.prune(&items, budget, PruneStrategy::Greedy).unwrap();
            prop_assert_eq!(greedy.items_included, eligible);
        }
    }
}
