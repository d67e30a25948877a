use std::collections::HashMap;

use rust_decimal::Decimal;

use super::policy::{Comparator, RuleSpec};

/// Pure rule evaluation: C3 of the design. Unknown comparators always
/// evaluate false rather than erroring.
pub fn evaluate(value: Decimal, comparator: Comparator, target: i64) -> bool {
    let target = Decimal::from(target);
    match comparator {
        Comparator::GreaterThan => value > target,
        Comparator::LessThan => value < target,
        Comparator::Equals => value == target,
        Comparator::Unknown => false,
    }
}

pub fn evaluate_rule(value: Decimal, rule: &RuleSpec) -> bool {
    evaluate(value, rule.operator, rule.target)
}

/// Orders `(node, value)` pairs for the prioritize verb: descending for
/// `GreaterThan`, ascending for `LessThan`. Any other comparator falls back
/// to a stable lexicographic ordering by node id (unspecified by the spec,
/// but must be deterministic).
pub fn ordered_by_comparator(
    values: &HashMap<String, Decimal>,
    comparator: Comparator,
) -> Vec<(String, Decimal)> {
    let mut pairs: Vec<(String, Decimal)> = values.iter().map(|(k, v)| (k.clone(), *v)).collect();
    match comparator {
        Comparator::GreaterThan => pairs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0))),
        Comparator::LessThan => pairs.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0))),
        Comparator::Equals | Comparator::Unknown => pairs.sort_by(|a, b| a.0.cmp(&b.0)),
    }
    pairs
}

/// Converts an ordering into extender scores: `10 - i`, floored at 1.
pub fn scores_from_order(ordered: &[(String, Decimal)]) -> Vec<(String, i64)> {
    ordered
        .iter()
        .enumerate()
        .map(|(i, (node, _))| (node.clone(), (10 - i as i64).max(1)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greater_than_matches_strict_inequality() {
        assert!(evaluate(Decimal::from(21), Comparator::GreaterThan, 20));
        assert!(!evaluate(Decimal::from(20), Comparator::GreaterThan, 20));
    }

    #[test]
    fn less_than_matches_strict_inequality() {
        assert!(evaluate(Decimal::from(19), Comparator::LessThan, 20));
        assert!(!evaluate(Decimal::from(20), Comparator::LessThan, 20));
    }

    #[test]
    fn equals_matches_exact_value() {
        assert!(evaluate(Decimal::from(5), Comparator::Equals, 5));
        assert!(!evaluate(Decimal::from(6), Comparator::Equals, 5));
    }

    #[test]
    fn unknown_comparator_never_holds() {
        assert!(!evaluate(Decimal::from(5), Comparator::Unknown, 5));
    }

    #[test]
    fn ordered_by_greater_than_is_descending() {
        let mut values = HashMap::new();
        values.insert("kind-worker".to_string(), Decimal::from(5));
        values.insert("kind-worker2".to_string(), Decimal::from(90));
        values.insert("kind-worker3".to_string(), Decimal::from(40));

        let ordered = ordered_by_comparator(&values, Comparator::GreaterThan);
        let names: Vec<&str> = ordered.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["kind-worker2", "kind-worker3", "kind-worker"]);
    }

    #[test]
    fn scores_from_order_floor_at_one() {
        let ordered: Vec<(String, Decimal)> = (0..15)
            .map(|i| (format!("n{i}"), Decimal::from(15 - i)))
            .collect();
        let scores = scores_from_order(&ordered);
        assert_eq!(scores[0].1, 10);
        assert_eq!(scores.last().unwrap().1, 1);
    }

    #[test]
    fn scenario_s2_scores_match_expected_values() {
        let mut values = HashMap::new();
        values.insert("kind-worker".to_string(), Decimal::from(5));
        values.insert("kind-worker2".to_string(), Decimal::from(90));
        values.insert("kind-worker3".to_string(), Decimal::from(40));

        let ordered = ordered_by_comparator(&values, Comparator::GreaterThan);
        let scores = scores_from_order(&ordered);
        assert_eq!(
            scores,
            vec![
                ("kind-worker2".to_string(), 10),
                ("kind-worker3".to_string(), 9),
                ("kind-worker".to_string(), 8),
            ]
        );
    }
}
