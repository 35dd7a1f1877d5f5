//! Connector ranking strategies.

use std::cmp::Ordering;
use std::fmt;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::multi_connector::shape::{ConnectorPerformance, VettingLevel};

/// A connector as seen by a comparer: its name and what analysis knows about
/// it for one prompt shape.
#[derive(Debug, Clone, Copy)]
pub struct ConnectorCandidate<'a> {
    pub name: &'a str,
    pub is_main: bool,
    pub performance: &'a ConnectorPerformance,
}

/// Ranks connectors for a prompt shape.
///
/// `compare` returns [`Ordering::Less`] when `a` should be preferred over `b`,
/// so sorting candidates ascending puts the best one first.
pub trait ConnectorComparer: Send + Sync + fmt::Debug {
    fn compare(&self, a: &ConnectorCandidate<'_>, b: &ConnectorCandidate<'_>) -> Ordering;
}

/// Default comparer: usable connectors first, then a weighted blend of
/// relative cost and relative duration.
///
/// A connector is usable once vetted (the main connector is the oracle and
/// always usable). Ties go to the higher vetting level, then to the name.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedCostPerformanceComparer {
    pub cost_weight: f64,
    pub duration_weight: f64,
}

impl WeightedCostPerformanceComparer {
    pub fn new(cost_weight: f64, duration_weight: f64) -> Self {
        Self {
            cost_weight,
            duration_weight,
        }
    }

    /// Signed relative difference in `[-1, 1]`; negative when `a < b`.
    fn relative(a: f64, b: f64) -> f64 {
        let max = a.abs().max(b.abs());
        if max == 0.0 { 0.0 } else { (a - b) / max }
    }

    fn score(&self, a: &ConnectorPerformance, b: &ConnectorPerformance) -> f64 {
        let cost = Self::relative(decimal_to_f64(a.average_cost), decimal_to_f64(b.average_cost));
        let duration = Self::relative(
            a.average_duration.as_secs_f64(),
            b.average_duration.as_secs_f64(),
        );
        self.cost_weight * cost + self.duration_weight * duration
    }
}

impl Default for WeightedCostPerformanceComparer {
    fn default() -> Self {
        Self {
            cost_weight: 1.0,
            duration_weight: 0.5,
        }
    }
}

fn decimal_to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

fn is_usable(candidate: &ConnectorCandidate<'_>) -> bool {
    candidate.is_main || candidate.performance.vetting_level >= VettingLevel::Vetted
}

impl ConnectorComparer for WeightedCostPerformanceComparer {
    fn compare(&self, a: &ConnectorCandidate<'_>, b: &ConnectorCandidate<'_>) -> Ordering {
        match (is_usable(a), is_usable(b)) {
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            _ => {}
        }

        let score = self.score(a.performance, b.performance);
        if score < 0.0 {
            return Ordering::Less;
        }
        if score > 0.0 {
            return Ordering::Greater;
        }

        b.performance
            .vetting_level
            .cmp(&a.performance.vetting_level)
            .then_with(|| a.name.cmp(b.name))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rust_decimal_macros::dec;

    use super::*;

    fn perf(level: VettingLevel, cost: Decimal, millis: u64) -> ConnectorPerformance {
        ConnectorPerformance {
            vetting_level: level,
            average_cost: cost,
            average_duration: Duration::from_millis(millis),
            ..Default::default()
        }
    }

    fn candidate<'a>(name: &'a str, is_main: bool, p: &'a ConnectorPerformance) -> ConnectorCandidate<'a> {
        ConnectorCandidate {
            name,
            is_main,
            performance: p,
        }
    }

    #[test]
    fn unvetted_secondary_never_beats_main() {
        let main = perf(VettingLevel::Oracle, dec!(1), 1000);
        let cheap = perf(VettingLevel::None, dec!(0.01), 10);
        let cmp = WeightedCostPerformanceComparer::default();
        assert_eq!(
            cmp.compare(&candidate("b", false, &cheap), &candidate("a", true, &main)),
            Ordering::Greater
        );
    }

    #[test]
    fn invalid_connector_ranks_last() {
        let main = perf(VettingLevel::Oracle, dec!(1), 1000);
        let bad = perf(VettingLevel::Invalid, dec!(0), 0);
        let cmp = WeightedCostPerformanceComparer::default();
        assert_eq!(
            cmp.compare(&candidate("a", true, &main), &candidate("b", false, &bad)),
            Ordering::Less
        );
    }

    #[test]
    fn cheaper_vetted_connector_wins() {
        let main = perf(VettingLevel::Oracle, dec!(0.02), 100);
        let cheap = perf(VettingLevel::Vetted, dec!(0.002), 100);
        let cmp = WeightedCostPerformanceComparer::default();
        assert_eq!(
            cmp.compare(&candidate("b", false, &cheap), &candidate("a", true, &main)),
            Ordering::Less
        );
    }

    #[test]
    fn duration_weight_can_outweigh_cost() {
        let main = perf(VettingLevel::Oracle, dec!(0.011), 100);
        let slow = perf(VettingLevel::Vetted, dec!(0.010), 2000);
        let cmp = WeightedCostPerformanceComparer::new(1.0, 1.0);
        assert_eq!(
            cmp.compare(&candidate("b", false, &slow), &candidate("a", true, &main)),
            Ordering::Greater
        );
    }

    #[test]
    fn exact_tie_prefers_higher_vetting_level() {
        let main = perf(VettingLevel::Oracle, dec!(0.01), 100);
        let twin = perf(VettingLevel::Vetted, dec!(0.01), 100);
        let cmp = WeightedCostPerformanceComparer::default();
        assert_eq!(
            cmp.compare(&candidate("a", true, &main), &candidate("b", false, &twin)),
            Ordering::Less
        );
    }
}
