use std::{str::FromStr, sync::Arc};

use compute::EmulatorType;
use serde::{Deserialize, Serialize};

use crate::compute_link::Compute;

/// How a compute is chosen when a node request does not name one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementStrategy {
    /// Lowest compute id among connected computes hosting the emulator type.
    #[default]
    FirstCapable,
    /// Connected capable compute with the fewest nodes; ties go to the lowest id.
    LeastLoaded,
}

impl PlacementStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            PlacementStrategy::FirstCapable => "first_capable",
            PlacementStrategy::LeastLoaded => "least_loaded",
        }
    }

    pub fn select<'a>(
        self,
        computes: impl IntoIterator<Item = &'a Arc<Compute>>,
        emulator: EmulatorType,
    ) -> Option<Arc<Compute>> {
        let capable = computes
            .into_iter()
            .filter(|compute| compute.is_connected() && compute.supports(emulator));
        let chosen = match self {
            PlacementStrategy::FirstCapable => capable.min_by(|a, b| a.id().cmp(b.id())),
            PlacementStrategy::LeastLoaded => {
                capable.min_by(|a, b| (a.node_count(), a.id()).cmp(&(b.node_count(), b.id())))
            }
        };
        chosen.map(Arc::clone)
    }
}

impl FromStr for PlacementStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "first_capable" => Ok(PlacementStrategy::FirstCapable),
            "least_loaded" => Ok(PlacementStrategy::LeastLoaded),
            other => Err(format!("unknown placement strategy: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_spellings() {
        assert_eq!(
            "least-loaded".parse::<PlacementStrategy>(),
            Ok(PlacementStrategy::LeastLoaded)
        );
        assert_eq!(
            "FIRST_CAPABLE".parse::<PlacementStrategy>(),
            Ok(PlacementStrategy::FirstCapable)
        );
        assert!("random".parse::<PlacementStrategy>().is_err());
    }

    #[test]
    fn selecting_from_nothing_yields_nothing() {
        let none: Vec<Arc<Compute>> = Vec::new();
        assert!(
            PlacementStrategy::LeastLoaded
                .select(&none, EmulatorType::Vpcs)
                .is_none()
        );
    }
}
