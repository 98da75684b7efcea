use core::str::FromStr;

use serde::{Deserialize, Serialize};

use larder_core::DomainError;

/// Costing method used to value a withdrawal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostingMethod {
    Fifo,
    Lifo,
    WeightedAverage,
    Standard,
}

impl CostingMethod {
    pub const ALL: [CostingMethod; 4] = [
        CostingMethod::Fifo,
        CostingMethod::Lifo,
        CostingMethod::WeightedAverage,
        CostingMethod::Standard,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CostingMethod::Fifo => "fifo",
            CostingMethod::Lifo => "lifo",
            CostingMethod::WeightedAverage => "weighted_average",
            CostingMethod::Standard => "standard",
        }
    }

    /// Whether results carry a per-batch breakdown.
    pub fn is_layered(&self) -> bool {
        matches!(self, CostingMethod::Fifo | CostingMethod::Lifo)
    }
}

impl core::fmt::Display for CostingMethod {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CostingMethod {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fifo" => Ok(CostingMethod::Fifo),
            "lifo" => Ok(CostingMethod::Lifo),
            "weighted_average" | "weightedaverage" | "wac" => Ok(CostingMethod::WeightedAverage),
            "standard" => Ok(CostingMethod::Standard),
            other => Err(DomainError::validation(format!(
                "unknown costing method '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_names_and_aliases() {
        assert_eq!("FIFO".parse::<CostingMethod>().unwrap(), CostingMethod::Fifo);
        assert_eq!("wac".parse::<CostingMethod>().unwrap(), CostingMethod::WeightedAverage);
        for method in CostingMethod::ALL {
            assert_eq!(method.as_str().parse::<CostingMethod>().unwrap(), method);
        }
    }

    #[test]
    fn unknown_method_is_a_validation_error() {
        match "average-ish".parse::<CostingMethod>() {
            Err(DomainError::Validation(msg)) => assert!(msg.contains("average-ish")),
            other => panic!("expected validation error, got {other:?}"),
        }
    }
}
