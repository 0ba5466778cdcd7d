//! Built-in simulation scenarios.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// SIM-001: One purchase from creation to settlement
    EscrowHappyPath,

    /// SIM-002: A third agent tries to move transactions it is not part of
    RogueActor,

    /// SIM-003: Scripts that spin forever or exhaust memory next to a healthy pair
    RunawayScript,

    /// SIM-004: Requester disputes a delivery, then settles it
    DisputeResolution,

    /// SIM-005: Seeded population of requesters and providers trading for a while
    Marketplace,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::EscrowHappyPath,
            ScenarioId::RogueActor,
            ScenarioId::RunawayScript,
            ScenarioId::DisputeResolution,
            ScenarioId::Marketplace,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::EscrowHappyPath => "escrow_happy_path",
            ScenarioId::RogueActor => "rogue_actor",
            ScenarioId::RunawayScript => "runaway_script",
            ScenarioId::DisputeResolution => "dispute_resolution",
            ScenarioId::Marketplace => "marketplace",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::EscrowHappyPath => {
                "Requester buys from a provider: create, commit, start, deliver, release"
            }
            ScenarioId::RogueActor => {
                "Outsider emits releases, cancels and disputes on other agents' transactions"
            }
            ScenarioId::RunawayScript => {
                "Infinite loop and memory hog agents time out without stalling the round"
            }
            ScenarioId::DisputeResolution => {
                "Delivery is disputed with a reason, then the requester releases escrow"
            }
            ScenarioId::Marketplace => {
                "Seeded requesters and providers trade repeatedly; funds must be conserved"
            }
        }
    }

    /// Ticks the scenario needs when no override is given.
    pub fn default_ticks(&self) -> u64 {
        match self {
            ScenarioId::EscrowHappyPath => 6,
            ScenarioId::RogueActor => 6,
            ScenarioId::RunawayScript => 6,
            ScenarioId::DisputeResolution => 8,
            ScenarioId::Marketplace => 40,
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "escrow_happy_path" | "happy_path" | "sim-001" => Ok(ScenarioId::EscrowHappyPath),
            "rogue_actor" | "rogue" | "sim-002" => Ok(ScenarioId::RogueActor),
            "runaway_script" | "runaway" | "sim-003" => Ok(ScenarioId::RunawayScript),
            "dispute_resolution" | "dispute" | "sim-004" => Ok(ScenarioId::DisputeResolution),
            "marketplace" | "sim-005" => Ok(ScenarioId::Marketplace),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
            assert_eq!(scenario.to_string(), scenario.name());
        }
        assert_eq!("SIM-003".parse::<ScenarioId>(), Ok(ScenarioId::RunawayScript));
        assert!("split_brain".parse::<ScenarioId>().is_err());
    }
}
