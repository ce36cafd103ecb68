use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissionKind {
    Transport,
    Colonize,
    Attack,
    Spy,
    Move,
    Recycle,
}

impl MissionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Colonize => "colonize",
            Self::Attack => "attack",
            Self::Spy => "spy",
            Self::Move => "move",
            Self::Recycle => "recycle",
        }
    }
}

/// Storable resources carried by a fleet or requested by an action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Cargo {
    #[serde(default)]
    pub metal: f64,
    #[serde(default)]
    pub deuterium: f64,
    #[serde(default)]
    pub microchips: f64,
}

impl Cargo {
    pub fn has_negative(&self) -> bool {
        self.metal < 0.0 || self.deuterium < 0.0 || self.microchips < 0.0
    }
}

fn one() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeStructure {
    pub user_id: String,
    pub planet_id: String,
    pub structure: String,
    #[serde(default = "one")]
    pub levels: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartResearch {
    pub user_id: String,
    pub planet_id: String,
    pub technology: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildShip {
    pub user_id: String,
    pub planet_id: String,
    pub ship: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartMission {
    pub user_id: String,
    pub origin_planet_id: String,
    pub destination_planet_id: String,
    pub mission: MissionKind,
    pub ships: BTreeMap<String, u64>,
    #[serde(default)]
    pub cargo: Cargo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignHomeworld {
    pub user_id: String,
    pub planet_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePlanet {
    pub x: i64,
    pub y: i64,
    #[serde(default)]
    pub galaxy: i64,
    pub biome: String,
}

/// Status body returned by every action entry point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionStatus {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finishes_at_ms: Option<i64>,
}

impl ActionStatus {
    pub fn accepted(entity_id: impl Into<String>, finishes_at_ms: Option<i64>) -> Self {
        Self {
            ok: true,
            entity_id: Some(entity_id.into()),
            finishes_at_ms,
            ..Self::default()
        }
    }

    pub fn rejected(code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            code: Some(code.into()),
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

pub mod actions {
    pub const UPGRADE_STRUCTURE: &str = "upgrade-structure";
    pub const START_RESEARCH: &str = "start-research";
    pub const BUILD_SHIP: &str = "build-ship";
    pub const START_MISSION: &str = "start-mission";
    pub const ASSIGN_HOMEWORLD: &str = "assign-homeworld";
}
