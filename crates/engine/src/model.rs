use serde::{Deserialize, Serialize};
use starhold_protocol::{Cargo, MissionKind};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use crate::error::ActionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
    Metal,
    Deuterium,
    Microchips,
    Energy,
}

impl Resource {
    pub const STORABLE: [Resource; 3] = [Resource::Metal, Resource::Deuterium, Resource::Microchips];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Metal => "metal",
            Self::Deuterium => "deuterium",
            Self::Microchips => "microchips",
            Self::Energy => "energy",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quantities of the storable resources (costs, cargo, seed stock).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceAmounts {
    #[serde(default)]
    pub metal: f64,
    #[serde(default)]
    pub deuterium: f64,
    #[serde(default)]
    pub microchips: f64,
}

impl ResourceAmounts {
    pub fn metal(metal: f64) -> Self {
        Self {
            metal,
            ..Self::default()
        }
    }

    pub fn get(&self, resource: Resource) -> f64 {
        match resource {
            Resource::Metal => self.metal,
            Resource::Deuterium => self.deuterium,
            Resource::Microchips => self.microchips,
            Resource::Energy => 0.0,
        }
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            metal: self.metal * factor,
            deuterium: self.deuterium * factor,
            microchips: self.microchips * factor,
        }
    }

    pub fn plus(&self, other: &Self) -> Self {
        Self {
            metal: self.metal + other.metal,
            deuterium: self.deuterium + other.deuterium,
            microchips: self.microchips + other.microchips,
        }
    }

    pub fn total(&self) -> f64 {
        self.metal + self.deuterium + self.microchips
    }

    pub fn is_empty(&self) -> bool {
        self.total() <= 0.0
    }
}

impl From<Cargo> for ResourceAmounts {
    fn from(c: Cargo) -> Self {
        Self {
            metal: c.metal,
            deuterium: c.deuterium,
            microchips: c.microchips,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub x: i64,
    pub y: i64,
    #[serde(default)]
    pub galaxy: i64,
}

impl Position {
    pub fn new(x: i64, y: i64, galaxy: i64) -> Self {
        Self { x, y, galaxy }
    }
}

/// Stored resources of a planet. Only valid as of `last_update_ms`; re-run
/// accrual before trusting them. `energy` is the net balance, never stock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanetResources {
    pub metal: f64,
    pub deuterium: f64,
    pub microchips: f64,
    pub energy: f64,
    pub last_update_ms: i64,
}

impl PlanetResources {
    pub fn seeded(stock: &ResourceAmounts, at_ms: i64) -> Self {
        Self {
            metal: stock.metal,
            deuterium: stock.deuterium,
            microchips: stock.microchips,
            energy: 0.0,
            last_update_ms: at_ms,
        }
    }

    pub fn get(&self, resource: Resource) -> f64 {
        match resource {
            Resource::Metal => self.metal,
            Resource::Deuterium => self.deuterium,
            Resource::Microchips => self.microchips,
            Resource::Energy => self.energy,
        }
    }

    pub fn get_mut(&mut self, resource: Resource) -> &mut f64 {
        match resource {
            Resource::Metal => &mut self.metal,
            Resource::Deuterium => &mut self.deuterium,
            Resource::Microchips => &mut self.microchips,
            Resource::Energy => &mut self.energy,
        }
    }

    pub fn check_affordable(&self, cost: &ResourceAmounts) -> Result<(), ActionError> {
        for resource in Resource::STORABLE {
            let needed = cost.get(resource);
            let available = self.get(resource);
            if needed > available {
                return Err(ActionError::Insufficient {
                    resource,
                    needed,
                    available,
                });
            }
        }
        Ok(())
    }

    pub fn debit(&mut self, cost: &ResourceAmounts) {
        for resource in Resource::STORABLE {
            *self.get_mut(resource) -= cost.get(resource);
        }
    }

    pub fn credit(&mut self, amounts: &ResourceAmounts) {
        for resource in Resource::STORABLE {
            *self.get_mut(resource) += amounts.get(resource);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Structure {
    #[serde(rename = "type")]
    pub kind: String,
    pub level: u32,
    #[serde(default)]
    pub construction_levels: Option<u32>,
    #[serde(default)]
    pub construction_start_ms: Option<i64>,
    #[serde(default)]
    pub construction_finish_ms: Option<i64>,
}

impl Structure {
    pub fn new(kind: impl Into<String>, level: u32) -> Self {
        Self {
            kind: kind.into(),
            level,
            construction_levels: None,
            construction_start_ms: None,
            construction_finish_ms: None,
        }
    }

    pub fn is_upgrading(&self) -> bool {
        self.construction_finish_ms.is_some()
    }

    pub fn clear_construction(&mut self) {
        self.construction_levels = None;
        self.construction_start_ms = None;
        self.construction_finish_ms = None;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Planet {
    pub id: String,
    pub season: String,
    pub owner_id: Option<String>,
    pub position: Position,
    pub biome: String,
    pub resources: PlanetResources,
    #[serde(default)]
    pub structures: Vec<Structure>,
    #[serde(default)]
    pub ships: BTreeMap<String, u64>,
    #[serde(skip)]
    pub rev: i64,
}

impl Planet {
    pub fn unowned(
        id: impl Into<String>,
        season: &str,
        position: Position,
        biome: &str,
        now_ms: i64,
    ) -> Self {
        Self {
            id: id.into(),
            season: season.to_string(),
            owner_id: None,
            position,
            biome: biome.to_string(),
            resources: PlanetResources {
                last_update_ms: now_ms,
                ..PlanetResources::default()
            },
            structures: Vec::new(),
            ships: BTreeMap::new(),
            rev: 0,
        }
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.owner_id.as_deref() == Some(user_id)
    }

    pub fn structure(&self, kind: &str) -> Option<&Structure> {
        self.structures.iter().find(|s| s.kind == kind)
    }

    pub fn structure_level(&self, kind: &str) -> u32 {
        self.structure(kind).map(|s| s.level).unwrap_or(0)
    }

    /// Returns the structure, adding it at level 0 if it was never built.
    pub fn structure_mut(&mut self, kind: &str) -> &mut Structure {
        let idx = match self.structures.iter().position(|s| s.kind == kind) {
            Some(idx) => idx,
            None => {
                self.structures.push(Structure::new(kind, 0));
                self.structures.len() - 1
            }
        };
        &mut self.structures[idx]
    }

    pub fn station_ships(&mut self, ships: &BTreeMap<String, u64>) {
        for (ship, count) in ships {
            if *count > 0 {
                *self.ships.entry(ship.clone()).or_default() += count;
            }
        }
    }

    pub fn remove_ships(&mut self, ships: &BTreeMap<String, u64>) -> Result<(), ActionError> {
        for (ship, count) in ships {
            let stationed = self.ships.get(ship).copied().unwrap_or(0);
            if *count > stationed {
                return Err(ActionError::InvalidFleet(format!(
                    "{count} {ship} requested but only {stationed} stationed"
                )));
            }
        }
        for (ship, count) in ships {
            if let Some(stationed) = self.ships.get_mut(ship) {
                *stationed -= count;
                if *stationed == 0 {
                    self.ships.remove(ship);
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResearchEntry {
    pub level: u32,
    #[serde(default)]
    pub is_researching: bool,
    #[serde(default)]
    pub research_start_ms: Option<i64>,
    #[serde(default)]
    pub research_finish_ms: Option<i64>,
    #[serde(default)]
    pub researching_planet_id: Option<String>,
}

impl ResearchEntry {
    pub fn clear_research(&mut self) {
        self.is_researching = false;
        self.research_start_ms = None;
        self.research_finish_ms = None;
        self.researching_planet_id = None;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserResearch {
    pub user_id: String,
    pub season: String,
    /// Max concurrent in-flight researches across all of the user's planets.
    pub capacity: u32,
    #[serde(default)]
    pub technologies: BTreeMap<String, ResearchEntry>,
    #[serde(skip)]
    pub rev: i64,
}

impl UserResearch {
    pub fn new(user_id: &str, season: &str, capacity: u32) -> Self {
        Self {
            user_id: user_id.to_string(),
            season: season.to_string(),
            capacity,
            technologies: BTreeMap::new(),
            rev: 0,
        }
    }

    pub fn level(&self, technology: &str) -> u32 {
        self.technologies
            .get(technology)
            .map(|e| e.level)
            .unwrap_or(0)
    }

    pub fn active_count(&self) -> usize {
        self.technologies
            .values()
            .filter(|e| e.is_researching)
            .count()
    }
}

/// One enqueued batch. Only the head of the queue is in progress; timings of
/// the others are projections that get recomputed when they become head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipCommand {
    pub ship: String,
    pub count: u64,
    pub remaining: u64,
    pub item_ms: i64,
    pub current_item_start_ms: i64,
    pub current_item_finish_ms: i64,
    pub construction_start_ms: i64,
    pub construction_finish_ms: i64,
}

impl ShipCommand {
    pub fn new(ship: &str, count: u64, item_ms: i64) -> Self {
        Self {
            ship: ship.to_string(),
            count,
            remaining: count,
            item_ms,
            current_item_start_ms: 0,
            current_item_finish_ms: 0,
            construction_start_ms: 0,
            construction_finish_ms: 0,
        }
    }

    /// Lays out the remaining items back to back starting at `start_ms`.
    pub fn begin(&mut self, start_ms: i64) {
        let remaining = i64::try_from(self.remaining).unwrap_or(i64::MAX);
        self.current_item_start_ms = start_ms;
        self.current_item_finish_ms = start_ms + self.item_ms;
        self.construction_start_ms = start_ms;
        self.construction_finish_ms = start_ms.saturating_add(self.item_ms.saturating_mul(remaining));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipyardQueue {
    pub planet_id: String,
    pub season: String,
    pub capacity: usize,
    #[serde(default)]
    pub commands: VecDeque<ShipCommand>,
    #[serde(skip)]
    pub rev: i64,
}

impl ShipyardQueue {
    pub fn new(planet_id: &str, season: &str, capacity: usize) -> Self {
        Self {
            planet_id: planet_id.to_string(),
            season: season.to_string(),
            capacity,
            commands: VecDeque::new(),
            rev: 0,
        }
    }

    pub fn is_full(&self) -> bool {
        self.commands.len() >= self.capacity
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FleetStatus {
    Traveling,
    Returning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetEndpoint {
    pub planet_id: String,
    pub position: Position,
    /// Owner at departure time.
    pub owner_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetMovement {
    pub id: String,
    pub season: String,
    pub owner_id: String,
    pub ships: BTreeMap<String, u64>,
    pub origin: FleetEndpoint,
    pub destination: FleetEndpoint,
    pub mission: MissionKind,
    pub status: FleetStatus,
    pub departure_ms: i64,
    pub arrival_ms: i64,
    #[serde(default)]
    pub cargo: ResourceAmounts,
    #[serde(skip)]
    pub rev: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_ships_is_all_or_nothing() {
        let mut planet = Planet::unowned("p1", "s1", Position::new(0, 0, 0), "temperate", 0);
        planet.ships.insert("light_fighter".into(), 3);
        planet.ships.insert("cargo_ship".into(), 1);

        let too_many = BTreeMap::from([
            ("light_fighter".to_string(), 2),
            ("cargo_ship".to_string(), 2),
        ]);
        assert!(matches!(
            planet.remove_ships(&too_many),
            Err(ActionError::InvalidFleet(_))
        ));
        assert_eq!(planet.ships.get("light_fighter"), Some(&3));

        let ok = BTreeMap::from([("cargo_ship".to_string(), 1)]);
        planet.remove_ships(&ok).unwrap();
        assert!(!planet.ships.contains_key("cargo_ship"));
    }

    #[test]
    fn ship_command_begin_lays_out_batch() {
        let mut cmd = ShipCommand::new("spy_probe", 3, 10_000);
        cmd.begin(5_000);
        assert_eq!(cmd.current_item_finish_ms, 15_000);
        assert_eq!(cmd.construction_finish_ms, 35_000);
    }

    #[test]
    fn affordability_reports_first_missing_resource() {
        let res = PlanetResources::seeded(&ResourceAmounts::metal(100.0), 0);
        let err = res
            .check_affordable(&ResourceAmounts {
                metal: 50.0,
                deuterium: 10.0,
                microchips: 0.0,
            })
            .unwrap_err();
        assert_eq!(err.code(), "insufficient_resources");
    }
}
