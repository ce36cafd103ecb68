//! Game ruleset: structure, ship and technology definitions plus the global
//! multipliers. Loaded from YAML, validated once, then handed out as an
//! immutable [`Arc<Ruleset>`] snapshot per top-level operation.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::info;

use crate::model::{Resource, ResourceAmounts, Structure};

const BUILTIN_RULESET: &str = include_str!("../rules/default.yaml");

#[derive(Debug, Error)]
pub enum RulesetError {
    #[error("failed to parse ruleset: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("failed to read ruleset from {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid ruleset: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedMultipliers {
    pub resources: f64,
    pub construction: f64,
    pub research: f64,
    pub ships: f64,
    pub fleet: f64,
}

impl Default for SpeedMultipliers {
    fn default() -> Self {
        Self {
            resources: 1.0,
            construction: 1.0,
            research: 1.0,
            ships: 1.0,
            fleet: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResearchRules {
    pub base_capacity: u32,
    /// Structure whose first completed level grants one research slot.
    pub laboratory: String,
    /// Technology whose level bounds how many planets a user may hold.
    pub colonization_technology: String,
}

impl Default for ResearchRules {
    fn default() -> Self {
        Self {
            base_capacity: 0,
            laboratory: "research_lab".to_string(),
            colonization_technology: "colonization".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShipyardRules {
    pub capacity: usize,
}

impl Default for ShipyardRules {
    fn default() -> Self {
        Self { capacity: 5 }
    }
}

/// Metal cost of one structure level: `base + per_level * level`, or
/// `(base * level) ^ power` when `power` is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostCurve {
    pub base: f64,
    #[serde(default)]
    pub per_level: Option<f64>,
    #[serde(default)]
    pub power: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Linear {
    #[serde(default)]
    pub base: f64,
    #[serde(default)]
    pub per_level: f64,
}

impl Linear {
    pub fn at(&self, level: u32) -> f64 {
        self.base + self.per_level * f64::from(level)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LevelTable {
    pub resource: Resource,
    #[serde(default)]
    pub base: f64,
    #[serde(default)]
    pub per_level: f64,
}

impl LevelTable {
    pub fn at(&self, level: u32) -> f64 {
        self.base + self.per_level * f64::from(level)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Prerequisites {
    pub structures: BTreeMap<String, u32>,
    pub technologies: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureDef {
    pub id: String,
    pub max_level: u32,
    pub cost: CostCurve,
    pub seconds_per_level: f64,
    #[serde(default)]
    pub production: Option<LevelTable>,
    #[serde(default)]
    pub storage: Option<LevelTable>,
    #[serde(default)]
    pub energy_consumption: Option<Linear>,
    #[serde(default)]
    pub prerequisites: Prerequisites,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShipRole {
    Colonizer,
    SpyProbe,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShipDef {
    pub id: String,
    pub cost: ResourceAmounts,
    pub seconds: f64,
    pub speed: f64,
    #[serde(default)]
    pub cargo_capacity: f64,
    #[serde(default)]
    pub role: Option<ShipRole>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TechBonus {
    pub resource: Resource,
    pub percent_per_level: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechnologyDef {
    pub id: String,
    pub max_level: u32,
    pub cost: ResourceAmounts,
    pub base_seconds: f64,
    #[serde(default)]
    pub time_increase_percent_per_level: f64,
    #[serde(default)]
    pub prerequisites: Prerequisites,
    #[serde(default)]
    pub bonus: Option<TechBonus>,
}

/// Percent adjustments applied to production on a biome.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BiomeModifiers {
    pub metal: f64,
    pub deuterium: f64,
    pub microchips: f64,
    pub energy: f64,
}

impl BiomeModifiers {
    pub fn multiplier(&self, resource: Resource) -> f64 {
        let pct = match resource {
            Resource::Metal => self.metal,
            Resource::Deuterium => self.deuterium,
            Resource::Microchips => self.microchips,
            Resource::Energy => self.energy,
        };
        (1.0 + pct / 100.0).max(0.0)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ColonyTemplate {
    pub resources: ResourceAmounts,
    pub structures: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ruleset {
    pub season: String,
    #[serde(default)]
    pub speed: SpeedMultipliers,
    #[serde(default)]
    pub storage_floor: ResourceAmounts,
    #[serde(default)]
    pub research: ResearchRules,
    #[serde(default)]
    pub shipyard: ShipyardRules,
    #[serde(default)]
    pub structures: Vec<StructureDef>,
    #[serde(default)]
    pub ships: Vec<ShipDef>,
    #[serde(default)]
    pub technologies: Vec<TechnologyDef>,
    #[serde(default)]
    pub biomes: BTreeMap<String, BiomeModifiers>,
    #[serde(default)]
    pub homeworld: ColonyTemplate,
    #[serde(default)]
    pub colony: ColonyTemplate,
}

impl Ruleset {
    pub fn builtin() -> Self {
        Self::from_yaml_str(BUILTIN_RULESET).expect("builtin ruleset should parse")
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, RulesetError> {
        let rules: Ruleset = serde_yaml::from_str(yaml)?;
        rules.validate()?;
        Ok(rules)
    }

    pub fn from_file(path: &Path) -> Result<Self, RulesetError> {
        let contents = fs::read_to_string(path).map_err(|source| RulesetError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn structure(&self, id: &str) -> Option<&StructureDef> {
        self.structures.iter().find(|s| s.id == id)
    }

    pub fn ship(&self, id: &str) -> Option<&ShipDef> {
        self.ships.iter().find(|s| s.id == id)
    }

    pub fn technology(&self, id: &str) -> Option<&TechnologyDef> {
        self.technologies.iter().find(|t| t.id == id)
    }

    pub fn biome(&self, name: &str) -> BiomeModifiers {
        self.biomes.get(name).copied().unwrap_or_default()
    }

    /// Every defined structure, at the template's level or 0.
    pub fn seed_structures(&self, template: &ColonyTemplate) -> Vec<Structure> {
        self.structures
            .iter()
            .map(|def| Structure::new(&def.id, template.structures.get(&def.id).copied().unwrap_or(0)))
            .collect()
    }

    fn validate(&self) -> Result<(), RulesetError> {
        let invalid = |msg: String| Err(RulesetError::Invalid(msg));
        if self.season.trim().is_empty() {
            return invalid("season must not be empty".to_string());
        }
        let speed = &self.speed;
        for (name, value) in [
            ("resources", speed.resources),
            ("construction", speed.construction),
            ("research", speed.research),
            ("ships", speed.ships),
            ("fleet", speed.fleet),
        ] {
            if !is_positive(value) {
                return invalid(format!("speed.{name} must be positive, got {value}"));
            }
        }

        let mut seen = HashSet::new();
        for def in &self.structures {
            if !seen.insert(def.id.as_str()) {
                return invalid(format!("duplicate structure id {}", def.id));
            }
            if def.cost.per_level.is_some() && def.cost.power.is_some() {
                return invalid(format!("structure {} sets both per_level and power", def.id));
            }
            if !is_duration(def.seconds_per_level) {
                return invalid(format!("structure {} has invalid seconds_per_level", def.id));
            }
        }
        let mut seen = HashSet::new();
        for def in &self.ships {
            if !seen.insert(def.id.as_str()) {
                return invalid(format!("duplicate ship id {}", def.id));
            }
            if !is_positive(def.speed) {
                return invalid(format!("ship {} must have a positive speed", def.id));
            }
            if !is_duration(def.seconds) {
                return invalid(format!("ship {} has invalid build seconds", def.id));
            }
        }
        let mut seen = HashSet::new();
        for def in &self.technologies {
            if !seen.insert(def.id.as_str()) {
                return invalid(format!("duplicate technology id {}", def.id));
            }
            if !is_duration(def.base_seconds) || !is_duration(def.time_increase_percent_per_level) {
                return invalid(format!("technology {} has invalid research time", def.id));
            }
        }

        let prereqs = self
            .structures
            .iter()
            .map(|d| (&d.id, &d.prerequisites))
            .chain(self.technologies.iter().map(|d| (&d.id, &d.prerequisites)));
        for (owner, p) in prereqs {
            for id in p.structures.keys() {
                if self.structure(id).is_none() {
                    return invalid(format!("{owner} requires unknown structure {id}"));
                }
            }
            for id in p.technologies.keys() {
                if self.technology(id).is_none() {
                    return invalid(format!("{owner} requires unknown technology {id}"));
                }
            }
        }

        if self.structure(&self.research.laboratory).is_none() {
            return invalid(format!(
                "research laboratory {} is not a structure",
                self.research.laboratory
            ));
        }
        if self
            .technology(&self.research.colonization_technology)
            .is_none()
        {
            return invalid(format!(
                "colonization technology {} is not defined",
                self.research.colonization_technology
            ));
        }
        for template in [&self.homeworld, &self.colony] {
            for id in template.structures.keys() {
                if self.structure(id).is_none() {
                    return invalid(format!("seed template references unknown structure {id}"));
                }
            }
        }
        Ok(())
    }
}

fn is_positive(v: f64) -> bool {
    v.is_finite() && v > 0.0
}

fn is_duration(v: f64) -> bool {
    v.is_finite() && v >= 0.0
}

/// Hands out the current ruleset snapshot. Admin edits call [`reload`] to
/// invalidate the cached copy.
///
/// [`reload`]: ConfigProvider::reload
#[derive(Debug)]
pub struct ConfigProvider {
    source: Option<PathBuf>,
    current: RwLock<Arc<Ruleset>>,
}

impl ConfigProvider {
    pub fn builtin() -> Self {
        Self::fixed(Ruleset::builtin())
    }

    pub fn fixed(rules: Ruleset) -> Self {
        Self {
            source: None,
            current: RwLock::new(Arc::new(rules)),
        }
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, RulesetError> {
        let path = path.into();
        let rules = Ruleset::from_file(&path)?;
        Ok(Self {
            source: Some(path),
            current: RwLock::new(Arc::new(rules)),
        })
    }

    pub fn snapshot(&self) -> Arc<Ruleset> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Re-reads the source file. On error the previous snapshot stays in
    /// place; a provider without a file keeps what it has.
    pub fn reload(&self) -> Result<Arc<Ruleset>, RulesetError> {
        let Some(path) = &self.source else {
            return Ok(self.snapshot());
        };
        let rules = Arc::new(Ruleset::from_file(path)?);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = rules.clone();
        info!(season = %rules.season, "ruleset reloaded");
        Ok(rules)
    }
}
