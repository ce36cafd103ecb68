//! Lazy resource accrual. Nothing ticks: every reader brings a planet's stock
//! up to date from the time elapsed since `last_update_ms`.

use serde::Serialize;

use crate::model::{Planet, Resource, UserResearch};
use crate::rules::Ruleset;

/// Per-second rates and caps in effect for a planet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Production {
    pub metal_rate: f64,
    pub deuterium_rate: f64,
    pub microchips_rate: f64,
    pub metal_cap: f64,
    pub deuterium_cap: f64,
    pub microchips_cap: f64,
    pub energy_production: f64,
    pub energy_consumption: f64,
    /// Multiplier applied to storable rates, 1 unless energy runs short.
    pub malus: f64,
}

impl Production {
    pub fn rate(&self, resource: Resource) -> f64 {
        match resource {
            Resource::Metal => self.metal_rate,
            Resource::Deuterium => self.deuterium_rate,
            Resource::Microchips => self.microchips_rate,
            Resource::Energy => self.energy_production - self.energy_consumption,
        }
    }

    pub fn cap(&self, resource: Resource) -> f64 {
        match resource {
            Resource::Metal => self.metal_cap,
            Resource::Deuterium => self.deuterium_cap,
            Resource::Microchips => self.microchips_cap,
            Resource::Energy => 0.0,
        }
    }

    fn set(&mut self, resource: Resource, rate: f64, cap: f64) {
        match resource {
            Resource::Metal => {
                self.metal_rate = rate;
                self.metal_cap = cap;
            }
            Resource::Deuterium => {
                self.deuterium_rate = rate;
                self.deuterium_cap = cap;
            }
            Resource::Microchips => {
                self.microchips_rate = rate;
                self.microchips_cap = cap;
            }
            Resource::Energy => {}
        }
    }
}

/// `1 + Σ percent_per_level * level / 100` over technologies boosting `resource`.
pub fn research_bonus(rules: &Ruleset, research: Option<&UserResearch>, resource: Resource) -> f64 {
    let Some(research) = research else {
        return 1.0;
    };
    let pct: f64 = rules
        .technologies
        .iter()
        .filter_map(|t| t.bonus.filter(|b| b.resource == resource).map(|b| (t, b)))
        .map(|(t, b)| b.percent_per_level * f64::from(research.level(&t.id)))
        .sum();
    1.0 + pct / 100.0
}

pub fn energy_malus(production: f64, consumption: f64) -> f64 {
    if consumption > production {
        (production / consumption).clamp(0.0, 1.0)
    } else {
        1.0
    }
}

/// Rates, caps and energy balance for the planet's current structure levels.
/// Structures still at level 0 neither produce, store nor consume.
pub fn production(rules: &Ruleset, planet: &Planet, research: Option<&UserResearch>) -> Production {
    let biome = rules.biome(&planet.biome);
    let mut out = Production::default();

    let mut raw = [0.0; 3];
    let mut caps = [
        rules.storage_floor.metal,
        rules.storage_floor.deuterium,
        rules.storage_floor.microchips,
    ];
    // Level 0 means not built yet: no base rate, storage or consumption.
    for structure in planet.structures.iter().filter(|s| s.level > 0) {
        let Some(def) = rules.structure(&structure.kind) else {
            continue;
        };
        if let Some(table) = def.production {
            let amount = table.at(structure.level);
            match table.resource {
                Resource::Energy => out.energy_production += amount,
                other => raw[slot(other)] += amount,
            }
        }
        if let Some(table) = def.storage {
            if table.resource != Resource::Energy {
                caps[slot(table.resource)] += table.at(structure.level);
            }
        }
        if let Some(consumption) = def.energy_consumption {
            out.energy_consumption += consumption.at(structure.level);
        }
    }

    out.energy_production *=
        research_bonus(rules, research, Resource::Energy) * biome.multiplier(Resource::Energy);
    out.malus = energy_malus(out.energy_production, out.energy_consumption);

    for resource in Resource::STORABLE {
        let rate = raw[slot(resource)]
            * research_bonus(rules, research, resource)
            * biome.multiplier(resource)
            * rules.speed.resources
            * out.malus;
        out.set(resource, rate.max(0.0), caps[slot(resource)]);
    }
    out
}

fn slot(resource: Resource) -> usize {
    match resource {
        Resource::Metal => 0,
        Resource::Deuterium => 1,
        Resource::Microchips => 2,
        Resource::Energy => unreachable!("energy is never stored"),
    }
}

/// Stock after `elapsed_secs` at `rate`, never pushed past `cap`. Stock that
/// already sits above the cap (e.g. delivered cargo) is left alone.
pub fn accrue_amount(current: f64, rate: f64, elapsed_secs: f64, cap: f64) -> f64 {
    if current >= cap {
        return current;
    }
    (current + rate * elapsed_secs).min(cap)
}

/// Brings the planet's resources up to `now_ms` and stamps `last_update_ms`.
/// The caller persists the planet. Time never runs backwards: an older `now_ms`
/// accrues nothing.
pub fn accrue(
    rules: &Ruleset,
    planet: &mut Planet,
    research: Option<&UserResearch>,
    now_ms: i64,
) -> Production {
    let prod = production(rules, planet, research);
    let elapsed_ms = (now_ms - planet.resources.last_update_ms).max(0);
    let elapsed_secs = elapsed_ms as f64 / 1000.0;

    for resource in Resource::STORABLE {
        let stock = planet.resources.get_mut(resource);
        *stock = accrue_amount(*stock, prod.rate(resource), elapsed_secs, prod.cap(resource));
    }
    planet.resources.energy = prod.energy_production - prod.energy_consumption;
    planet.resources.last_update_ms = planet.resources.last_update_ms.max(now_ms);
    prod
}
