//! Cost and duration formulas. Pure functions of the ruleset and a level.

use std::collections::BTreeMap;

use crate::error::ActionError;
use crate::model::{Position, ResourceAmounts};
use crate::rules::{CostCurve, Ruleset, StructureDef, TechnologyDef};

/// Rounds down to the nearest multiple of ten.
pub fn floor10(v: f64) -> f64 {
    (v / 10.0).floor() * 10.0
}

pub fn secs_to_ms(secs: f64) -> i64 {
    (secs * 1000.0).round() as i64
}

/// Metal cost of reaching `level`.
pub fn level_cost(curve: &CostCurve, level: u32) -> f64 {
    let level = f64::from(level);
    match curve.power {
        Some(power) => floor10((curve.base * level).powf(power)),
        None => floor10(curve.base + curve.per_level.unwrap_or(0.0) * level),
    }
}

/// Metal cost of `levels` consecutive upgrades starting from `current_level`.
pub fn upgrade_cost(curve: &CostCurve, current_level: u32, levels: u32) -> f64 {
    (1..=levels)
        .map(|k| level_cost(curve, current_level + k))
        .sum()
}

pub fn upgrade_seconds(def: &StructureDef, levels: u32, rules: &Ruleset) -> f64 {
    def.seconds_per_level * f64::from(levels) / rules.speed.construction
}

/// Cost of researching from `level` to `level + 1`: base doubled per level.
pub fn research_cost(def: &TechnologyDef, level: u32) -> ResourceAmounts {
    def.cost.scaled(2f64.powi(level as i32))
}

pub fn research_seconds(def: &TechnologyDef, level: u32, rules: &Ruleset) -> f64 {
    def.base_seconds * (1.0 + def.time_increase_percent_per_level * f64::from(level) / 100.0)
        / rules.speed.research
}

pub fn ship_item_ms(seconds: f64, rules: &Ruleset) -> i64 {
    secs_to_ms(seconds / rules.speed.ships)
}

pub fn distance(a: &Position, b: &Position) -> f64 {
    let axis = |p: i64, q: i64| (i128::from(p) - i128::from(q)) as f64;
    let (dx, dy, dg) = (axis(a.x, b.x), axis(a.y, b.y), axis(a.galaxy, b.galaxy));
    (dx * dx + dy * dy + dg * dg).sqrt()
}

/// Whole seconds needed to cover `distance` at the slowest ship's speed.
/// `None` when the trip cannot be expressed in milliseconds.
pub fn travel_seconds(distance: f64, slowest_speed: f64, multiplier: f64) -> Option<i64> {
    let secs = (distance / (slowest_speed * multiplier)).ceil();
    if !secs.is_finite() || secs < 0.0 || secs > (i64::MAX / 1000) as f64 {
        return None;
    }
    Some(secs as i64)
}

/// Arrival time of a trip of `travel_secs` leaving at `departure_ms`.
pub fn arrival_ms(departure_ms: i64, travel_secs: i64) -> Result<i64, ActionError> {
    travel_secs
        .checked_mul(1000)
        .and_then(|ms| departure_ms.checked_add(ms))
        .ok_or_else(|| ActionError::InvalidTarget("destination is out of reach".into()))
}

/// Travel time for a fleet, limited by its slowest ship.
pub fn fleet_travel_seconds(
    rules: &Ruleset,
    ships: &BTreeMap<String, u64>,
    from: &Position,
    to: &Position,
) -> Result<i64, ActionError> {
    let mut slowest: Option<f64> = None;
    for (id, count) in ships {
        if *count == 0 {
            continue;
        }
        let def = rules.ship(id).ok_or_else(|| ActionError::UnknownDefinition {
            what: "ship",
            id: id.clone(),
        })?;
        slowest = Some(slowest.map_or(def.speed, |s| s.min(def.speed)));
    }
    let slowest = slowest.ok_or_else(|| ActionError::InvalidFleet("fleet has no ships".into()))?;
    travel_seconds(distance(from, to), slowest, rules.speed.fleet)
        .ok_or_else(|| ActionError::InvalidTarget("destination is out of reach".into()))
}

pub fn cargo_capacity(rules: &Ruleset, ships: &BTreeMap<String, u64>) -> f64 {
    ships
        .iter()
        .filter_map(|(id, count)| rules.ship(id).map(|def| def.cargo_capacity * *count as f64))
        .sum()
}
