use thiserror::Error;

use crate::model::Resource;

/// Precondition violations raised by action handlers. Any of these aborts the
/// surrounding transaction; nothing the handler wrote is kept.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ActionError {
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },
    #[error("planet {planet_id} is not owned by {user_id}")]
    NotOwner { planet_id: String, user_id: String },
    #[error("unknown {what}: {id}")]
    UnknownDefinition { what: &'static str, id: String },
    #[error("insufficient {resource}: need {needed:.0}, have {available:.0}")]
    Insufficient {
        resource: Resource,
        needed: f64,
        available: f64,
    },
    #[error("research capacity reached ({active} of {capacity} slots in use)")]
    ResearchCapacity { active: usize, capacity: u32 },
    #[error("shipyard queue is full ({capacity} commands)")]
    QueueFull { capacity: usize },
    #[error("prerequisites not met: {0}")]
    PrerequisitesUnmet(String),
    #[error("{what} is already at max level {max_level}")]
    MaxLevel { what: String, max_level: u32 },
    #[error("{0} is already in progress")]
    AlreadyInProgress(String),
    #[error("invalid fleet: {0}")]
    InvalidFleet(String),
    #[error("invalid mission target: {0}")]
    InvalidTarget(String),
    #[error("colony limit reached: {owned} planets owned, colonization allows {allowed}")]
    ColonyLimit { owned: u32, allowed: u32 },
    #[error("user {0} already has a homeworld")]
    HomeworldAssigned(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ActionError {
    /// Stable machine-readable code surfaced next to the message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::NotOwner { .. } => "not_owner",
            Self::UnknownDefinition { .. } => "unknown_definition",
            Self::Insufficient { .. } => "insufficient_resources",
            Self::ResearchCapacity { .. } => "research_capacity_reached",
            Self::QueueFull { .. } => "queue_full",
            Self::PrerequisitesUnmet(_) => "prerequisites_unmet",
            Self::MaxLevel { .. } => "max_level",
            Self::AlreadyInProgress(_) => "already_in_progress",
            Self::InvalidFleet(_) => "invalid_fleet",
            Self::InvalidTarget(_) => "invalid_target",
            Self::ColonyLimit { .. } => "colony_limit",
            Self::HomeworldAssigned(_) => "homeworld_assigned",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }
}
