//! Sport/category enum for activities.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Activity category (normalized from the remote feed's free-form type).
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    #[sea_orm(string_value = "ride")]
    Ride,
    #[sea_orm(string_value = "run")]
    Run,
    #[sea_orm(string_value = "swim")]
    Swim,
    #[sea_orm(string_value = "walk")]
    Walk,
    #[sea_orm(string_value = "other")]
    #[default]
    Other,
}

impl ActivityKind {
    /// Map a remote type label onto a known category.
    ///
    /// Unknown labels fall back to [`ActivityKind::Other`].
    pub fn from_label(label: &str) -> Self {
        match label.to_ascii_lowercase().as_str() {
            "ride" | "virtualride" | "ebikeride" | "gravelride" | "mountainbikeride" => Self::Ride,
            "run" | "virtualrun" | "trailrun" => Self::Run,
            "swim" => Self::Swim,
            "walk" | "hike" => Self::Walk,
            _ => Self::Other,
        }
    }
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivityKind::Ride => write!(f, "ride"),
            ActivityKind::Run => write!(f, "run"),
            ActivityKind::Swim => write!(f, "swim"),
            ActivityKind::Walk => write!(f, "walk"),
            ActivityKind::Other => write!(f, "other"),
        }
    }
}
