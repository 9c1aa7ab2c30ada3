pub mod analysis;
pub mod assistant;
pub mod camelot;
pub mod compatibility;
pub mod config;
pub mod curve;
pub mod db;
pub mod importer;
pub mod ordering;
pub mod planner;
pub mod project;
pub mod segments;

/// Application name for XDG paths
pub const APP_NAME: &str = "segue";
