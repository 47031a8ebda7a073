pub mod cluster;
pub mod control_plane;
pub mod controller;
pub mod error;
pub mod helm;
pub mod helpers;
pub mod metrics;
pub mod model;
pub mod revision_store;
