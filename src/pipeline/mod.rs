pub mod mod_matrix;
pub mod params;
pub mod project;
pub mod registry;
pub mod sequencer;
pub mod steps;
