//! Cube definitions and the directory they are read from.

mod definition;
mod repository;
pub mod sql;

pub use definition::{
    CubeDefinition, DimensionDefinition, JoinDefinition, MeasureDefinition, Relationship,
};
pub use repository::{CubeRepository, DEFINITION_EXTENSION, is_valid_cube_name};
