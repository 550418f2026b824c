//! CubeJS query model and validation.

mod types;
mod validator;

pub use types::{CubeQuery, DateRange, Filter, SecurityContext, TimeDimension};
pub use validator::{
    DashboardQueryResult, QueryValidationResult, QueryValidator, SecurityContextResult,
};
