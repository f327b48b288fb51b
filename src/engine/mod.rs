pub mod executor;
pub mod spec;
pub mod types;

pub use executor::run;
pub use spec::{Guard, Hook, SpecBuilder, SpecError, Specification, StateDef, Transition};
