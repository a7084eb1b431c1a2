//! Quality gating for generated output.
//!
//! A small agent network (planner, researcher, synthesizer, validator)
//! exchanges typed messages until the validator accepts a hypothesis or the
//! iteration budget runs out. The validator blends a pluggable scorer with an
//! optional learned weight model and flags borderline samples for review.

pub mod critique;
pub mod research;
pub mod validator;
