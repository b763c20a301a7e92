//! CLI command implementations

pub mod genpwdhash;
pub mod run;
