//! Subcommand implementations

pub mod inspect;
pub mod recover;
pub mod util;
