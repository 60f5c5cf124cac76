//! LTBox Library
//!
//! Command-line front end over [`ltbox_app::Operations`].

pub mod cli;
pub mod commands;
pub mod output;

pub use cli::{Args, Command};
pub use commands::{dispatch, run};
pub use output::Output;
