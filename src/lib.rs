#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate log;

pub mod backend;
pub mod config;
pub mod fs;
pub mod plugin;
pub mod queue;
pub mod router;
pub mod server;
pub mod stream;
