pub mod backup;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod instance;
pub mod locks;
pub mod materialize;
pub mod orchestrator;
pub mod process;
pub mod registry;
pub mod secret;
pub mod utils;
