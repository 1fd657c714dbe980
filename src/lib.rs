// Public API - data types, resolvers and the border detector
pub mod border;
pub mod config;
pub mod error;
pub mod export;
pub mod lookup;
pub mod state;

// Binary support - command line and resolver wiring
pub mod cli;
pub mod setup;
