pub mod batch;
pub mod cancel;
pub mod config;
pub mod conformity;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod mediawiki;
pub mod moves;
pub mod resolver;
pub mod runner;
pub mod runtime;
pub mod sites;
pub mod summary;
pub mod walker;

#[cfg(test)]
mod mock;
