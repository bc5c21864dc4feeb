pub mod broker;
pub mod collab;
pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod models;
pub mod phases;
pub mod pipeline;
pub mod propagate;
pub mod router;
pub mod runtime;
pub mod server;
pub mod status;

#[cfg(test)]
mod test_support;
