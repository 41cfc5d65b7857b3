pub mod app;
pub mod auth;
pub mod certs;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod device;
pub mod error;
pub mod inventory;
pub mod keys;
pub mod net;
pub mod probe;
pub mod report;
pub mod sequencer;
pub mod steps;
pub mod swarm;
pub mod transport;
pub mod util;
