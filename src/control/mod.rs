//! Control Surface: a message-framed TCP server answering out-of-band
//! RUN/STATUS/DATA/LOGS/EVENTS/CLEANUP/SHOW requests by reading the Jobs
//! Store and delegating to Handlers.

pub mod protocol;
mod server;

pub use server::ControlServer;
