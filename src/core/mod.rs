//! Orchestration: wires transport, registrar, transaction, and B2BUA
//! services into one running process.

pub mod server;

pub use server::B2buaServer;
