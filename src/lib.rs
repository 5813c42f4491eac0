//! Bridges a device under test, a protocol decoder and a test driver into a single test session.
//!
//! The bridge relays the raw byte stream between the device's serial link and the decoder's TCP
//! socket, starts the test driver once the decoder is reachable, and turns the driver's exit into
//! the session result. See [`session::Orchestrator`] for the lifecycle.

pub mod channel;
pub mod collaborators;
pub mod collector;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod process;
pub mod relay;
pub mod session;
