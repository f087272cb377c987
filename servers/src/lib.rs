//! HTTP surface of the nervous system.
//!
//! The binary `server_neocortex` wires these modules together; they live in a
//! library so the router can be exercised in tests without a socket.

pub mod neocortex_logic;
