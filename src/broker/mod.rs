//! Broker boundary: framed wire protocol and session lifecycle.

pub mod session;
pub mod wire;

pub use session::{BrokerRequest, BrokerSession, SessionState, TcpFactory};
pub use wire::{ClientFrame, ContractSpec, ServerFrame, WireBar};
