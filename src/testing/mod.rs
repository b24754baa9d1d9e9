//! Testing utilities and mock implementations
//!
//! Scriptable stand-ins for the link driver, the MQTT transport, and sensors,
//! so supervision logic can be tested without hardware or a broker.

pub mod mocks;

pub use mocks::*;
