//! verifaced — Veriface verification daemon.
//!
//! Runs liveness-gated login and registration sessions against observation
//! sources and serves them over D-Bus.

pub mod config;
pub mod dbus_interface;
pub mod engine;
pub mod session;
pub mod store;

pub use config::Config;
pub use engine::{EngineError, EngineHandle, EngineSettings, RegistrationReason, RegistrationReport};
pub use session::{UserOutcome, Verdict, VerdictReason, VerifyConfig};
pub use store::IdentityStore;
