use crate::engine::{EngineError, EngineHandle};
use zbus::interface;

pub const BUS_NAME: &str = "org.veriface.Verifier1";
pub const OBJECT_PATH: &str = "/org/veriface/Verifier1";

/// D-Bus interface for the Veriface verification daemon.
///
/// Bus name: org.veriface.Verifier1
/// Object path: /org/veriface/Verifier1
pub struct VerifierService {
    engine: EngineHandle,
}

impl VerifierService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

fn to_fdo(e: EngineError) -> zbus::fdo::Error {
    match e {
        EngineError::InvalidIdentityKey(_) => zbus::fdo::Error::InvalidArgs(e.to_string()),
        EngineError::SessionBusy(_) => zbus::fdo::Error::LimitsExceeded(e.to_string()),
        _ => zbus::fdo::Error::Failed(e.to_string()),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.veriface.Verifier1")]
impl VerifierService {
    /// Run the liveness challenge and match against `claimed_key`.
    ///
    /// Returns the verdict as JSON. An empty `session_token` gets a generated one.
    async fn verify_login(
        &self,
        claimed_key: &str,
        session_token: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(token = session_token, "verify_login requested");
        let verdict = self
            .engine
            .verify_login(claimed_key, session_token)
            .await
            .map_err(to_fdo)?;
        to_json(&verdict)
    }

    /// Capture a live face and register it under `identity_key`.
    async fn register(&self, identity_key: &str, session_token: &str) -> zbus::fdo::Result<String> {
        tracing::info!(token = session_token, "register requested");
        let report = self
            .engine
            .register(identity_key, session_token)
            .await
            .map_err(to_fdo)?;
        to_json(&report)
    }

    /// Cancel a running session. Returns false if the token is unknown.
    async fn cancel(&self, session_token: &str) -> bool {
        self.engine.cancel(session_token)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        to_json(&self.engine.status())
    }

    /// List registered identity keys.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        to_json(&self.engine.identities())
    }
}
