//! SASL negotiation.
//!
//! `Mechanism` is the server-side challenge/response state machine driven
//! by the AUTH verb handler in `conn.rs`; `PlainMechanism` is the
//! mandatorily-registered PLAIN implementation, decoding the
//! `\0authzid\0authcid\0password` payload RFC 4616 defines.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::backend::Session;
use crate::error::{EnhancedCode, SmtpError};

pub enum SaslStep {
    Challenge(Vec<u8>),
    Done,
}

/// A single SASL mechanism negotiation, scoped to one AUTH attempt. The
/// session is threaded through each call rather than captured, so the
/// mechanism never needs to outlive the connection's borrow of it.
#[async_trait]
pub trait Mechanism: Send {
    /// Advances the exchange with the client's decoded response (`None`
    /// only on the very first call, when there was no initial response).
    async fn next(
        &mut self,
        response: Option<&[u8]>,
        session: &mut dyn Session,
    ) -> Result<SaslStep, SmtpError>;
}

pub type MechanismFactory = Arc<dyn Fn() -> Box<dyn Mechanism> + Send + Sync>;

/// `PLAIN` (RFC 4616): a single round trip decoding
/// `authzid NUL authcid NUL password`, delegating the credential check to
/// `Session::auth_plain`.
#[derive(Default)]
pub struct PlainMechanism;

#[async_trait]
impl Mechanism for PlainMechanism {
    async fn next(
        &mut self,
        response: Option<&[u8]>,
        session: &mut dyn Session,
    ) -> Result<SaslStep, SmtpError> {
        let response = match response {
            Some(r) => r,
            None => return Ok(SaslStep::Challenge(Vec::new())),
        };

        let parts: Vec<&[u8]> = response.splitn(3, |&b| b == 0).collect();
        if parts.len() != 3 {
            return Err(SmtpError::new(501, EnhancedCode(5, 5, 2), "Invalid PLAIN response"));
        }
        let identity = String::from_utf8_lossy(parts[0]).into_owned();
        let username = String::from_utf8_lossy(parts[1]).into_owned();
        let password = String::from_utf8_lossy(parts[2]).into_owned();

        if !identity.is_empty() && identity != username {
            return Err(SmtpError::new(535, EnhancedCode(5, 7, 8), "Identities not supported"));
        }

        session.auth_plain(&username, &password).await?;
        Ok(SaslStep::Done)
    }
}

/// The pluggable mechanism-name -> factory table. PLAIN is registered
/// separately by `Server::new` since it needs no captured state; this
/// seeds the table for consumer-registered mechanisms.
pub fn default_mechanisms() -> BTreeMap<String, MechanismFactory> {
    BTreeMap::new()
}
