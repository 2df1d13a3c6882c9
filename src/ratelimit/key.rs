//! Endpoint classes and rate limit key handling.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::GatekeeperError;

/// A named category of routes sharing one rate limit policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointClass {
    Login,
    Register,
    VerifyEmail,
    ResetPassword,
    Chat,
    /// Fallback for paths that match no route prefix.
    General,
}

impl EndpointClass {
    /// Every endpoint class, in declaration order.
    pub const ALL: [EndpointClass; 6] = [
        EndpointClass::Login,
        EndpointClass::Register,
        EndpointClass::VerifyEmail,
        EndpointClass::ResetPassword,
        EndpointClass::Chat,
        EndpointClass::General,
    ];

    /// The configuration name of this class.
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointClass::Login => "login",
            EndpointClass::Register => "register",
            EndpointClass::VerifyEmail => "verify_email",
            EndpointClass::ResetPassword => "reset_password",
            EndpointClass::Chat => "chat",
            EndpointClass::General => "general",
        }
    }
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EndpointClass {
    type Err = GatekeeperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EndpointClass::ALL
            .into_iter()
            .find(|class| class.as_str() == s)
            .ok_or_else(|| GatekeeperError::Config(format!("unknown endpoint class: {}", s)))
    }
}

/// A key that uniquely identifies one rate limit counter.
///
/// Counters are tracked per endpoint class and client identifier, so the
/// same client has independent budgets for e.g. `login` and `chat`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// The endpoint class the request was classified as
    pub class: EndpointClass,
    /// The client identifier (usually an IP address)
    pub client: String,
}

impl RateLimitKey {
    /// Create a new key for a client and endpoint class.
    pub fn new(class: EndpointClass, client: impl Into<String>) -> Self {
        Self {
            class,
            client: client.into(),
        }
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class, self.client)
    }
}
