//! Rate limit rules configuration and matching.
//!
//! This module holds the policy table (endpoint class to limit) and the route
//! table (path prefix to endpoint class), and knows how to classify a request
//! path against them. Both tables are loaded once at startup.

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use super::key::EndpointClass;
use crate::error::{GatekeeperError, Result};

/// Paths that bypass rate limiting entirely.
const DEFAULT_EXEMPT_PATHS: [&str; 4] = ["/health", "/docs", "/redoc", "/openapi.json"];

/// A rate limit policy: at most `max_requests` per `window_seconds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Number of requests admitted per window
    pub max_requests: u64,
    /// Window length in seconds
    pub window_seconds: u64,
}

impl RateLimitPolicy {
    /// Create a new policy.
    pub const fn new(max_requests: u64, window_seconds: u64) -> Self {
        Self {
            max_requests,
            window_seconds,
        }
    }

    /// The window length as a duration.
    pub fn window(&self) -> Result<TimeDelta> {
        i64::try_from(self.window_seconds)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .ok_or_else(|| {
                GatekeeperError::RateLimit(format!(
                    "window of {}s is out of range",
                    self.window_seconds
                ))
            })
    }
}

/// Maps every path starting with `prefix` to an endpoint class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    /// Path prefix to match
    pub prefix: String,
    /// Class assigned to matching paths
    pub class: EndpointClass,
}

impl RouteRule {
    /// Create a new route rule.
    pub fn new(prefix: impl Into<String>, class: EndpointClass) -> Self {
        Self {
            prefix: prefix.into(),
            class,
        }
    }
}

/// The complete set of rate limit rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitRules {
    policies: HashMap<EndpointClass, RateLimitPolicy>,
    routes: Vec<RouteRule>,
    exempt_paths: Vec<String>,
}

/// On-disk shape of a rules file. Every section is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RulesFile {
    #[serde(default)]
    policies: Option<HashMap<EndpointClass, RateLimitPolicy>>,
    #[serde(default)]
    routes: Option<Vec<RouteRule>>,
    #[serde(default)]
    exempt_paths: Option<Vec<String>>,
}

fn default_policies() -> HashMap<EndpointClass, RateLimitPolicy> {
    HashMap::from([
        (EndpointClass::Login, RateLimitPolicy::new(5, 300)),
        (EndpointClass::Register, RateLimitPolicy::new(3, 3600)),
        (EndpointClass::VerifyEmail, RateLimitPolicy::new(10, 3600)),
        (EndpointClass::ResetPassword, RateLimitPolicy::new(3, 3600)),
        (EndpointClass::General, RateLimitPolicy::new(20, 60)),
        (EndpointClass::Chat, RateLimitPolicy::new(60, 60)),
    ])
}

fn default_routes() -> Vec<RouteRule> {
    vec![
        RouteRule::new("/auth/login", EndpointClass::Login),
        RouteRule::new("/auth/register", EndpointClass::Register),
        RouteRule::new("/auth/verify-email", EndpointClass::VerifyEmail),
        RouteRule::new("/auth/reset-password", EndpointClass::ResetPassword),
        RouteRule::new("/chat", EndpointClass::Chat),
        RouteRule::new("/chat/image", EndpointClass::Chat),
    ]
}

fn default_exempt_paths() -> Vec<String> {
    DEFAULT_EXEMPT_PATHS.iter().map(|p| p.to_string()).collect()
}

impl Default for RateLimitRules {
    fn default() -> Self {
        Self {
            policies: default_policies(),
            routes: default_routes(),
            exempt_paths: default_exempt_paths(),
        }
    }
}

impl RateLimitRules {
    /// Create rules from explicit tables.
    pub fn new(
        policies: HashMap<EndpointClass, RateLimitPolicy>,
        routes: Vec<RouteRule>,
        exempt_paths: Vec<String>,
    ) -> Result<Self> {
        let rules = Self {
            policies,
            routes,
            exempt_paths,
        };
        rules.validate()?;
        Ok(rules)
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    ///
    /// Policies are merged over the defaults. Routes and exempt paths, when
    /// present, replace the defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: RulesFile = if yaml.trim().is_empty() {
            RulesFile::default()
        } else {
            serde_yaml::from_str(yaml).map_err(|e| {
                GatekeeperError::Config(format!("Failed to parse rate limit rules: {}", e))
            })?
        };

        let mut rules = Self::default();
        if let Some(policies) = file.policies {
            rules.policies.extend(policies);
        }
        if let Some(routes) = file.routes {
            rules.routes = routes;
        }
        if let Some(exempt_paths) = file.exempt_paths {
            rules.exempt_paths = exempt_paths;
        }

        rules.validate()?;
        Ok(rules)
    }

    /// Check the tables for values the limiter cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !self.policies.contains_key(&EndpointClass::General) {
            return Err(GatekeeperError::Config(
                "a policy for the 'general' class is required".to_string(),
            ));
        }

        for (class, policy) in &self.policies {
            if policy.window_seconds == 0 {
                return Err(GatekeeperError::Config(format!(
                    "policy '{}' must have a window of at least one second",
                    class
                )));
            }
            policy.window().map_err(|e| {
                GatekeeperError::Config(format!("policy '{}': {}", class, e))
            })?;
        }

        for route in self.routes.iter() {
            if !route.prefix.starts_with('/') {
                return Err(GatekeeperError::Config(format!(
                    "route prefix '{}' must start with '/'",
                    route.prefix
                )));
            }
        }

        Ok(())
    }

    /// The policy for `class`, falling back to the `general` policy.
    pub fn policy_for(&self, class: EndpointClass) -> Option<&RateLimitPolicy> {
        self.policies
            .get(&class)
            .or_else(|| self.policies.get(&EndpointClass::General))
    }

    /// Classify a request path by longest matching route prefix.
    pub fn classify(&self, path: &str) -> EndpointClass {
        self.routes
            .iter()
            .filter(|route| path.starts_with(route.prefix.as_str()))
            .max_by_key(|route| route.prefix.len())
            .map(|route| route.class)
            .unwrap_or(EndpointClass::General)
    }

    /// Whether `path` bypasses rate limiting.
    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt_paths.iter().any(|exempt| exempt == path)
    }

    /// All configured policies.
    pub fn policies(&self) -> &HashMap<EndpointClass, RateLimitPolicy> {
        &self.policies
    }

    /// All configured routes.
    pub fn routes(&self) -> &[RouteRule] {
        &self.routes
    }
}
