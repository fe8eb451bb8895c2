//! Managed connection contracts
//!
//! The pool never talks to an EIS directly. It drives these collaborators:
//! - [`ManagedConnectionFactory`]: creates, matches, validates and destroys
//! - [`ManagedConnection`]: one physical connection owned by a sub-pool
//! - [`Subject`] / [`ConnectionRequestInfo`]: the security and request context
//!   that partitions connections into sub-pools

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Security identity a connection is created for.
///
/// Equality and hashing use the principal and the credential, so two subjects
/// with the same principal but different passwords land in different
/// sub-pools. The credential is redacted in `Debug` output.
#[derive(Clone)]
pub struct Subject {
    principal: String,
    credential: Option<SecretString>,
}

impl Subject {
    /// Subject without a credential
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            credential: None,
        }
    }

    /// Subject with a password credential
    pub fn with_password(principal: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            credential: Some(SecretString::new(password.into().into_boxed_str())),
        }
    }

    /// Principal name
    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// Credential, exposed for authentication only
    pub fn credential(&self) -> Option<&str> {
        self.credential.as_ref().map(|c| c.expose_secret())
    }
}

impl PartialEq for Subject {
    fn eq(&self, other: &Self) -> bool {
        self.principal == other.principal && self.credential() == other.credential()
    }
}

impl Eq for Subject {}

impl Hash for Subject {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.principal.hash(state);
        self.credential().hash(state);
    }
}

impl fmt::Debug for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subject")
            .field("principal", &self.principal)
            .field(
                "credential",
                &self.credential.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.principal)
    }
}

/// Request-specific connection properties (value equality)
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct ConnectionRequestInfo {
    properties: BTreeMap<String, String>,
}

impl ConnectionRequestInfo {
    /// Empty request info
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Look up a property
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// All properties
    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }
}

impl fmt::Debug for ConnectionRequestInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (key, value) in &self.properties {
            let lower = key.to_ascii_lowercase();
            if lower.contains("password") || lower.contains("secret") {
                map.entry(key, &"[REDACTED]");
            } else {
                map.entry(key, value);
            }
        }
        map.finish()
    }
}

/// One physical connection managed by the pool
#[async_trait]
pub trait ManagedConnection: Send + Sync {
    /// Reset application-visible state before the connection is reused
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    /// Close the physical connection
    async fn destroy(&self) -> Result<()>;

    /// Switch the connection to another security identity
    async fn reauthenticate(
        &self,
        _subject: Option<&Subject>,
        _cri: Option<&ConnectionRequestInfo>,
    ) -> Result<()> {
        Err(Error::unsupported("re-authentication"))
    }

    /// Access to the concrete connection type
    fn as_any(&self) -> &dyn Any;
}

/// Creates and maintains managed connections for the pool
#[async_trait]
pub trait ManagedConnectionFactory: Send + Sync {
    /// Create a physical connection
    async fn create_managed_connection(
        &self,
        subject: Option<&Subject>,
        cri: Option<&ConnectionRequestInfo>,
    ) -> Result<Arc<dyn ManagedConnection>>;

    /// Pick a candidate usable for this request.
    ///
    /// `Ok(None)` means no candidate matches; `Err` means the lookup itself
    /// failed. The default accepts the first candidate.
    async fn match_managed_connection(
        &self,
        candidates: &[Arc<dyn ManagedConnection>],
        _subject: Option<&Subject>,
        _cri: Option<&ConnectionRequestInfo>,
    ) -> Result<Option<Arc<dyn ManagedConnection>>> {
        Ok(candidates.first().cloned())
    }

    /// Destroy a physical connection
    async fn destroy_managed_connection(&self, connection: &Arc<dyn ManagedConnection>) -> Result<()> {
        connection.destroy().await
    }

    /// Health check
    async fn is_valid(&self, _connection: &Arc<dyn ManagedConnection>) -> bool {
        true
    }
}

/// Whether two trait objects point at the same connection
pub(crate) fn same_connection(a: &Arc<dyn ManagedConnection>, b: &Arc<dyn ManagedConnection>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
