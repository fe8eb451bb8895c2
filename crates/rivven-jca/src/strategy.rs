//! Pool partitioning strategies
//!
//! A strategy maps a request's `(subject, cri, separate_no_tx)` to a
//! [`PoolKey`]; the pool keeps one sub-pool per distinct key.
//!
//! | Strategy              | Key components            | Prefill | Re-auth |
//! |-----------------------|---------------------------|---------|---------|
//! | `OnePool`             | no-tx flag                | yes     | no      |
//! | `PoolByCri`           | cri, no-tx flag           | no      | no      |
//! | `PoolBySubject`       | subject, no-tx flag       | yes     | no      |
//! | `PoolBySubjectAndCri` | subject, cri, no-tx flag  | no      | no      |
//! | `ReauthPool`          | no-tx flag                | yes     | yes     |

use std::fmt;
use std::sync::Arc;

use crate::connection::{ConnectionRequestInfo, Subject};
use crate::error::{Error, Result};

/// Partition key of a sub-pool
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    subject: Option<Subject>,
    cri: Option<ConnectionRequestInfo>,
    separate_no_tx: bool,
}

impl PoolKey {
    /// Key from its components
    pub fn new(
        subject: Option<Subject>,
        cri: Option<ConnectionRequestInfo>,
        separate_no_tx: bool,
    ) -> Self {
        Self {
            subject,
            cri,
            separate_no_tx,
        }
    }

    /// Subject component
    pub fn subject(&self) -> Option<&Subject> {
        self.subject.as_ref()
    }

    /// Request info component
    pub fn cri(&self) -> Option<&ConnectionRequestInfo> {
        self.cri.as_ref()
    }

    /// Whether this key belongs to the no-transaction partition
    pub fn is_separate_no_tx(&self) -> bool {
        self.separate_no_tx
    }
}

impl fmt::Debug for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolKey")
            .field("subject", &self.subject)
            .field("cri", &self.cri)
            .field("separate_no_tx", &self.separate_no_tx)
            .finish()
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        match &self.subject {
            Some(subject) => write!(f, "subject={subject}")?,
            None => write!(f, "subject=-")?,
        }
        match &self.cri {
            Some(cri) => write!(f, ", cri={:?}", cri)?,
            None => write!(f, ", cri=-")?,
        }
        write!(f, ", no-tx={}]", self.separate_no_tx)
    }
}

/// Partitioning policy of a pool
pub trait PoolStrategy: Send + Sync + fmt::Debug {
    /// Strategy name
    fn name(&self) -> &'static str;

    /// Must return equal keys for equal inputs.
    fn key(
        &self,
        subject: Option<&Subject>,
        cri: Option<&ConnectionRequestInfo>,
        separate_no_tx: bool,
    ) -> PoolKey;

    /// Upper bound on distinct sub-pools, `None` when unbounded
    fn partition_count(&self, separate_no_tx: bool) -> Option<usize>;

    /// Whether sub-pools are filled ahead of demand
    fn supports_prefill(&self) -> bool;

    /// Whether idle connections may switch subject instead of being replaced
    fn supports_reauthentication(&self) -> bool {
        false
    }
}

fn no_tx_partitions(separate_no_tx: bool) -> usize {
    if separate_no_tx {
        2
    } else {
        1
    }
}

/// Single sub-pool (two with separate no-tx pools)
#[derive(Debug, Clone, Copy, Default)]
pub struct OnePool;

impl PoolStrategy for OnePool {
    fn name(&self) -> &'static str {
        "OnePool"
    }

    fn key(
        &self,
        _subject: Option<&Subject>,
        _cri: Option<&ConnectionRequestInfo>,
        separate_no_tx: bool,
    ) -> PoolKey {
        PoolKey::new(None, None, separate_no_tx)
    }

    fn partition_count(&self, separate_no_tx: bool) -> Option<usize> {
        Some(no_tx_partitions(separate_no_tx))
    }

    fn supports_prefill(&self) -> bool {
        true
    }
}

/// One sub-pool per connection request info
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolByCri;

impl PoolStrategy for PoolByCri {
    fn name(&self) -> &'static str {
        "PoolByCri"
    }

    fn key(
        &self,
        _subject: Option<&Subject>,
        cri: Option<&ConnectionRequestInfo>,
        separate_no_tx: bool,
    ) -> PoolKey {
        PoolKey::new(None, cri.cloned(), separate_no_tx)
    }

    fn partition_count(&self, _separate_no_tx: bool) -> Option<usize> {
        None
    }

    fn supports_prefill(&self) -> bool {
        false
    }
}

/// One sub-pool per subject
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolBySubject;

impl PoolStrategy for PoolBySubject {
    fn name(&self) -> &'static str {
        "PoolBySubject"
    }

    fn key(
        &self,
        subject: Option<&Subject>,
        _cri: Option<&ConnectionRequestInfo>,
        separate_no_tx: bool,
    ) -> PoolKey {
        PoolKey::new(subject.cloned(), None, separate_no_tx)
    }

    fn partition_count(&self, _separate_no_tx: bool) -> Option<usize> {
        None
    }

    fn supports_prefill(&self) -> bool {
        true
    }
}

/// One sub-pool per subject and request info
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolBySubjectAndCri;

impl PoolStrategy for PoolBySubjectAndCri {
    fn name(&self) -> &'static str {
        "PoolBySubjectAndCri"
    }

    fn key(
        &self,
        subject: Option<&Subject>,
        cri: Option<&ConnectionRequestInfo>,
        separate_no_tx: bool,
    ) -> PoolKey {
        PoolKey::new(subject.cloned(), cri.cloned(), separate_no_tx)
    }

    fn partition_count(&self, _separate_no_tx: bool) -> Option<usize> {
        None
    }

    fn supports_prefill(&self) -> bool {
        false
    }
}

/// Single sub-pool whose connections re-authenticate on subject change
#[derive(Debug, Clone, Copy, Default)]
pub struct ReauthPool;

impl PoolStrategy for ReauthPool {
    fn name(&self) -> &'static str {
        "ReauthPool"
    }

    fn key(
        &self,
        _subject: Option<&Subject>,
        _cri: Option<&ConnectionRequestInfo>,
        separate_no_tx: bool,
    ) -> PoolKey {
        PoolKey::new(None, None, separate_no_tx)
    }

    fn partition_count(&self, separate_no_tx: bool) -> Option<usize> {
        Some(no_tx_partitions(separate_no_tx))
    }

    fn supports_prefill(&self) -> bool {
        true
    }

    fn supports_reauthentication(&self) -> bool {
        true
    }
}

/// Look up a strategy by name
pub fn strategy_for(name: &str) -> Result<Arc<dyn PoolStrategy>> {
    match name {
        "OnePool" => Ok(Arc::new(OnePool)),
        "PoolByCri" => Ok(Arc::new(PoolByCri)),
        "PoolBySubject" => Ok(Arc::new(PoolBySubject)),
        "PoolBySubjectAndCri" => Ok(Arc::new(PoolBySubjectAndCri)),
        "ReauthPool" => Ok(Arc::new(ReauthPool)),
        other => Err(Error::config(format!("unknown pool strategy: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Subject {
        Subject::with_password("alice", "a")
    }

    fn cri(db: &str) -> ConnectionRequestInfo {
        ConnectionRequestInfo::new().with_property("database", db)
    }

    #[test]
    fn test_one_pool_ignores_context() {
        let a = OnePool.key(Some(&alice()), Some(&cri("x")), false);
        let b = OnePool.key(None, None, false);
        assert_eq!(a, b);
        assert_ne!(a, OnePool.key(None, None, true));
        assert_eq!(OnePool.partition_count(true), Some(2));
    }

    #[test]
    fn test_pool_by_cri() {
        let a = PoolByCri.key(Some(&alice()), Some(&cri("x")), false);
        let b = PoolByCri.key(None, Some(&cri("x")), false);
        assert_eq!(a, b);
        assert_ne!(a, PoolByCri.key(None, Some(&cri("y")), false));
        assert!(!PoolByCri.supports_prefill());
    }

    #[test]
    fn test_pool_by_subject() {
        let bob = Subject::with_password("bob", "b");
        let a = PoolBySubject.key(Some(&alice()), Some(&cri("x")), false);
        assert_eq!(a, PoolBySubject.key(Some(&alice()), Some(&cri("y")), false));
        assert_ne!(a, PoolBySubject.key(Some(&bob), Some(&cri("x")), false));
        assert_ne!(
            a,
            PoolBySubject.key(Some(&Subject::with_password("alice", "other")), None, false)
        );
    }

    #[test]
    fn test_pool_by_subject_and_cri() {
        let a = PoolBySubjectAndCri.key(Some(&alice()), Some(&cri("x")), false);
        assert_eq!(
            a,
            PoolBySubjectAndCri.key(Some(&alice()), Some(&cri("x")), false)
        );
        assert_ne!(
            a,
            PoolBySubjectAndCri.key(Some(&alice()), Some(&cri("y")), false)
        );
        assert_ne!(a, PoolBySubjectAndCri.key(None, Some(&cri("x")), false));
    }

    #[test]
    fn test_reauth_pool() {
        assert!(ReauthPool.supports_reauthentication());
        assert!(ReauthPool.supports_prefill());
        assert_eq!(
            ReauthPool.key(Some(&alice()), None, false),
            ReauthPool.key(None, None, false)
        );
    }

    #[test]
    fn test_strategy_for() {
        for name in [
            "OnePool",
            "PoolByCri",
            "PoolBySubject",
            "PoolBySubjectAndCri",
            "ReauthPool",
        ] {
            assert_eq!(strategy_for(name).unwrap().name(), name);
        }
        assert!(strategy_for("PoolByMood").is_err());
    }

    #[test]
    fn test_key_display_hides_credentials() {
        let subject = Subject::with_password("alice", "s3cret");
        let key = PoolBySubject.key(Some(&subject), None, false);
        assert!(key.to_string().contains("alice"));
        assert!(!key.to_string().contains("s3cret"));
        assert!(!format!("{key:?}").contains("s3cret"));
    }
}
