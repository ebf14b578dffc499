//! 살아 있는 세션 목록.
//!
//! 같은 증권사와 계좌 조합으로는 한 번에 하나의 세션만 연결될 수 있습니다.

use kset_core::{ErrorRecord, KsetResult, SessionKey};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::listener::lock;

/// 세션 식별자 등록부.
///
/// 복제본은 같은 목록을 공유합니다. 여러 세션이 하나의 등록부를 공유해야
/// 중복 연결이 거부됩니다.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    live: Arc<Mutex<HashSet<SessionKey>>>,
}

impl SessionRegistry {
    /// 빈 등록부를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 식별자를 점유합니다.
    ///
    /// # Errors
    ///
    /// 이미 살아 있는 세션이 있으면 `InvalidState`.
    pub fn claim(&self, key: SessionKey) -> KsetResult<SessionClaim> {
        let mut live = lock(&self.live);
        if live.contains(&key) {
            return Err(ErrorRecord::invalid_state(format!(
                "이미 연결된 세션이 있습니다: {}",
                key
            )));
        }
        live.insert(key.clone());
        debug!(session = %key, "세션 식별자 점유");
        Ok(SessionClaim {
            key,
            live: self.live.clone(),
        })
    }

    /// 식별자가 점유되어 있는지 확인합니다.
    pub fn is_live(&self, key: &SessionKey) -> bool {
        lock(&self.live).contains(key)
    }

    /// 살아 있는 세션 수.
    pub fn len(&self) -> usize {
        lock(&self.live).len()
    }

    /// 비어 있는지 확인합니다.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 점유 핸들. 드롭되면 식별자가 풀립니다.
#[derive(Debug)]
pub struct SessionClaim {
    key: SessionKey,
    live: Arc<Mutex<HashSet<SessionKey>>>,
}

impl SessionClaim {
    /// 점유한 식별자.
    pub fn key(&self) -> &SessionKey {
        &self.key
    }
}

impl Drop for SessionClaim {
    fn drop(&mut self) {
        lock(&self.live).remove(&self.key);
        debug!(session = %self.key, "세션 식별자 해제");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kset_core::ErrorKind;

    #[test]
    fn test_duplicate_claim_rejected() {
        let registry = SessionRegistry::new();
        let key = SessionKey::new("kis", "5012345601");

        let claim = registry.claim(key.clone()).unwrap();
        let err = registry.claim(key.clone()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);

        drop(claim);
        assert!(!registry.is_live(&key));
        assert!(registry.claim(key).is_ok());
    }

    #[test]
    fn test_distinct_accounts_coexist() {
        let registry = SessionRegistry::new();
        let _a = registry.claim(SessionKey::new("kis", "A")).unwrap();
        let _b = registry.claim(SessionKey::new("kis", "B")).unwrap();
        let _c = registry.claim(SessionKey::new("ls", "A")).unwrap();
        assert_eq!(registry.len(), 3);
    }
}
