//! Short-lived auth tokens.
//!
//! A token is issued out of band (by whatever login service fronts the
//! server), presented once in `ClientAuth`, and removed when it matches. A
//! wrong guess leaves the issued token in place. Unused tokens expire
//! through the token wheel.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rand::Rng;
use tether_protocol::PlayerId;
use tether_wheel::{Expiry, TimeoutWheel, TimerKey};
use tracing::debug;

use crate::SessionError;

struct Issued {
    token: String,
    timer: TimerKey,
}

/// Tokens keyed by player, each expiring after the token wheel's timeout.
pub struct TokenStore {
    tokens: Mutex<HashMap<PlayerId, Issued>>,
    wheel: Arc<TimeoutWheel>,
    this: Weak<TokenStore>,
}

impl TokenStore {
    pub fn new(wheel: Arc<TimeoutWheel>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            tokens: Mutex::new(HashMap::new()),
            wheel,
            this: this.clone(),
        })
    }

    /// Issues a fresh token for `uid`, replacing any earlier one.
    pub fn issue(&self, uid: PlayerId) -> String {
        let token = generate_token();
        let timer = self.wheel.insert(Arc::new(TokenExpiry {
            store: self.this.clone(),
            uid,
        }));

        let replaced = self.tokens.lock().insert(
            uid,
            Issued {
                token: token.clone(),
                timer,
            },
        );
        if let Some(old) = replaced {
            self.wheel.remove(old.timer);
        }
        debug!(player_id = %uid, "token issued");
        token
    }

    /// Compares `token` with the one issued for `uid`.
    ///
    /// # Errors
    /// [`SessionError::NoToken`] if nothing is stored for `uid`.
    pub fn check(&self, uid: PlayerId, token: &str) -> Result<bool, SessionError> {
        let tokens = self.tokens.lock();
        let issued = tokens.get(&uid).ok_or(SessionError::NoToken(uid))?;
        Ok(issued.token == token)
    }

    /// Removes the token for `uid` if it equals `token`. A mismatch leaves
    /// the stored token untouched and returns `Ok(false)`.
    ///
    /// # Errors
    /// [`SessionError::NoToken`] if nothing is stored for `uid`.
    pub fn consume(&self, uid: PlayerId, token: &str) -> Result<bool, SessionError> {
        let removed = {
            let mut tokens = self.tokens.lock();
            let issued = tokens.get(&uid).ok_or(SessionError::NoToken(uid))?;
            if issued.token != token {
                return Ok(false);
            }
            tokens.remove(&uid)
        };
        if let Some(issued) = removed {
            self.wheel.remove(issued.timer);
        }
        Ok(true)
    }

    pub fn invalidate(&self, uid: PlayerId) {
        let removed = self.tokens.lock().remove(&uid);
        if let Some(issued) = removed {
            self.wheel.remove(issued.timer);
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expire(&self, uid: PlayerId, key: TimerKey) {
        let mut tokens = self.tokens.lock();
        if tokens.get(&uid).is_some_and(|issued| issued.timer == key) {
            tokens.remove(&uid);
            debug!(player_id = %uid, "token expired");
        }
    }
}

struct TokenExpiry {
    store: Weak<TokenStore>,
    uid: PlayerId,
}

impl Expiry for TokenExpiry {
    fn release(&self, key: TimerKey) {
        if let Some(store) = self.store.upgrade() {
            store.expire(self.uid, key);
        }
    }
}

/// Generates a random 32-character hex string (128 bits of entropy).
fn generate_token() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tether_wheel::WheelConfig;

    use super::*;

    /// 100ms lifetime over 10 buckets: expires on the 11th advance.
    fn store() -> (Arc<TokenStore>, Arc<TimeoutWheel>) {
        let wheel = Arc::new(
            TimeoutWheel::new(WheelConfig::new("token", Duration::from_millis(100), 10)).unwrap(),
        );
        (TokenStore::new(Arc::clone(&wheel)), wheel)
    }

    #[test]
    fn test_issue_returns_32_hex_chars() {
        let (store, _wheel) = store();
        let token = store.issue(PlayerId(1));
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_check_matching_and_mismatching() {
        let (store, _wheel) = store();
        let token = store.issue(PlayerId(1));
        assert!(store.check(PlayerId(1), &token).unwrap());
        assert!(!store.check(PlayerId(1), "nope").unwrap());
    }

    #[test]
    fn test_check_unknown_player_is_no_token() {
        let (store, _wheel) = store();
        let err = store.check(PlayerId(9), "x").unwrap_err();
        assert!(matches!(err, SessionError::NoToken(PlayerId(9))));
    }

    #[test]
    fn test_invalidate_removes_token_and_timer() {
        let (store, wheel) = store();
        let token = store.issue(PlayerId(1));
        store.invalidate(PlayerId(1));
        assert!(store.check(PlayerId(1), &token).is_err());
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_consume_mismatch_keeps_token() {
        let (store, wheel) = store();
        let token = store.issue(PlayerId(1));
        assert!(!store.consume(PlayerId(1), "guess").unwrap());
        assert_eq!(wheel.len(), 1);

        assert!(store.consume(PlayerId(1), &token).unwrap());
        assert!(store.is_empty());
        assert!(wheel.is_empty());
        assert!(matches!(
            store.consume(PlayerId(1), &token),
            Err(SessionError::NoToken(PlayerId(1)))
        ));
    }

    #[test]
    fn test_token_expires_after_lifetime() {
        let (store, wheel) = store();
        store.issue(PlayerId(1));
        for _ in 0..10 {
            wheel.advance();
        }
        assert_eq!(store.len(), 1);
        wheel.advance();
        assert!(store.is_empty());
    }

    #[test]
    fn test_reissue_replaces_token_and_restarts_lifetime() {
        let (store, wheel) = store();
        let first = store.issue(PlayerId(1));
        for _ in 0..5 {
            wheel.advance();
        }
        let second = store.issue(PlayerId(1));
        assert_ne!(first, second);
        assert!(!store.check(PlayerId(1), &first).unwrap());

        // The first issuance's deadline passes; the second survives it.
        for _ in 0..6 {
            wheel.advance();
        }
        assert!(store.check(PlayerId(1), &second).unwrap());
        for _ in 0..5 {
            wheel.advance();
        }
        assert!(store.is_empty());
    }
}
