//! Outstanding email verification challenges.
//!
//! Every challenge is single-use: the first `complete` call removes it
//! whatever the outcome. Challenges older than [`CHALLENGE_TTL`] are treated
//! as absent and are purged by [`spawn_expiry_sweeper`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use subtle::ConstantTimeEq;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::token::{self, GenerationError};

pub const CHALLENGE_TTL: Duration = Duration::from_secs(60);

/// Source of the current time, injectable so expiry can be tested.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub request_id: String,
    pub email: String,
    pub code: String,
    pub created_at: DateTime<Utc>,
}

pub struct PendingRequests {
    entries: Mutex<HashMap<String, AuthChallenge>>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl PendingRequests {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            ttl: chrono::Duration::from_std(CHALLENGE_TTL).unwrap_or(chrono::Duration::seconds(60)),
        }
    }

    /// Mints a request id and code for `email` without making the challenge
    /// completable. Call [`commit`](Self::commit) once it has been delivered.
    pub fn prepare(&self, email: &str) -> Result<AuthChallenge, GenerationError> {
        Ok(AuthChallenge {
            request_id: token::random_key()?,
            email: email.to_string(),
            code: token::random_code()?,
            created_at: self.clock.now(),
        })
    }

    /// Stores a prepared challenge and returns its request id. The
    /// time-to-live runs from here, not from `prepare`.
    pub fn commit(&self, mut challenge: AuthChallenge) -> String {
        challenge.created_at = self.clock.now();
        let request_id = challenge.request_id.clone();
        self.lock().insert(request_id.clone(), challenge);
        request_id
    }

    /// Prepares and stores a challenge in one step.
    pub fn start(&self, email: &str) -> Result<AuthChallenge, GenerationError> {
        let challenge = self.prepare(email)?;
        self.commit(challenge.clone());
        Ok(challenge)
    }

    /// Removes the challenge for `request_id` and returns its email if it was
    /// live and `code` matches. The entry is gone after this call either way.
    pub fn complete(&self, request_id: &str, code: &str) -> Option<String> {
        let entry = self.lock().remove(request_id);
        let challenge = entry?;

        if self.is_expired(&challenge, self.clock.now()) {
            debug!("Completion attempted on expired challenge");
            return None;
        }

        let matches: bool = challenge.code.as_bytes().ct_eq(code.as_bytes()).into();
        matches.then_some(challenge.email)
    }

    /// Drops every expired challenge, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, c| !self.is_expired(c, now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, challenge: &AuthChallenge, now: DateTime<Utc>) -> bool {
        now - challenge.created_at >= self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, AuthChallenge>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Periodically purges expired challenges until the task is aborted.
pub fn spawn_expiry_sweeper(store: Arc<PendingRequests>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let removed = store.purge_expired();
            if removed > 0 {
                debug!(removed, "Purged expired auth challenges");
            }
        }
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;

    /// Clock that only moves when told to.
    pub struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        pub fn new() -> Self {
            Self(Mutex::new(Utc::now()))
        }

        pub fn advance(&self, by: Duration) {
            let mut now = self.0.lock().unwrap();
            *now += chrono::Duration::from_std(by).unwrap();
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    fn store_with_clock() -> (PendingRequests, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (PendingRequests::new(clock.clone()), clock)
    }

    mod start_tests {
        use super::*;

        #[test]
        fn test_start_stores_challenge() {
            let store = PendingRequests::default();
            let challenge = store.start("a@example.com").unwrap();

            assert_eq!(challenge.request_id.len(), 32);
            assert_eq!(challenge.code.len(), 6);
            assert_eq!(challenge.email, "a@example.com");
            assert_eq!(store.len(), 1);
        }

        #[test]
        fn test_repeated_starts_are_distinct() {
            let store = PendingRequests::default();
            let challenges: Vec<_> = (0..50)
                .map(|_| store.start("a@example.com").unwrap())
                .collect();

            let ids: HashSet<_> = challenges.iter().map(|c| &c.request_id).collect();
            assert_eq!(ids.len(), 50);
            assert_eq!(store.len(), 50);

            // Codes only have 10^6 values; two in a row colliding is negligible.
            assert_ne!(challenges[0].code, challenges[1].code);
        }

        #[test]
        fn test_prepared_challenge_is_not_completable() {
            let store = PendingRequests::default();
            let challenge = store.prepare("a@example.com").unwrap();

            assert!(store.is_empty());
            assert_eq!(store.complete(&challenge.request_id, &challenge.code), None);
        }

        #[test]
        fn test_ttl_runs_from_commit() {
            let (store, clock) = store_with_clock();
            let challenge = store.prepare("a@example.com").unwrap();

            clock.advance(CHALLENGE_TTL - Duration::from_secs(1));
            let request_id = store.commit(challenge.clone());
            clock.advance(Duration::from_secs(5));

            assert_eq!(
                store.complete(&request_id, &challenge.code),
                Some("a@example.com".to_string())
            );
        }

        #[test]
        fn test_committed_challenge_is_completable() {
            let store = PendingRequests::default();
            let challenge = store.prepare("a@example.com").unwrap();
            let request_id = store.commit(challenge.clone());

            assert_eq!(
                store.complete(&request_id, &challenge.code),
                Some("a@example.com".to_string())
            );
        }
    }

    mod complete_tests {
        use super::*;

        #[test]
        fn test_correct_code_succeeds_once() {
            let store = PendingRequests::default();
            let c = store.start("a@example.com").unwrap();

            assert_eq!(
                store.complete(&c.request_id, &c.code),
                Some("a@example.com".to_string())
            );
            assert_eq!(store.complete(&c.request_id, &c.code), None);
        }

        #[test]
        fn test_wrong_code_invalidates_request() {
            let store = PendingRequests::default();
            let c = store.start("a@example.com").unwrap();
            let wrong = if c.code == "000000" { "111111" } else { "000000" };

            assert_eq!(store.complete(&c.request_id, wrong), None);
            assert_eq!(store.complete(&c.request_id, &c.code), None);
            assert!(store.is_empty());
        }

        #[test]
        fn test_unknown_request_fails() {
            let store = PendingRequests::default();
            assert_eq!(store.complete("nope", "123456"), None);
        }

        #[test]
        fn test_code_prefix_does_not_match() {
            let store = PendingRequests::default();
            let c = store.start("a@example.com").unwrap();
            assert_eq!(store.complete(&c.request_id, &c.code[..5]), None);
        }

        #[test]
        fn test_other_requests_unaffected() {
            let store = PendingRequests::default();
            let a = store.start("a@example.com").unwrap();
            let b = store.start("b@example.com").unwrap();

            assert_eq!(store.complete(&a.request_id, "bad"), None);
            assert_eq!(
                store.complete(&b.request_id, &b.code),
                Some("b@example.com".to_string())
            );
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn test_concurrent_completions_single_winner() {
            let store = Arc::new(PendingRequests::default());
            let c = store.start("a@example.com").unwrap();

            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let store = store.clone();
                    let (id, code) = (c.request_id.clone(), c.code.clone());
                    tokio::spawn(async move { store.complete(&id, &code) })
                })
                .collect();

            let mut winners = 0;
            for handle in handles {
                if handle.await.unwrap().is_some() {
                    winners += 1;
                }
            }
            assert_eq!(winners, 1);
        }
    }

    mod expiry_tests {
        use super::*;

        #[test]
        fn test_completes_just_before_ttl() {
            let (store, clock) = store_with_clock();
            let c = store.start("a@example.com").unwrap();

            clock.advance(Duration::from_secs(59));
            assert!(store.complete(&c.request_id, &c.code).is_some());
        }

        #[test]
        fn test_expired_challenge_cannot_complete() {
            let (store, clock) = store_with_clock();
            let c = store.start("a@example.com").unwrap();

            clock.advance(CHALLENGE_TTL);
            assert_eq!(store.complete(&c.request_id, &c.code), None);
            assert!(store.is_empty());
        }

        #[test]
        fn test_purge_removes_only_expired() {
            let (store, clock) = store_with_clock();
            store.start("old@example.com").unwrap();
            clock.advance(Duration::from_secs(30));
            let fresh = store.start("new@example.com").unwrap();
            clock.advance(Duration::from_secs(30));

            assert_eq!(store.purge_expired(), 1);
            assert_eq!(store.len(), 1);
            assert!(store.complete(&fresh.request_id, &fresh.code).is_some());
        }

        #[test]
        fn test_purge_after_completion_is_noop() {
            let (store, clock) = store_with_clock();
            let c = store.start("a@example.com").unwrap();
            store.complete(&c.request_id, &c.code);

            clock.advance(CHALLENGE_TTL * 2);
            assert_eq!(store.purge_expired(), 0);
        }

        #[tokio::test(start_paused = true)]
        async fn test_sweeper_purges_in_background() {
            let clock = Arc::new(ManualClock::new());
            let store = Arc::new(PendingRequests::new(clock.clone()));
            store.start("a@example.com").unwrap();

            let handle = spawn_expiry_sweeper(store.clone(), Duration::from_secs(10));
            clock.advance(CHALLENGE_TTL);
            tokio::time::sleep(Duration::from_secs(11)).await;

            assert!(store.is_empty());
            handle.abort();
        }
    }
}
