//! Single-flight coordination of session refreshes.
//!
//! When several requests fail authorization at the same time, only one of
//! them may call the refresh endpoint. The [`RefreshCoordinator`] elects that
//! request as [`Leader`] and queues the others as followers. Once the leader
//! settles, every follower receives the same outcome in the order it joined:
//! the new access token, or `None` if the refresh failed.
//!
//! # Example
//!
//! ```rust
//! match coordinator.begin_or_join() {
//!     Ticket::Leader(leader) => {
//!         let outcome = call_refresh_endpoint().await.ok();
//!         leader.settle(outcome.clone());
//!         outcome
//!     }
//!     Ticket::Follower(outcome) => outcome.await.ok().flatten(),
//! }
//! ```

use std::{
    collections::VecDeque,
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
};

use tokio::sync::oneshot;

/// Outcome of a refresh as seen by followers.
pub type Outcome = Option<String>;

#[derive(Default)]
struct State {
    in_flight: bool,
    waiters: VecDeque<oneshot::Sender<Outcome>>,
}

/// Owns the in-flight flag and the queue of waiting requests.
#[derive(Default)]
pub struct RefreshCoordinator {
    state: Mutex<State>,
}

/// Role handed out by [`RefreshCoordinator::begin_or_join`].
pub enum Ticket<'a> {
    /// No refresh was in flight: the holder must perform it and settle.
    Leader(Leader<'a>),

    /// A refresh is in flight: await its outcome.
    Follower(oneshot::Receiver<Outcome>),
}

/// Guard held by the request performing the refresh.
///
/// Dropping it without calling [`settle`](Self::settle), for instance when
/// the leading request is abandoned, settles with `None` so that no follower
/// waits forever.
#[must_use = "followers wait until the leader settles"]
pub struct Leader<'a> {
    coordinator: &'a RefreshCoordinator,
    settled: bool,
}

impl RefreshCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Becomes leader if no refresh is in flight, or joins the one that is.
    ///
    /// The check and the update happen in one critical section, so two
    /// requests can never both become leader.
    pub fn begin_or_join(&self) -> Ticket<'_> {
        let mut state = self.lock();
        if state.in_flight {
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            trace!("joined refresh in flight as waiter #{}", state.waiters.len());
            Ticket::Follower(rx)
        } else {
            state.in_flight = true;
            Ticket::Leader(Leader {
                coordinator: self,
                settled: false,
            })
        }
    }

    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.lock().in_flight
    }

    /// Number of requests waiting for the refresh in flight.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Clears the flag and notifies all waiters in FIFO order.
    fn finish(&self, outcome: &Outcome) -> usize {
        let waiters = {
            let mut state = self.lock();
            state.in_flight = false;
            std::mem::take(&mut state.waiters)
        };

        let count = waiters.len();
        for waiter in waiters {
            // A waiter whose request was abandoned has dropped its receiver.
            let _ = waiter.send(outcome.clone());
        }
        count
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("RefreshCoordinator")
            .field("in_flight", &state.in_flight)
            .field("waiting", &state.waiters.len())
            .finish()
    }
}

impl Leader<'_> {
    /// Ends the refresh, handing `outcome` to every waiter.
    ///
    /// Returns the number of waiters notified.
    pub fn settle(mut self, outcome: Outcome) -> usize {
        self.settled = true;
        self.coordinator.finish(&outcome)
    }
}

impl Drop for Leader<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let count = self.coordinator.finish(&None);
            warn!("refresh abandoned; failed {count} waiting requests");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn leader(ticket: Ticket<'_>) -> Leader<'_> {
        match ticket {
            Ticket::Leader(leader) => leader,
            Ticket::Follower(_) => panic!("expected to lead"),
        }
    }

    fn follower(ticket: Ticket<'_>) -> oneshot::Receiver<Outcome> {
        match ticket {
            Ticket::Follower(outcome) => outcome,
            Ticket::Leader(_) => panic!("expected to follow"),
        }
    }

    #[test]
    fn first_request_leads_and_others_follow() {
        let coordinator = RefreshCoordinator::new();
        assert!(!coordinator.is_in_flight());

        let lead = leader(coordinator.begin_or_join());
        assert!(coordinator.is_in_flight());

        let _a = follower(coordinator.begin_or_join());
        let _b = follower(coordinator.begin_or_join());
        assert_eq!(coordinator.waiting(), 2);

        assert_eq!(lead.settle(Some("A2".to_owned())), 2);
        assert!(!coordinator.is_in_flight());
        assert_eq!(coordinator.waiting(), 0);
    }

    #[tokio::test]
    async fn all_waiters_receive_the_same_outcome() {
        let coordinator = RefreshCoordinator::new();
        let lead = leader(coordinator.begin_or_join());
        let waiters: Vec<_> = (0..3)
            .map(|_| follower(coordinator.begin_or_join()))
            .collect();

        lead.settle(Some("A2".to_owned()));
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().as_deref(), Some("A2"));
        }
    }

    #[tokio::test]
    async fn failure_is_broadcast_as_none() {
        let coordinator = RefreshCoordinator::new();
        let lead = leader(coordinator.begin_or_join());
        let a = follower(coordinator.begin_or_join());
        let b = follower(coordinator.begin_or_join());

        lead.settle(None);
        assert_eq!(a.await.unwrap(), None);
        assert_eq!(b.await.unwrap(), None);
    }

    #[tokio::test]
    async fn waiters_are_notified_in_join_order() {
        let coordinator = RefreshCoordinator::new();
        let lead = leader(coordinator.begin_or_join());

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for id in 0..4 {
            let waiter = follower(coordinator.begin_or_join());
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let outcome = waiter.await.unwrap();
                order.lock().unwrap().push(id);
                outcome
            }));
        }

        // Let every waiter park on its receiver before settling.
        tokio::task::yield_now().await;

        lead.settle(Some("A2".to_owned()));
        for handle in handles {
            assert_eq!(handle.await.unwrap().as_deref(), Some("A2"));
        }
        assert_eq!(*order.lock().unwrap(), [0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn abandoned_leader_fails_waiters() {
        let coordinator = RefreshCoordinator::new();
        let lead = leader(coordinator.begin_or_join());
        let waiter = follower(coordinator.begin_or_join());

        drop(lead);
        assert_eq!(waiter.await.unwrap(), None);
        assert!(!coordinator.is_in_flight());
    }

    #[test]
    fn next_refresh_after_settling_gets_a_new_leader() {
        let coordinator = RefreshCoordinator::new();
        leader(coordinator.begin_or_join()).settle(None);
        let _lead = leader(coordinator.begin_or_join());
    }

    #[test]
    fn abandoned_waiter_does_not_block_settling() {
        let coordinator = RefreshCoordinator::new();
        let lead = leader(coordinator.begin_or_join());
        drop(follower(coordinator.begin_or_join()));

        assert_eq!(lead.settle(Some("A2".to_owned())), 1);
    }
}
