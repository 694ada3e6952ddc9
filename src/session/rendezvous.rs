//! One-shot broadcast rendezvous between parallel workers.
//!
//! One designated participant performs a privileged step and publishes its
//! result; every participant, the designated one included, then consumes the
//! same published value. Suite-end teardown waits until every participant
//! has arrived; a participant dropped without arriving (a worker that
//! panicked) counts as arrived so the rest never wait on it.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::error::{Error, Result};

/// Create `participants` handles. Index 0 is the designated participant.
///
/// Returns an empty vector when `participants` is zero.
pub fn rendezvous<T: Clone>(participants: usize) -> Vec<Participant<T>> {
    if participants == 0 {
        return Vec::new();
    }

    let (tx, rx) = watch::channel(None);
    let arrivals = Arc::new(watch::Sender::new(0usize));
    let mut publisher = Some(tx);

    (0..participants)
        .map(|index| Participant {
            index,
            participants,
            publisher: publisher.take(),
            receiver: rx.clone(),
            arrivals: Arc::clone(&arrivals),
            arrived: false,
        })
        .collect()
}

/// One worker's view of the rendezvous.
#[derive(Debug)]
pub struct Participant<T> {
    index: usize,
    participants: usize,
    publisher: Option<watch::Sender<Option<T>>>,
    receiver: watch::Receiver<Option<T>>,
    /// Number of participants that reached teardown or were dropped.
    arrivals: Arc<watch::Sender<usize>>,
    arrived: bool,
}

impl<T: Clone> Participant<T> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_designated(&self) -> bool {
        self.index == 0
    }

    /// Two-phase setup.
    ///
    /// The designated participant runs `privileged` and publishes its value.
    /// Every participant then waits for the published value and returns a
    /// clone of it. If the privileged step fails, the designated participant
    /// returns that error and every other participant gets
    /// [`Error::Rendezvous`].
    pub async fn synchronize<F, Fut>(&mut self, privileged: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(tx) = self.publisher.take() {
            debug!(worker = self.index, "Running privileged setup phase");
            let value = privileged().await?;
            tx.send_replace(Some(value));
        }

        let published = self
            .receiver
            .wait_for(Option::is_some)
            .await
            .map_err(|_| {
                Error::Rendezvous("designated worker exited without publishing".to_string())
            })?
            .clone();

        published.ok_or_else(|| Error::Rendezvous("published value missing".to_string()))
    }

    /// Two-phase teardown.
    ///
    /// Waits until every participant has arrived or been dropped, then runs
    /// `designated_phase` on the designated participant only.
    pub async fn teardown<F, Fut>(mut self, designated_phase: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut arrivals = self.arrivals.subscribe();
        self.arrive();
        let participants = self.participants;
        if arrivals.wait_for(|n| *n >= participants).await.is_err() {
            debug!(worker = self.index, "Teardown rendezvous closed early");
        }

        if self.is_designated() {
            debug!(worker = self.index, "Running designated teardown phase");
            designated_phase().await;
        }
    }
}

impl<T> Participant<T> {
    fn arrive(&mut self) {
        if !self.arrived {
            self.arrived = true;
            self.arrivals.send_modify(|n| *n += 1);
        }
    }
}

impl<T> Drop for Participant<T> {
    fn drop(&mut self) {
        self.arrive();
    }
}
