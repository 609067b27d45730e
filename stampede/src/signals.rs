//! Run state signalling between the driver and its workers.
//!
//! The driver holds the single [`Switch`]; every worker and the reporter hold
//! a [`Watcher`]. Unlike a one-shot shutdown signal the run state may flip
//! between [`RunState::Running`] and [`RunState::Paused`] any number of times
//! before it settles on [`RunState::Stopped`], which is final.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What workers should currently be doing.
pub enum RunState {
    /// Emit events.
    Running,
    /// Hold, emitting nothing, until running or stopped.
    Paused,
    /// Exit. Never left once entered.
    Stopped,
}

/// Construct a `Switch` and `Watcher` pair, initially in `state`.
#[must_use]
pub fn switch(state: RunState) -> (Switch, Watcher) {
    let (sender, receiver) = watch::channel(state);
    (
        Switch {
            sender: Arc::new(sender),
        },
        Watcher { receiver },
    )
}

#[derive(Debug, Clone)]
/// Sets the run state seen by every derived [`Watcher`].
pub struct Switch {
    sender: Arc<watch::Sender<RunState>>,
}

impl Switch {
    /// Move to `state`. Has no effect once stopped. Returns the previous
    /// state.
    pub fn set(&self, state: RunState) -> RunState {
        let mut previous = state;
        self.sender.send_if_modified(|current| {
            previous = *current;
            if *current == RunState::Stopped || *current == state {
                return false;
            }
            *current = state;
            true
        });
        debug!(?previous, ?state, "run state set");
        previous
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> RunState {
        *self.sender.borrow()
    }

    /// A new [`Watcher`] on this switch.
    #[must_use]
    pub fn watcher(&self) -> Watcher {
        Watcher {
            receiver: self.sender.subscribe(),
        }
    }
}

#[derive(Debug, Clone)]
/// Observes the run state set by a [`Switch`].
pub struct Watcher {
    receiver: watch::Receiver<RunState>,
}

impl Watcher {
    /// The current state. A dropped [`Switch`] reads as stopped.
    #[must_use]
    pub fn state(&self) -> RunState {
        if self.receiver.has_changed().is_err() {
            return RunState::Stopped;
        }
        *self.receiver.borrow()
    }

    /// Whether the state is [`RunState::Running`].
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }

    /// Wait until the state is anything but paused and return it.
    pub async fn unpaused(&mut self) -> RunState {
        match self.receiver.wait_for(|s| *s != RunState::Paused).await {
            Ok(state) => *state,
            Err(_) => RunState::Stopped,
        }
    }

    /// Wait until stopped.
    pub async fn stopped(mut self) {
        // An error means the switch is gone, which reads as stopped.
        let _ = self.receiver.wait_for(|s| *s == RunState::Stopped).await;
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{RunState, switch};

    #[tokio::test]
    async fn stopped_is_final() {
        let (switch, watcher) = switch(RunState::Paused);
        assert_eq!(switch.set(RunState::Running), RunState::Paused);
        assert_eq!(switch.set(RunState::Stopped), RunState::Running);
        assert_eq!(switch.set(RunState::Running), RunState::Stopped);
        assert_eq!(watcher.state(), RunState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn unpaused_waits_for_resume() {
        let (switch, mut watcher) = switch(RunState::Paused);
        let waiter = tokio::spawn(async move { watcher.unpaused().await });
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!waiter.is_finished());
        switch.set(RunState::Running);
        assert_eq!(waiter.await.unwrap(), RunState::Running);
    }

    #[tokio::test]
    async fn dropped_switch_reads_as_stopped() {
        let (switch, mut watcher) = switch(RunState::Paused);
        let other = switch.watcher();
        drop(switch);
        assert_eq!(watcher.state(), RunState::Stopped);
        assert_eq!(watcher.unpaused().await, RunState::Stopped);
        other.stopped().await;
    }
}
