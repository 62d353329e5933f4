//! Pipeline-wide rejection gate.
//!
//! When the remote sink refuses this identity, every shard must stop
//! sending. The first shard to see the rejection trips the gate; all shards
//! check it before each attempt. Under [`RejectPolicy::Halt`] the gate stays
//! closed and the driver stops the pipeline. Under [`RejectPolicy::Pause`]
//! it reopens after a fixed interval.

use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// What to do once the remote sink rejects this identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RejectAction {
    /// Stop the pipeline; the process exits non-zero.
    #[default]
    Halt,
    /// Discard batches for a while, then resume.
    Pause,
}

/// Resolved rejection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectPolicy {
    /// Close the gate for good.
    Halt,
    /// Close the gate for the given duration.
    Pause(Duration),
}

impl RejectPolicy {
    /// Builds the policy from a configured action and pause length.
    pub fn new(action: RejectAction, pause: Duration) -> Self {
        match action {
            RejectAction::Halt => Self::Halt,
            RejectAction::Pause => Self::Pause(pause),
        }
    }
}

/// Shared switch that stops all sending after an identity rejection.
#[derive(Debug)]
pub struct RejectGate {
    policy: RejectPolicy,
    halted: CancellationToken,
    state: Mutex<GateState>,
}

#[derive(Debug, Default)]
struct GateState {
    paused_until: Option<Instant>,
    message: Option<String>,
}

impl RejectGate {
    /// Creates an open gate.
    pub fn new(policy: RejectPolicy) -> Self {
        Self {
            policy,
            halted: CancellationToken::new(),
            state: Mutex::new(GateState::default()),
        }
    }

    /// The configured policy.
    pub fn policy(&self) -> RejectPolicy {
        self.policy
    }

    /// Closes the gate after a rejection carrying `message`.
    pub fn trip(&self, message: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.message = Some(message.to_string());
            if let RejectPolicy::Pause(pause) = self.policy {
                state.paused_until = Some(Instant::now() + pause);
            }
        }

        match self.policy {
            RejectPolicy::Halt => {
                error!(message, "remote sink rejected this identity, halting all sending");
                self.halted.cancel();
            }
            RejectPolicy::Pause(pause) => {
                error!(
                    message,
                    pause_secs = pause.as_secs(),
                    "remote sink rejected this identity, pausing all sending"
                );
            }
        }
    }

    /// Returns true if sending is currently allowed.
    pub fn is_open(&self) -> bool {
        if self.halted.is_cancelled() {
            return false;
        }
        match self.state.lock() {
            Ok(state) => state
                .paused_until
                .is_none_or(|until| Instant::now() >= until),
            Err(_) => false,
        }
    }

    /// Returns true if the gate was tripped under [`RejectPolicy::Halt`].
    pub fn is_halted(&self) -> bool {
        self.halted.is_cancelled()
    }

    /// Completes once the gate is halted.
    pub async fn halted(&self) {
        self.halted.cancelled().await;
    }

    /// The message of the most recent rejection, if any.
    pub fn message(&self) -> Option<String> {
        self.state.lock().ok().and_then(|state| state.message.clone())
    }
}
