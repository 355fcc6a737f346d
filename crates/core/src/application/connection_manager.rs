// Connection Manager
//
// Owns the broker connection lifecycle and its state machine. Consumer and
// Publisher observe the state through a watch receiver.

use crate::application::retry::{retry, BackoffPolicy, Failure};
use crate::domain::{ConnectionState, DomainError};
use crate::port::{Broker, ConnectionError};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    policy: BackoffPolicy,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    /// Create a manager in the `Disconnected` state
    ///
    /// # Arguments
    /// * `broker` - Broker adapter (the only owner of the socket)
    /// * `policy` - Connect retry policy (fixed delay from the broker URL)
    pub fn new(broker: Arc<dyn Broker>, policy: BackoffPolicy) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            broker,
            policy,
            state_tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Subscribe to state changes (disconnect notification)
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        Arc::clone(&self.broker)
    }

    /// Connect with retries.
    ///
    /// Returns `ConnectionError::Exhausted` once the attempt budget is spent;
    /// the state is then back to `Disconnected`.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }
        self.transition(ConnectionState::Connecting)
            .map_err(|e| ConnectionError::InvalidState(e.to_string()))?;

        let broker = &self.broker;
        let result = retry(&self.policy, "broker_connect", |attempt| async move {
            debug!(attempt, "Connecting to broker");
            broker.connect().await.map_err(Failure::Transient)
        })
        .await;

        match result {
            Ok(()) => {
                self.transition(ConnectionState::Connected)
                    .map_err(|e| ConnectionError::InvalidState(e.to_string()))?;
                info!("Connected to broker");
                Ok(())
            }
            Err(e) => {
                let _ = self.transition(ConnectionState::Disconnected);
                Err(ConnectionError::Exhausted {
                    attempts: e.attempts(),
                    last_error: e.into_inner().to_string(),
                })
            }
        }
    }

    /// Record a lost connection (delivery stream failed)
    pub fn mark_disconnected(&self) {
        if self.state() != ConnectionState::Disconnected {
            warn!(state = %self.state(), "Broker connection lost");
            let _ = self.transition(ConnectionState::Disconnected);
        }
    }

    /// Stop accepting deliveries; publishing and acking stay possible
    pub async fn drain(&self) -> Result<(), ConnectionError> {
        if self.state() != ConnectionState::Connected {
            return Ok(());
        }
        self.transition(ConnectionState::Draining)
            .map_err(|e| ConnectionError::InvalidState(e.to_string()))?;
        info!("Draining: consumer cancelled");
        self.broker.cancel().await
    }

    /// Close the connection; unacknowledged deliveries return to their queues
    pub async fn close(&self) -> Result<(), ConnectionError> {
        let result = self.broker.close().await;
        let _ = self.transition(ConnectionState::Disconnected);
        info!("Broker connection closed");
        result
    }

    fn transition(&self, next: ConnectionState) -> Result<(), DomainError> {
        let mut outcome = Ok(());
        let changed = self.state_tx.send_if_modified(|state| match state.transition(next) {
            Ok(new_state) => {
                let changed = *state != new_state;
                *state = new_state;
                changed
            }
            Err(e) => {
                outcome = Err(e);
                false
            }
        });
        if changed {
            debug!(state = %next, "Connection state changed");
        }
        outcome
    }
}
