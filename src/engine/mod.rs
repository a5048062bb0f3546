//! Referral engine
//!
//! The write side of the network: placement (registration time), point
//! propagation and commissions (activation time), and the wallet paths that
//! gate them. Every public mutation runs as one rusqlite transaction under
//! the store lock and is retried a bounded number of times when the store
//! reports busy.

mod placement;
mod propagation;
mod wallet;

use rusqlite::Connection;
use std::time::Duration;
use tracing::warn;

use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult};
use crate::events::{DomainEvent, EventBus};
use crate::store::MemberStore;

#[derive(Clone)]
pub struct ReferralEngine {
    store: MemberStore,
    config: EngineConfig,
    events: EventBus,
}

impl ReferralEngine {
    pub fn new(store: MemberStore, config: EngineConfig) -> Self {
        Self {
            store,
            config,
            events: EventBus::default(),
        }
    }

    pub fn store(&self) -> &MemberStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Run one transactional operation with bounded busy-retry.
    ///
    /// The closure owns the full transaction (begin to commit) and returns
    /// the domain events to publish; events are emitted only after the
    /// closure has returned successfully, never from inside the transaction.
    pub(crate) async fn with_retry<T>(
        &self,
        op_name: &'static str,
        mut op: impl FnMut(&mut Connection) -> EngineResult<(T, Vec<DomainEvent>)>,
    ) -> EngineResult<T> {
        let mut attempt: u32 = 0;
        loop {
            let result = {
                let mut conn = self.store.lock().await;
                op(&mut conn)
            };

            match result {
                Ok((out, events)) => {
                    for event in events {
                        self.events.emit(event);
                    }
                    return Ok(out);
                }
                Err(e) if e.is_busy() => {
                    attempt += 1;
                    if attempt > self.config.busy_retries {
                        return Err(EngineError::ConcurrencyConflict { attempts: attempt });
                    }
                    warn!(op = op_name, attempt, "store busy, retrying");
                    tokio::time::sleep(Duration::from_millis(25 * u64::from(attempt))).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
