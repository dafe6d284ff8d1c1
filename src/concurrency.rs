//! Binary-semaphore wrapper around [`QosManager`].
//!
//! The statistics engine and the adaptive controller are driven by a
//! cooperative single-threaded model upstream; this crate runs the monitor,
//! adapt, and logger loops as genuine OS threads instead, so every shared
//! resource needs real mutual exclusion. [`ThreadedQosManager`]
//! reproduces the source's two independent semaphores rather than collapsing
//! everything behind one lock: REST programming calls (`set_queues`,
//! `set_rules`, ...) share one semaphore, and `adapt_queues` holds the other,
//! so a slow adaptation cycle never blocks an unrelated `get_queues` poll
//! and vice versa. `adapt_queues` nests the two: it holds `adapt_sem` for the
//! whole cycle and, only if it actually changed a limit, separately acquires
//! `resource_sem` to push the result with `set_queues`.
//!
//! Each guarded call takes an explicit `blocking` override. `Some(true)`
//! waits for the semaphore; `Some(false)` or `None` (falling back to the
//! config's `blocking_default`) returns `Ok(None)` immediately if the
//! semaphore is already held, rather than queuing behind it.

use std::collections::HashMap;
use std::sync::{Mutex, TryLockError};

use tracing::warn;

use crate::config::Config;
use crate::controller;
use crate::error::Result;
use crate::flow::FlowId;
use crate::qos::{DpidTarget, QosManager};

pub struct ThreadedQosManager {
    qos: Mutex<QosManager>,
    resource_sem: Mutex<()>,
    adapt_sem: Mutex<()>,
    blocking_default: bool,
}

impl ThreadedQosManager {
    pub fn new(config: &Config) -> Self {
        ThreadedQosManager {
            qos: Mutex::new(QosManager::new(config)),
            resource_sem: Mutex::new(()),
            adapt_sem: Mutex::new(()),
            blocking_default: config.blocking_default,
        }
    }

    /// Acquire `sem` per `blocking`, then run `f` against the locked
    /// `QosManager`. Returns `Ok(None)` without calling `f` if a
    /// non-blocking acquire finds the semaphore held.
    fn guarded<F, R>(&self, sem: &Mutex<()>, op: &str, blocking: Option<bool>, f: F) -> Result<Option<R>>
    where
        F: FnOnce(&mut QosManager) -> Result<R>,
    {
        let blocking = blocking.unwrap_or(self.blocking_default);
        let _guard = if blocking {
            sem.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
        } else {
            match sem.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::WouldBlock) => {
                    warn!(op, "resource busy, skipping this cycle");
                    return Ok(None);
                }
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            }
        };
        let mut qos = self.qos.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut qos).map(Some)
    }

    pub fn set_ovsdb_addr(&self, dpid: u64, blocking: Option<bool>) -> Result<Option<()>> {
        self.guarded(&self.resource_sem, "set_ovsdb_addr", blocking, |qos| {
            qos.set_ovsdb_addr(dpid)
        })
    }

    pub fn set_queues(&self, target: DpidTarget, blocking: Option<bool>) -> Result<Option<()>> {
        self.guarded(&self.resource_sem, "set_queues", blocking, |qos| qos.set_queues(target))
    }

    pub fn get_queues(&self, target: DpidTarget, blocking: Option<bool>) -> Result<Option<()>> {
        self.guarded(&self.resource_sem, "get_queues", blocking, |qos| qos.get_queues(target))
    }

    pub fn delete_queues(&self, target: DpidTarget, blocking: Option<bool>) -> Result<Option<()>> {
        self.guarded(&self.resource_sem, "delete_queues", blocking, |qos| {
            qos.delete_queues(target)
        })
    }

    pub fn set_rules(&self, target: DpidTarget, blocking: Option<bool>) -> Result<Option<()>> {
        self.guarded(&self.resource_sem, "set_rules", blocking, |qos| qos.set_rules(target))
    }

    pub fn get_rules(&self, target: DpidTarget, blocking: Option<bool>) -> Result<Option<()>> {
        self.guarded(&self.resource_sem, "get_rules", blocking, |qos| qos.get_rules(target))
    }

    pub fn delete_rules(&self, target: DpidTarget, blocking: Option<bool>) -> Result<Option<()>> {
        self.guarded(&self.resource_sem, "delete_rules", blocking, |qos| {
            qos.delete_rules(target)
        })
    }

    pub fn clear_flow_entries(&self, dpid: u64, blocking: Option<bool>) -> Result<Option<()>> {
        self.guarded(&self.resource_sem, "clear_flow_entries", blocking, |qos| {
            qos.clear_flow_entries(dpid)
        })
    }

    /// Run one adaptation cycle, holding `adapt_sem` for its duration.
    /// Returns `Ok(None)` if the adapt semaphore is already held by another
    /// in-flight cycle.
    ///
    /// If the cycle actually changed a limit, this pushes the updated
    /// queues to every switch before returning, upgrading the inner
    /// `set_queues` call to blocking so the push always completes — the
    /// same nested-lock structure the source uses (adapt_sem held around
    /// the whole call, resource_sem acquired separately for the push), so a
    /// caller observing `Ok(Some(true))` can rely on the push having
    /// already happened.
    pub fn adapt_queues(
        &self,
        flowstats: &HashMap<FlowId, f64>,
        limit_step: i64,
        blocking: Option<bool>,
    ) -> Result<Option<bool>> {
        let modified = self.guarded(&self.adapt_sem, "adapt_queues", blocking, |qos| {
            controller::pre_adapt(qos, flowstats, limit_step)
        })?;
        match modified {
            Some(true) => {
                self.set_queues(DpidTarget::All, Some(true))?;
                Ok(Some(true))
            }
            other => Ok(other),
        }
    }

    pub fn get_current_limit(&self, flow: &FlowId) -> Result<i64> {
        self.qos
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get_current_limit(flow)
    }

    pub fn get_initial_limit(&self, flow: &FlowId) -> Result<i64> {
        self.qos
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get_initial_limit(flow)
    }

    pub fn declared_flows(&self) -> Vec<FlowId> {
        self.qos
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .declared_flows()
            .cloned()
            .collect()
    }
}
