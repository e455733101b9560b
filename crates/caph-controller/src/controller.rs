//! Watch-driven work loop.
//!
//! HarvesterMachines are watched through `kube::runtime::Controller`, which
//! never runs two passes for the same object at once. A pass that settles is
//! revisited after the resync interval; a failed pass is retried with
//! exponential backoff tracked per machine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use caph_api::HarvesterMachine;
use caph_machine::{Action, Error, MachineReconciler, ObjectKey};
use futures::StreamExt;
use kube::api::{Api, ListParams};
use kube::runtime::controller::{self, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Client, ResourceExt};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::health::HealthState;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Backoff {
    pub fn new(max: Duration) -> Self {
        Self {
            initial: INITIAL_BACKOFF,
            max,
            multiplier: 2.0,
        }
    }

    /// Delay before retrying after `failures` consecutive failures, jittered
    /// to 0.5x..1.5x and capped at `max`.
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32) as i32;
        let base = (self.initial.as_secs_f64() * self.multiplier.powi(exponent))
            .min(self.max.as_secs_f64());
        let jitter = rand::rng().random_range(0.5..1.5);
        Duration::from_secs_f64(base * jitter).min(self.max)
    }
}

/// Consecutive failure counts per machine.
#[derive(Debug)]
pub struct RetryPolicy {
    backoff: Backoff,
    failures: Mutex<HashMap<ObjectKey, u32>>,
}

impl RetryPolicy {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            backoff,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn on_success(&self, key: &ObjectKey) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(key);
        }
    }

    /// Action for a failed pass. A cancelled pass is not a failure and is
    /// left to the next watch event.
    pub fn on_error(&self, key: &ObjectKey, error: &Error) -> Action {
        if matches!(error, Error::Cancelled) {
            debug!(machine = %key, "pass cancelled");
            return Action::await_change();
        }

        let delay = self.record_failure(key);
        warn!(
            machine = %key,
            error = %error,
            retry_in_ms = delay.as_millis() as u64,
            "reconciliation failed"
        );
        Action::requeue(delay)
    }

    /// Count a failure and return the delay before the next attempt.
    pub fn record_failure(&self, key: &ObjectKey) -> Duration {
        let count = match self.failures.lock() {
            Ok(mut failures) => {
                let count = failures.entry(key.clone()).or_insert(0);
                *count = count.saturating_add(1);
                *count
            }
            Err(_) => 1,
        };
        self.backoff.delay(count)
    }
}

/// Shared state handed to every pass.
pub struct Context {
    pub reconciler: Arc<MachineReconciler>,
    pub retry: RetryPolicy,
    pub resync: Duration,
    pub cancel: CancellationToken,
}

fn object_key(machine: &HarvesterMachine) -> ObjectKey {
    ObjectKey::new(machine.namespace().unwrap_or_default(), machine.name_any())
}

/// A settled machine is still revisited every resync interval.
pub fn with_resync(action: Action, resync: Duration) -> Action {
    if action == Action::await_change() {
        Action::requeue(resync)
    } else {
        action
    }
}

async fn reconcile(machine: Arc<HarvesterMachine>, ctx: Arc<Context>) -> Result<Action, Error> {
    let key = object_key(&machine);
    let action = ctx
        .reconciler
        .reconcile(&key, ctx.cancel.child_token())
        .await?;
    ctx.retry.on_success(&key);
    Ok(with_resync(action, ctx.resync))
}

fn error_policy(machine: Arc<HarvesterMachine>, error: &Error, ctx: Arc<Context>) -> Action {
    ctx.retry.on_error(&object_key(&machine), error)
}

/// Watch HarvesterMachines and reconcile them until `cancel` fires. An
/// in-flight pass sees a child of the same token and stops at its next
/// platform call.
pub async fn run(
    client: Client,
    reconciler: Arc<MachineReconciler>,
    config: &ControllerConfig,
    health: HealthState,
    cancel: CancellationToken,
) {
    let machines: Api<HarvesterMachine> = match &config.watch_namespace {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    };

    match machines.list(&ListParams::default().limit(1)).await {
        Ok(_) => health.set_ready(true),
        Err(e) => error!(error = %e, "failed to list HarvesterMachines"),
    }

    let ctx = Arc::new(Context {
        reconciler,
        retry: RetryPolicy::new(Backoff::new(config.backoff_max)),
        resync: config.resync_interval,
        cancel: cancel.clone(),
    });

    info!(
        namespace = config.watch_namespace.as_deref().unwrap_or("*"),
        resync_secs = config.resync_interval.as_secs(),
        "controller started"
    );

    Controller::new(machines, WatcherConfig::default())
        .graceful_shutdown_on(async move { cancel.cancelled().await })
        .run(reconcile, error_policy, ctx)
        .for_each(|result| {
            let health = health.clone();
            async move {
                match result {
                    Ok((machine, action)) => {
                        health.set_ready(true);
                        debug!(machine = %machine, ?action, "pass finished");
                    }
                    Err(controller::Error::QueueError(e)) => {
                        health.set_ready(false);
                        error!(error = %e, "HarvesterMachine watch failed");
                    }
                    Err(e) => debug!(error = %e, "pass failed"),
                }
            }
        })
        .await;

    info!("controller stopped");
}
