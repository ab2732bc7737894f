//! Named one-shot latches. Launch, breakpoint configuration and the run
//! start race each other; operations that need a prerequisite block here
//! until it is resolved exactly once. Restart re-creates the latches.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::watch;

pub const SOURCE_LOADED: &str = "sourceLoaded";
pub const SCRIPT_RESOLVED: &str = "scriptResolved";
pub const CONFIGURATION_DONE: &str = "configurationDone";

#[derive(Default)]
pub struct PrereqGate {
    latches: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl PrereqGate {
    pub fn new() -> Self {
        PrereqGate::default()
    }

    /// Register a fresh unresolved latch. Re-creating an existing name
    /// replaces it and releases any waiter of the stale latch.
    pub fn create(&self, name: &str) {
        let (tx, _) = watch::channel(false);
        self.latches.lock().unwrap().insert(name.to_string(), tx);
    }

    /// Suspend until the latch resolves. All waiters complete together.
    /// Waiting on an unknown name returns immediately: some prerequisites
    /// are optional depending on the launch path.
    pub async fn wait(&self, name: &str) {
        let rx = self
            .latches
            .lock()
            .unwrap()
            .get(name)
            .map(|tx| tx.subscribe());
        let Some(mut rx) = rx else {
            return;
        };
        // An error here means the latch was replaced mid-wait; the stale
        // waiter is released rather than left hanging.
        let _ = rx.wait_for(|resolved| *resolved).await;
    }

    /// Complete the latch. Later calls for the same name are no-ops.
    pub fn resolve(&self, name: &str) {
        if let Some(tx) = self.latches.lock().unwrap().get(name) {
            tx.send_replace(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn waiters_block_until_resolved() {
        let gate = Arc::new(PrereqGate::new());
        gate.create(SCRIPT_RESOLVED);

        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.wait(SCRIPT_RESOLVED).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        gate.resolve(SCRIPT_RESOLVED);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter must complete after resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn all_waiters_complete_together() {
        let gate = Arc::new(PrereqGate::new());
        gate.create(CONFIGURATION_DONE);
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let gate = gate.clone();
                tokio::spawn(async move { gate.wait(CONFIGURATION_DONE).await })
            })
            .collect();

        gate.resolve(CONFIGURATION_DONE);
        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn unknown_name_is_not_waited_for() {
        let gate = PrereqGate::new();
        gate.wait("neverRegistered").await;
    }

    #[tokio::test]
    async fn wait_after_resolve_returns_immediately() {
        let gate = PrereqGate::new();
        gate.create(SOURCE_LOADED);
        gate.resolve(SOURCE_LOADED);
        gate.resolve(SOURCE_LOADED); // second resolve is a no-op
        gate.wait(SOURCE_LOADED).await;
    }

    #[tokio::test]
    async fn recreate_rearms_the_latch() {
        let gate = Arc::new(PrereqGate::new());
        gate.create(SCRIPT_RESOLVED);
        gate.resolve(SCRIPT_RESOLVED);
        gate.wait(SCRIPT_RESOLVED).await;

        gate.create(SCRIPT_RESOLVED);
        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.wait(SCRIPT_RESOLVED).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        gate.resolve(SCRIPT_RESOLVED);
        waiter.await.unwrap();
    }
}
