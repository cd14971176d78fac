//! Consent gate in front of the privileged call capability.
//!
//! Evaluation order: allow-list, then the persisted decision, then the user.
//! Only an explicit answer from the user is persisted; a dismissed prompt
//! denies the current call and leaves the origin undecided.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::origin::Origin;
use crate::permissions::{TrustDecision, Verdict};
use crate::trust_store::OriginTrustStore;

/// Outcome of showing the consent prompt once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PromptOutcome {
    /// User explicitly allowed the origin.
    Accept,
    /// User explicitly refused the origin.
    Decline,
    /// Prompt closed without a choice.
    Dismissed,
}

/// The user-facing consent prompt.
#[async_trait]
pub trait ConsentPrompt: Send + Sync {
    /// Ask the user about `origin`. Resolves exactly once.
    async fn show(&self, origin: &Origin, message: &str) -> PromptOutcome;
}

/// Prompt that always answers the same way. Counts how often it was shown.
#[derive(Debug)]
pub struct AutoPrompt {
    outcome: Mutex<PromptOutcome>,
    shown: AtomicUsize,
}

impl AutoPrompt {
    pub fn new(outcome: PromptOutcome) -> Self {
        Self {
            outcome: Mutex::new(outcome),
            shown: AtomicUsize::new(0),
        }
    }

    /// Change the answer given from now on.
    pub fn set_outcome(&self, outcome: PromptOutcome) {
        *self.outcome.lock() = outcome;
    }

    /// Number of times the prompt has been shown.
    pub fn times_shown(&self) -> usize {
        self.shown.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConsentPrompt for AutoPrompt {
    async fn show(&self, origin: &Origin, _message: &str) -> PromptOutcome {
        self.shown.fetch_add(1, Ordering::SeqCst);
        let outcome = *self.outcome.lock();
        tracing::debug!("Auto prompt for {} answered {:?}", origin, outcome);
        outcome
    }
}

/// Decides whether an origin may reach the privileged capability.
pub struct ConsentGate {
    trust: Arc<OriginTrustStore>,
    prompt: Arc<dyn ConsentPrompt>,
    /// One lane per origin with an evaluation in progress.
    lanes: Mutex<HashMap<Origin, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConsentGate {
    pub fn new(trust: Arc<OriginTrustStore>, prompt: Arc<dyn ConsentPrompt>) -> Self {
        Self {
            trust,
            prompt,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    pub fn trust_store(&self) -> &Arc<OriginTrustStore> {
        &self.trust
    }

    /// Evaluate whether `origin` may proceed, prompting with `message` if needed.
    pub async fn evaluate(&self, origin: &Origin, message: &str) -> bool {
        if self.trust.is_listed(origin) {
            tracing::debug!("{} is allow-listed", origin);
            return true;
        }

        if let Some(allowed) = settled(self.trust.decision(origin)) {
            tracing::debug!("{} has a stored decision (allowed: {})", origin, allowed);
            return allowed;
        }

        // Unknown: queue behind any prompt already open for this origin.
        let lane = self.acquire_lane(origin);
        let _turn = lane.lock.lock().await;
        match settled(self.trust.decision(origin)) {
            Some(allowed) => allowed,
            None => self.ask(origin, message).await,
        }
    }

    async fn ask(&self, origin: &Origin, message: &str) -> bool {
        tracing::info!("Prompting user for {}", origin);

        match self.prompt.show(origin, message).await {
            PromptOutcome::Accept => {
                self.persist(origin, Verdict::Allow);
                true
            }
            PromptOutcome::Decline => {
                self.persist(origin, Verdict::Deny);
                false
            }
            PromptOutcome::Dismissed => {
                tracing::info!("Prompt for {} dismissed; denying this call only", origin);
                false
            }
        }
    }

    fn persist(&self, origin: &Origin, verdict: Verdict) {
        if let Err(err) = self.trust.set_decision(origin, verdict) {
            tracing::warn!("Failed to persist {:?} for {}: {}", verdict, origin, err);
        }
    }

    fn acquire_lane(&self, origin: &Origin) -> Lane<'_> {
        let lock = self
            .lanes
            .lock()
            .entry(origin.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        Lane {
            gate: self,
            origin: origin.clone(),
            lock,
        }
    }

    #[cfg(test)]
    fn lane_count(&self) -> usize {
        self.lanes.lock().len()
    }
}

/// Handle on an origin's lane. Dropping it, including when the evaluation
/// is cancelled, removes the lane once nobody else is queued on it.
struct Lane<'a> {
    gate: &'a ConsentGate,
    origin: Origin,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for Lane<'_> {
    fn drop(&mut self) {
        let mut lanes = self.gate.lanes.lock();
        // The map's handle and ours only.
        if lanes.get(&self.origin).map(Arc::strong_count) == Some(2) {
            lanes.remove(&self.origin);
        }
    }
}

fn settled(decision: TrustDecision) -> Option<bool> {
    match decision {
        TrustDecision::Allow => Some(true),
        TrustDecision::Deny => Some(false),
        TrustDecision::Unknown => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::{
        JsonFilePermissions, MemoryPermissions, PermissionStore, PRIVILEGED_CALL,
    };
    use crate::prefs::MemoryPreferences;
    use std::time::Duration;
    use tokio::sync::{mpsc, oneshot};

    const KEY: &str = "extensions.callgate.allowedDomains";
    const MESSAGE: &str = "This website is requesting access to your webcam and microphone.";

    fn gate_with(prompt: Arc<dyn ConsentPrompt>) -> (ConsentGate, Arc<MemoryPermissions>) {
        let permissions = Arc::new(MemoryPermissions::new());
        let trust = Arc::new(OriginTrustStore::new(
            Arc::new(MemoryPreferences::new()),
            permissions.clone(),
            KEY,
            PRIVILEGED_CALL,
        ));
        (ConsentGate::new(trust, prompt), permissions)
    }

    fn origin(s: &str) -> Origin {
        Origin::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_allow_listed_origin_never_prompts() {
        let prompt = Arc::new(AutoPrompt::new(PromptOutcome::Decline));
        let (gate, permissions) = gate_with(prompt.clone());

        assert!(gate.evaluate(&origin("http://localhost/app"), MESSAGE).await);
        assert!(gate.evaluate(&origin("http://mozilla.github.com"), MESSAGE).await);
        assert_eq!(prompt.times_shown(), 0);
        // Allow-list membership is not copied into the permission store.
        assert_eq!(permissions.origin_count(), 0);
    }

    #[tokio::test]
    async fn test_stored_deny_never_prompts() {
        let prompt = Arc::new(AutoPrompt::new(PromptOutcome::Accept));
        let (gate, permissions) = gate_with(prompt.clone());
        let o = origin("https://blocked.example");
        permissions.add(&o, PRIVILEGED_CALL, Verdict::Deny).unwrap();

        assert!(!gate.evaluate(&o, MESSAGE).await);
        assert_eq!(prompt.times_shown(), 0);
    }

    #[tokio::test]
    async fn test_accept_is_persisted() {
        let prompt = Arc::new(AutoPrompt::new(PromptOutcome::Accept));
        let (gate, _) = gate_with(prompt.clone());
        let o = origin("https://new.example");

        assert!(gate.evaluate(&o, MESSAGE).await);
        assert_eq!(prompt.times_shown(), 1);
        assert_eq!(gate.trust_store().decision(&o), TrustDecision::Allow);

        prompt.set_outcome(PromptOutcome::Decline);
        assert!(gate.evaluate(&o, MESSAGE).await);
        assert!(gate.evaluate(&o, MESSAGE).await);
        assert_eq!(prompt.times_shown(), 1);
    }

    #[tokio::test]
    async fn test_decline_is_persisted() {
        let prompt = Arc::new(AutoPrompt::new(PromptOutcome::Decline));
        let (gate, _) = gate_with(prompt.clone());
        let o = origin("https://nope.example");

        assert!(!gate.evaluate(&o, MESSAGE).await);
        assert_eq!(gate.trust_store().decision(&o), TrustDecision::Deny);

        prompt.set_outcome(PromptOutcome::Accept);
        assert!(!gate.evaluate(&o, MESSAGE).await);
        assert_eq!(prompt.times_shown(), 1);
    }

    #[tokio::test]
    async fn test_dismiss_is_not_persisted() {
        let prompt = Arc::new(AutoPrompt::new(PromptOutcome::Dismissed));
        let (gate, permissions) = gate_with(prompt.clone());
        let o = origin("https://maybe.example");

        assert!(!gate.evaluate(&o, MESSAGE).await);
        assert_eq!(gate.trust_store().decision(&o), TrustDecision::Unknown);
        assert_eq!(permissions.origin_count(), 0);

        // The very next evaluation prompts again.
        prompt.set_outcome(PromptOutcome::Accept);
        assert!(gate.evaluate(&o, MESSAGE).await);
        assert_eq!(prompt.times_shown(), 2);
    }

    #[tokio::test]
    async fn test_unsaved_accept_applies_to_this_call_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("permissions.json");
        let permissions = Arc::new(JsonFilePermissions::open(&path).unwrap());
        let prompt = Arc::new(AutoPrompt::new(PromptOutcome::Accept));
        let trust = Arc::new(OriginTrustStore::new(
            Arc::new(MemoryPreferences::new()),
            permissions,
            KEY,
            PRIVILEGED_CALL,
        ));
        let gate = ConsentGate::new(trust, prompt.clone());
        let o = origin("https://flaky.example");

        // Make the decision file impossible to write.
        std::fs::create_dir(&path).unwrap();

        assert!(gate.evaluate(&o, MESSAGE).await);
        assert_eq!(gate.trust_store().decision(&o), TrustDecision::Unknown);
        assert!(gate.evaluate(&o, MESSAGE).await);
        assert_eq!(prompt.times_shown(), 2);
    }

    /// Prompt whose answers are supplied by the test, one per show().
    struct ManualPrompt {
        shown: mpsc::UnboundedSender<oneshot::Sender<PromptOutcome>>,
    }

    #[async_trait]
    impl ConsentPrompt for ManualPrompt {
        async fn show(&self, _origin: &Origin, _message: &str) -> PromptOutcome {
            let (tx, rx) = oneshot::channel();
            let _ = self.shown.send(tx);
            rx.await.unwrap_or(PromptOutcome::Dismissed)
        }
    }

    #[tokio::test]
    async fn test_overlapping_evaluations_share_one_prompt() {
        let (tx, mut shown) = mpsc::unbounded_channel();
        let (gate, _) = gate_with(Arc::new(ManualPrompt { shown: tx }));
        let gate = Arc::new(gate);
        let o = origin("https://busy.example");

        let first = tokio::spawn({
            let gate = gate.clone();
            let o = o.clone();
            async move { gate.evaluate(&o, MESSAGE).await }
        });
        let second = tokio::spawn({
            let gate = gate.clone();
            let o = o.clone();
            async move { gate.evaluate(&o, MESSAGE).await }
        });

        let answer = shown.recv().await.unwrap();
        answer.send(PromptOutcome::Accept).unwrap();

        assert!(first.await.unwrap());
        assert!(second.await.unwrap());
        // The queued evaluation saw the stored Allow instead of prompting.
        assert!(tokio::time::timeout(Duration::from_millis(50), shown.recv())
            .await
            .is_err());
        assert_eq!(gate.lane_count(), 0);
    }

    #[tokio::test]
    async fn test_queued_evaluation_prompts_again_after_dismiss() {
        let (tx, mut shown) = mpsc::unbounded_channel();
        let (gate, _) = gate_with(Arc::new(ManualPrompt { shown: tx }));
        let gate = Arc::new(gate);
        let o = origin("https://again.example");

        let first = tokio::spawn({
            let gate = gate.clone();
            let o = o.clone();
            async move { gate.evaluate(&o, MESSAGE).await }
        });
        let second = tokio::spawn({
            let gate = gate.clone();
            let o = o.clone();
            async move { gate.evaluate(&o, MESSAGE).await }
        });

        shown.recv().await.unwrap().send(PromptOutcome::Dismissed).unwrap();
        shown.recv().await.unwrap().send(PromptOutcome::Decline).unwrap();

        let mut results = vec![first.await.unwrap(), second.await.unwrap()];
        results.sort();
        assert_eq!(results, vec![false, false]);
        assert_eq!(gate.trust_store().decision(&o), TrustDecision::Deny);
    }

    #[tokio::test]
    async fn test_cancelled_evaluation_releases_lane() {
        let (tx, mut shown) = mpsc::unbounded_channel();
        let (gate, _) = gate_with(Arc::new(ManualPrompt { shown: tx }));
        let gate = Arc::new(gate);
        let o = origin("https://gone.example");

        let pending = tokio::spawn({
            let gate = gate.clone();
            let o = o.clone();
            async move { gate.evaluate(&o, MESSAGE).await }
        });
        // Prompt is open; the page goes away before it is answered.
        let _open = shown.recv().await.unwrap();
        assert_eq!(gate.lane_count(), 1);
        pending.abort();
        assert!(pending.await.unwrap_err().is_cancelled());
        assert_eq!(gate.lane_count(), 0);
        assert_eq!(gate.trust_store().decision(&o), TrustDecision::Unknown);

        let next = tokio::spawn({
            let gate = gate.clone();
            let o = o.clone();
            async move { gate.evaluate(&o, MESSAGE).await }
        });
        shown.recv().await.unwrap().send(PromptOutcome::Accept).unwrap();
        assert!(next.await.unwrap());
        assert_eq!(gate.lane_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_queued_evaluation_keeps_lane_for_prompt() {
        let (tx, mut shown) = mpsc::unbounded_channel();
        let (gate, _) = gate_with(Arc::new(ManualPrompt { shown: tx }));
        let gate = Arc::new(gate);
        let o = origin("https://queue.example");

        let first = tokio::spawn({
            let gate = gate.clone();
            let o = o.clone();
            async move { gate.evaluate(&o, MESSAGE).await }
        });
        let answer = shown.recv().await.unwrap();
        let queued = tokio::spawn({
            let gate = gate.clone();
            let o = o.clone();
            async move { gate.evaluate(&o, MESSAGE).await }
        });
        tokio::task::yield_now().await;
        queued.abort();
        let _ = queued.await;
        assert_eq!(gate.lane_count(), 1);

        answer.send(PromptOutcome::Decline).unwrap();
        assert!(!first.await.unwrap());
        assert_eq!(gate.lane_count(), 0);
    }

    #[tokio::test]
    async fn test_prompts_for_other_origins_are_independent() {
        let (tx, mut shown) = mpsc::unbounded_channel();
        let (gate, _) = gate_with(Arc::new(ManualPrompt { shown: tx }));
        let gate = Arc::new(gate);

        let a = tokio::spawn({
            let gate = gate.clone();
            async move { gate.evaluate(&origin("https://a.example"), MESSAGE).await }
        });
        let b = tokio::spawn({
            let gate = gate.clone();
            async move { gate.evaluate(&origin("https://b.example"), MESSAGE).await }
        });

        // Both prompts are open at once; answering them independently.
        let first = shown.recv().await.unwrap();
        let second = shown.recv().await.unwrap();
        first.send(PromptOutcome::Dismissed).unwrap();
        second.send(PromptOutcome::Accept).unwrap();

        let mut results = vec![a.await.unwrap(), b.await.unwrap()];
        results.sort();
        assert_eq!(results, vec![false, true]);
    }
}
