use std::fmt;
use tokio::sync::watch;

/// Why a rule routine is asked to exit. Only a deletion clears the rule's
/// instance state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopReason {
    Shutdown,
    RuleDeleted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Shutdown => write!(f, "shutdown"),
            StopReason::RuleDeleted => write!(f, "rule deleted"),
        }
    }
}

type Signal = watch::Receiver<Option<StopReason>>;

/// Owner side of a stop signal. A child source also observes its parent, so
/// stopping the root reaches every rule.
#[derive(Debug)]
pub struct StopSource {
    tx: watch::Sender<Option<StopReason>>,
    parent: Option<Signal>,
}

impl Default for StopSource {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSource {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx, parent: None }
    }

    pub fn child(&self) -> StopSource {
        let (tx, _) = watch::channel(None);
        Self {
            tx,
            parent: Some(self.tx.subscribe()),
        }
    }

    pub fn token(&self) -> StopToken {
        StopToken {
            own: self.tx.subscribe(),
            parent: self.parent.clone(),
        }
    }

    /// Sets the reason. The first reason sticks; returns whether this call
    /// set it.
    pub fn stop(&self, reason: StopReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    pub fn reason(&self) -> Option<StopReason> {
        self.token().reason()
    }

    pub fn is_stopped(&self) -> bool {
        self.reason().is_some()
    }
}

/// Observer side of a stop signal.
#[derive(Debug, Clone)]
pub struct StopToken {
    own: Signal,
    parent: Option<Signal>,
}

impl StopToken {
    pub fn reason(&self) -> Option<StopReason> {
        let own = *self.own.borrow();
        own.or_else(|| self.parent.as_ref().and_then(|p| *p.borrow()))
    }

    pub fn is_stopped(&self) -> bool {
        self.reason().is_some()
    }

    /// Resolves once the rule's own signal or its parent's fires. A dropped
    /// source counts as shutdown.
    pub async fn stopped(&self) -> StopReason {
        let own = wait(self.own.clone());
        let parent = async {
            match self.parent.clone() {
                Some(parent) => wait(parent).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            reason = own => reason,
            reason = parent => reason,
        }
    }
}

async fn wait(mut rx: Signal) -> StopReason {
    match rx.wait_for(Option::is_some).await {
        Ok(reason) => {
            let reason = *reason;
            reason.unwrap_or(StopReason::Shutdown)
        }
        Err(_) => StopReason::Shutdown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_first_reason_sticks() {
        let source = StopSource::new();
        let token = source.token();
        assert!(!token.is_stopped());

        assert!(source.stop(StopReason::RuleDeleted));
        assert!(!source.stop(StopReason::Shutdown));
        assert_eq!(token.stopped().await, StopReason::RuleDeleted);
        assert_eq!(source.reason(), Some(StopReason::RuleDeleted));
    }

    #[tokio::test]
    async fn test_parent_stop_reaches_child() {
        let root = StopSource::new();
        let child = root.child();
        let sibling = root.child();
        let token = child.token();

        sibling.stop(StopReason::RuleDeleted);
        assert!(!token.is_stopped());

        let waiter = tokio::spawn(async move { token.stopped().await });
        root.stop(StopReason::Shutdown);
        let reason = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, StopReason::Shutdown);
    }

    #[tokio::test]
    async fn test_own_reason_wins_over_parent() {
        let root = StopSource::new();
        let child = root.child();
        child.stop(StopReason::RuleDeleted);
        root.stop(StopReason::Shutdown);
        assert_eq!(child.token().stopped().await, StopReason::RuleDeleted);
    }

    #[tokio::test]
    async fn test_dropped_source_is_shutdown() {
        let source = StopSource::new();
        let token = source.token();
        drop(source);
        assert_eq!(token.stopped().await, StopReason::Shutdown);
    }
}
