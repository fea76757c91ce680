// Copyright 2020 Joyent, Inc.

//! Joining several cancellation signals into one.

use futures::future::{self, FutureExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A token cancelled as soon as any one of its parents is cancelled.
///
/// The token is also cancelled when the `LinkedCancellation` is dropped, so
/// work started under it never outlives its owner.
pub struct LinkedCancellation {
    token: CancellationToken,
    relay: Option<JoinHandle<()>>,
}

impl LinkedCancellation {
    pub fn new(parents: Vec<CancellationToken>) -> LinkedCancellation {
        let token = CancellationToken::new();

        if parents.is_empty() {
            return LinkedCancellation { token, relay: None };
        }
        if parents.iter().any(|p| p.is_cancelled()) {
            token.cancel();
            return LinkedCancellation { token, relay: None };
        }

        let child = token.clone();
        let relay = tokio::spawn(async move {
            let any_parent = future::select_all(
                parents
                    .into_iter()
                    .map(|p| async move { p.cancelled().await }.boxed()),
            );
            tokio::select! {
                _ = any_parent => child.cancel(),
                _ = child.cancelled() => (),
            }
        });

        LinkedCancellation {
            token,
            relay: Some(relay),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Drop for LinkedCancellation {
    fn drop(&mut self) {
        self.token.cancel();
        if let Some(relay) = self.relay.take() {
            relay.abort();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::time::Duration;

    use tokio::time::timeout;

    #[tokio::test]
    async fn first_parent_cancels_the_link() {
        let a = CancellationToken::new();
        let b = CancellationToken::new();
        let linked = LinkedCancellation::new(vec![a.clone(), b.clone()]);
        assert!(!linked.is_cancelled());

        b.cancel();
        let fired = timeout(Duration::from_secs(1), linked.token().cancelled()).await;
        assert!(fired.is_ok());
        assert!(!a.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_parent_cancels_immediately() {
        let a = CancellationToken::new();
        a.cancel();
        let linked = LinkedCancellation::new(vec![a, CancellationToken::new()]);
        assert!(linked.is_cancelled());
    }

    #[tokio::test]
    async fn dropping_the_link_cancels_its_token_only() {
        let parent = CancellationToken::new();
        let linked = LinkedCancellation::new(vec![parent.clone()]);
        let token = linked.token().clone();
        drop(linked);
        assert!(token.is_cancelled());
        assert!(!parent.is_cancelled());
    }
}
