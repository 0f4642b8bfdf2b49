use std::future::Future;

use tokio::sync::watch;

use crate::error::{HandoffError, Result};

/// Cloneable flag shared by everything working on one attempt. Once raised it
/// stays raised; suspended waits racing against it resolve to `UserCancelled`.
#[derive(Clone, Debug)]
pub struct Cancellation {
    flag: std::sync::Arc<watch::Sender<bool>>,
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellation {
    pub fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            flag: std::sync::Arc::new(flag),
        }
    }

    /// Returns true only for the call that actually raised the flag.
    pub fn cancel(&self) -> bool {
        self.flag.send_if_modified(|raised| {
            if *raised {
                false
            } else {
                *raised = true;
                true
            }
        })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.flag.borrow()
    }

    pub async fn cancelled(&self) {
        let mut flag = self.flag.subscribe();
        // the sender lives in self, so wait_for cannot observe a closed channel
        let _ = flag.wait_for(|raised| *raised).await;
    }

    /// Runs `work` unless the flag is raised first.
    pub async fn guard<T, F>(&self, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_cancelled() {
            return Err(HandoffError::UserCancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(HandoffError::UserCancelled),
            result = work => result,
        }
    }
}
