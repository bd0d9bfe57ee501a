//! In-memory mock implementation of `ProxyController` for testing.
//!
//! Records every call together with the document contents it was given, and
//! can be told to fail either step or to stall in `restart` to widen race
//! windows.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use super::{ControllerError, ProxyController};

#[derive(Debug, Clone, PartialEq)]
pub enum ControllerCall {
    Validate(String), // document contents
    Restart(String),
}

#[derive(Debug, Default)]
struct Inner {
    calls: Vec<ControllerCall>,
    fail_validate: bool,
    fail_restart: bool,
    restart_delay: Option<Duration>,
}

#[derive(Default)]
pub struct MockController {
    inner: Mutex<Inner>,
}

impl MockController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_validate(self) -> Self {
        self.inner.lock().unwrap().fail_validate = true;
        self
    }

    pub fn fail_restart(self) -> Self {
        self.inner.lock().unwrap().fail_restart = true;
        self
    }

    pub fn with_restart_delay(self, delay: Duration) -> Self {
        self.inner.lock().unwrap().restart_delay = Some(delay);
        self
    }

    pub fn set_fail_restart(&self, fail: bool) {
        self.inner.lock().unwrap().fail_restart = fail;
    }

    pub fn calls(&self) -> Vec<ControllerCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn restart_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ControllerCall::Restart(_)))
            .count()
    }
}

#[async_trait]
impl ProxyController for MockController {
    async fn validate(&self, config: &Path) -> Result<(), ControllerError> {
        let contents = std::fs::read_to_string(config)?;
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(ControllerCall::Validate(contents));
        if inner.fail_validate {
            return Err(ControllerError::Invalid("mock validation failure".into()));
        }
        Ok(())
    }

    async fn restart(&self, config: &Path) -> Result<(), ControllerError> {
        let contents = std::fs::read_to_string(config)?;
        let delay = {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push(ControllerCall::Restart(contents));
            inner.restart_delay
        };
        // The stall applies to failing restarts too.
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.inner.lock().unwrap().fail_restart {
            return Err(ControllerError::Restart("mock restart failure".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_calls_with_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        std::fs::write(&path, "{}").unwrap();

        let ctl = MockController::new();
        ctl.validate(&path).await.unwrap();
        ctl.restart(&path).await.unwrap();

        assert_eq!(
            ctl.calls(),
            vec![
                ControllerCall::Validate("{}".into()),
                ControllerCall::Restart("{}".into())
            ]
        );
        assert_eq!(ctl.restart_count(), 1);
    }

    #[tokio::test]
    async fn failure_switches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        std::fs::write(&path, "{}").unwrap();

        let ctl = MockController::new().fail_validate().fail_restart();
        assert!(matches!(ctl.validate(&path).await, Err(ControllerError::Invalid(_))));
        assert!(matches!(ctl.restart(&path).await, Err(ControllerError::Restart(_))));

        ctl.set_fail_restart(false);
        assert!(ctl.restart(&path).await.is_ok());
    }
}
