//! Scripted adapter for tests
//!
//! Responses are queued ahead of time; every execution is recorded so
//! tests can assert on what was dispatched. With an empty queue the mock
//! echoes a successful empty result.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::{Adapter, Capabilities};
use crate::command::{AdapterKind, Command};
use crate::error::{Error, Result};
use crate::exec::ExecutionResult;

type ErrorFactory = Box<dyn Fn() -> Error + Send + Sync>;

enum MockResponse {
    Success(ExecutionResult),
    Failure(ErrorFactory),
}

/// One recorded dispatch.
#[derive(Debug, Clone)]
pub struct MockInvocation {
    pub command: String,
    pub target: String,
    pub stdin: Option<Vec<u8>>,
}

/// Adapter that replays scripted responses.
#[derive(Default)]
pub struct MockAdapter {
    responses: Mutex<VecDeque<MockResponse>>,
    invocations: Arc<Mutex<Vec<MockInvocation>>>,
    /// Artificial latency per execution, for cancellation and
    /// single-flight tests.
    delay: Mutex<Option<Duration>>,
    unavailable: Mutex<bool>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a canned success.
    pub fn push_result(&self, result: ExecutionResult) {
        self.responses.lock().push_back(MockResponse::Success(result));
    }

    /// Queue a success with the given stdout and exit code.
    pub fn push_output(&self, stdout: impl AsRef<[u8]>, exit_code: i32) {
        let mut result = ExecutionResult::new("mock", AdapterKind::Mock);
        result.stdout = stdout.as_ref().to_vec();
        result.exit_code = exit_code;
        self.push_result(result);
    }

    /// Queue a transport-style failure.
    pub fn push_error<F>(&self, factory: F)
    where
        F: Fn() -> Error + Send + Sync + 'static,
    {
        self.responses
            .lock()
            .push_back(MockResponse::Failure(Box::new(factory)));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn set_unavailable(&self) {
        *self.unavailable.lock() = true;
    }

    /// Everything executed so far, in dispatch order.
    pub fn invocations(&self) -> Vec<MockInvocation> {
        self.invocations.lock().clone()
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().len()
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Mock
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            streaming: true,
            tty: true,
            transfer: true,
            tunnel: true,
            port_forward: true,
            health: true,
        }
    }

    async fn execute(&self, cmd: Command) -> Result<ExecutionResult> {
        let stdin = match &cmd.stdin {
            crate::command::StdinSource::Bytes(bytes) => Some(bytes.to_vec()),
            _ => None,
        };
        self.invocations.lock().push(MockInvocation {
            command: cmd.display_string(),
            target: cmd.target.identity(),
            stdin,
        });

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            let cancel = cmd.cancel_token();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled {
                        command: cmd.display_string(),
                        partial: None,
                    });
                }
            }
        }

        let response = self.responses.lock().pop_front();
        match response {
            Some(MockResponse::Success(mut result)) => {
                let now = Utc::now();
                result.command = cmd.display_string();
                result.finished_at = now;
                Ok(result)
            }
            Some(MockResponse::Failure(factory)) => Err(factory()),
            None => {
                let mut result = ExecutionResult::new(cmd.display_string(), AdapterKind::Mock);
                result.finished_at = Utc::now();
                Ok(result)
            }
        }
    }

    async fn is_available(&self) -> bool {
        !*self.unavailable.lock()
    }

    async fn dispose(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_replays_in_order() {
        let mock = MockAdapter::new();
        mock.push_output("first", 0);
        mock.push_output("second", 3);

        let one = mock.execute(Command::new("a")).await.unwrap();
        assert_eq!(one.stdout, b"first");
        assert!(one.ok());

        let two = mock.execute(Command::new("b")).await.unwrap();
        assert_eq!(two.stdout, b"second");
        assert_eq!(two.exit_code, 3);

        assert_eq!(mock.invocation_count(), 2);
        assert_eq!(mock.invocations()[0].command, "a");
    }

    #[tokio::test]
    async fn test_mock_error_factory() {
        let mock = MockAdapter::new();
        mock.push_error(|| Error::Connection {
            host: "h".into(),
            message: "down".into(),
        });

        let result = mock.execute(Command::new("x")).await;
        assert!(matches!(result, Err(Error::Connection { .. })));
    }

    #[tokio::test]
    async fn test_mock_empty_queue_defaults_success() {
        let mock = MockAdapter::new();
        let result = mock.execute(Command::new("anything")).await.unwrap();
        assert!(result.ok());
        assert!(result.stdout.is_empty());
    }

    #[tokio::test]
    async fn test_mock_cancellation_during_delay() {
        use tokio_util::sync::CancellationToken;

        let mock = MockAdapter::new();
        mock.set_delay(Duration::from_secs(10));

        let token = CancellationToken::new();
        let cmd = Command::new("slow").cancel(token.clone());

        let handle = tokio::spawn(async move { mock.execute(cmd).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled { .. })));
    }
}
