//! TimeoutGateway - すべての runtime 呼び出しにタイムアウトを課すデコレータ
//!
//! タイムアウトした呼び出しは `RuntimeError::Timeout` になり、呼び出し側は
//! 永続状態を変更せずにエラーを返す（fail closed）。

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::ports::{RunOutcome, RunSpec, RuntimeError, RuntimeGateway, RuntimeState};

pub struct TimeoutGateway<G> {
    inner: G,
    timeout: Duration,
}

impl<G: RuntimeGateway> TimeoutGateway<G> {
    pub fn new(inner: G, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, RuntimeError>>,
    ) -> Result<T, RuntimeError> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| RuntimeError::Timeout(self.timeout))?
    }
}

#[async_trait]
impl<G: RuntimeGateway> RuntimeGateway for TimeoutGateway<G> {
    async fn run(&self, spec: &RunSpec) -> Result<RunOutcome, RuntimeError> {
        self.bounded(self.inner.run(spec)).await
    }

    async fn stop(&self, runtime_id: &str) -> Result<(), RuntimeError> {
        self.bounded(self.inner.stop(runtime_id)).await
    }

    async fn start(&self, runtime_id: &str) -> Result<Option<u16>, RuntimeError> {
        self.bounded(self.inner.start(runtime_id)).await
    }

    async fn remove(&self, runtime_id: &str) -> Result<(), RuntimeError> {
        self.bounded(self.inner.remove(runtime_id)).await
    }

    async fn exists(&self, runtime_id: &str) -> Result<bool, RuntimeError> {
        self.bounded(self.inner.exists(runtime_id)).await
    }

    async fn logs(&self, runtime_id: &str, tail: usize) -> Result<String, RuntimeError> {
        self.bounded(self.inner.logs(runtime_id, tail)).await
    }

    async fn status(&self, runtime_id: &str) -> Result<Option<RuntimeState>, RuntimeError> {
        self.bounded(self.inner.status(runtime_id)).await
    }

    async fn exposed_port(
        &self,
        runtime_id: &str,
        internal_port: u16,
    ) -> Result<Option<u16>, RuntimeError> {
        self.bounded(self.inner.exposed_port(runtime_id, internal_port))
            .await
    }

    async fn load_image(&self, path: &str) -> Result<String, RuntimeError> {
        self.bounded(self.inner.load_image(path)).await
    }

    async fn remove_image(&self, runtime_image_id: &str) -> Result<(), RuntimeError> {
        self.bounded(self.inner.remove_image(runtime_image_id)).await
    }

    async fn image_exists(&self, runtime_image_id: &str) -> Result<bool, RuntimeError> {
        self.bounded(self.inner.image_exists(runtime_image_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryRuntime;

    #[tokio::test]
    async fn slow_call_times_out() {
        let rt = InMemoryRuntime::new();
        rt.set_load_delay(Duration::from_millis(500));
        let gw = TimeoutGateway::new(rt, Duration::from_millis(50));

        let err = gw.load_image("/tmp/web.tar").await.unwrap_err();

        assert_eq!(err, RuntimeError::Timeout(Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn fast_call_passes_through() {
        let gw = TimeoutGateway::new(InMemoryRuntime::new(), Duration::from_secs(1));

        let id = gw.load_image("/tmp/web.tar").await.unwrap();

        assert!(gw.image_exists(&id).await.unwrap());
        assert_eq!(gw.inner().load_calls(), 1);
    }

    #[tokio::test]
    async fn inner_errors_are_preserved() {
        let gw = TimeoutGateway::new(InMemoryRuntime::new(), Duration::from_secs(1));

        let err = gw.stop("missing").await.unwrap_err();

        assert!(err.is_not_found());
    }
}
