use std::sync::Arc;
use std::time::Instant;

use crate::app_context::AppContext;
use crate::errors::AppResult;

#[derive(Clone)]
pub struct ServeState {
    ctx: Arc<AppContext>,
    started: Instant,
}

impl ServeState {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            ctx,
            started: Instant::now(),
        }
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Run `work` against the context on the blocking pool.
    pub async fn blocking<T, F>(&self, work: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&AppContext) -> AppResult<T> + Send + 'static,
    {
        let ctx = Arc::clone(&self.ctx);
        tokio::task::spawn_blocking(move || work(&ctx)).await?
    }
}
