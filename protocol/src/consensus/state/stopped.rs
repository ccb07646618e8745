use tracing::warn;

use super::{HandlerResult, Scope};

/// Terminal state. Ignores every seal and timer.
#[derive(Debug)]
pub struct StoppedHandler {
    reason: String,
}

impl StoppedHandler {
    pub fn new(reason: String) -> Self {
        Self { reason }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub(super) fn enter(&mut self, scope: &mut Scope<'_>) -> HandlerResult {
        warn!(node = %scope.ctx.node, reason = %self.reason, "consensus stopped");
        Ok(None)
    }
}
