use tracing::info;

use crate::{catalog::TokenDefinition, state::session::Transaction};

/// External media subsystem notified about accepted scans.
///
/// Called after the session lock is released; implementations must not block.
pub trait ContentTrigger: Send + Sync {
    /// React to an accepted transaction for a known token.
    fn on_accepted(&self, transaction: &Transaction, token: &TokenDefinition);
}

/// Default trigger that records which video would be queued.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingContentTrigger;

impl ContentTrigger for LoggingContentTrigger {
    fn on_accepted(&self, transaction: &Transaction, token: &TokenDefinition) {
        if let Some(video) = token.video.as_deref() {
            info!(
                token_id = %transaction.token_id,
                device_id = %transaction.device_id,
                device_type = %transaction.device_type,
                video,
                "content trigger: video queued"
            );
        }
    }
}
