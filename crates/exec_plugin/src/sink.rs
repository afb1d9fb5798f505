use async_trait::async_trait;

use crate::error::PluginError;
use crate::message::Progress;

/// Consumer of execution frames.
///
/// The host hands one to [`crate::client::PluginClient::execute`] to receive
/// the stream; plugin code receives a stream-backed one from the runtime and
/// writes into it. Implementations on the plugin side return the
/// already-surfaced error from `on_error` so the runtime knows the failure is
/// on the wire and suppresses its own EXECUTION_ERROR frame; host-side sinks
/// normally return `Ok(())` from all three.
#[async_trait]
pub trait OutputSink: Send {
    async fn on_output(&mut self, text: &str) -> Result<(), PluginError>;

    async fn on_progress(&mut self, progress: Progress) -> Result<(), PluginError>;

    async fn on_error(
        &mut self,
        code: &str,
        message: &str,
        details: &str,
    ) -> Result<(), PluginError>;
}
