use async_trait::async_trait;
use tabrelay_core::{Command, Reply, Result};

/// Send one command, get back its reply frame.
///
/// An error reply from the relay or the extension is still `Ok(Reply)`; only
/// a failure of the transport itself is `Err`. Callers decide what a reply
/// means with [`Reply::into_result`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(&self, command: Command) -> Result<Reply>;

    /// Make sure a request can be attempted, bootstrapping whatever is needed.
    async fn ensure_ready(&self) -> Result<()> {
        Ok(())
    }
}
