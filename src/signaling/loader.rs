//! One-time signaling library loader
//!
//! Loading a backend can be expensive (TLS setup, codec registration), so the
//! application loads it once and hands the same instance to every stream
//! controller it builds.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

use super::library::SignalingLibrary;
use crate::error::Result;

#[derive(Default)]
pub struct SignalingLoader {
    library: OnceCell<Arc<dyn SignalingLibrary>>,
}

impl SignalingLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the loaded library, running `load` if nothing is loaded yet
    ///
    /// Concurrent callers wait for the same load. A failed load leaves the
    /// loader empty so a later call can try again.
    pub async fn ensure<F, Fut>(&self, load: F) -> Result<Arc<dyn SignalingLibrary>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn SignalingLibrary>>>,
    {
        let library = self
            .library
            .get_or_try_init(|| async {
                info!("Loading signaling library ...");
                load().await
            })
            .await?;
        Ok(library.clone())
    }

    pub fn get(&self) -> Option<Arc<dyn SignalingLibrary>> {
        self.library.get().cloned()
    }
}
