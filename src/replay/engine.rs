//! Replay engine for serving recorded responses

use tracing::{debug, warn};

use crate::config::Config;
use crate::fingerprint::InboundRequest;
use crate::snapshot::RecordedResponse;
use crate::storage::FixtureStore;
use crate::{Result, TapedeckError};

/// Replay engine for serving recorded responses
///
/// Fixtures are read from disk on every request, so edits made while the
/// proxy runs are picked up immediately. Replay never writes.
pub struct ReplayEngine {
    store: FixtureStore,
    host: String,
}

impl ReplayEngine {
    /// Create a new replay engine
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            store: FixtureStore::new(config.out.clone()),
            host: config.mock.host.clone(),
        }
    }

    /// Look up the recorded response for `request`
    ///
    /// # Errors
    ///
    /// Returns [`TapedeckError::FixtureNotFound`] if there is no fixture file
    /// or no snapshot in it matches, and [`TapedeckError::Parse`] if the
    /// fixture cannot be read
    pub async fn replay(&self, request: &InboundRequest) -> Result<RecordedResponse> {
        let pathname = request.pathname();
        let path = self.store.fixture_path(&self.host, pathname);

        let Some(collection) = self.store.load(&self.host, pathname).await? else {
            warn!("No fixture for {} {}", request.method, request.target);
            return Err(TapedeckError::FixtureNotFound(path));
        };

        let fingerprint = request.fingerprint();
        let Some(snapshot) = collection.find(&fingerprint) else {
            warn!(
                "No snapshot for {} {} in {}",
                request.method,
                request.target,
                path.display()
            );
            return Err(TapedeckError::FixtureNotFound(path));
        };

        debug!(
            "Replaying {} {} -> {}",
            request.method, request.target, snapshot.status_code
        );

        Ok(snapshot.clone().into_response())
    }
}
