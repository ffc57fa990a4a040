//! HTTP proxy with recording and replay

use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::Response;
use tracing::debug;

use crate::config::{Config, Mode};
use crate::fingerprint::InboundRequest;
use crate::recording::RecordingEngine;
use crate::replay::{render_response, ReplayEngine};
use crate::{Result, TapedeckError};

enum Engine {
    Record(Arc<RecordingEngine>),
    Replay(ReplayEngine),
}

/// Fixture-backed proxy: records in record mode, replays in replay mode
pub struct FixtureProxy {
    engine: Engine,
}

impl FixtureProxy {
    /// Create a new proxy for the configured mode
    ///
    /// # Errors
    ///
    /// Returns error if the recording engine cannot be built
    pub fn new(config: &Config) -> Result<Self> {
        let engine = match config.mode() {
            Mode::Record => Engine::Record(Arc::new(RecordingEngine::new(config)?)),
            Mode::Replay => Engine::Replay(ReplayEngine::new(config)),
        };

        Ok(Self { engine })
    }

    /// Mode the proxy runs in
    #[must_use]
    pub fn mode(&self) -> Mode {
        match self.engine {
            Engine::Record(_) => Mode::Record,
            Engine::Replay(_) => Mode::Replay,
        }
    }

    /// Handle a buffered inbound request
    ///
    /// In record mode the upstream exchange and fixture write run on their
    /// own task; a client that goes away mid-request does not cancel them.
    ///
    /// # Errors
    ///
    /// Returns [`TapedeckError::FixtureNotFound`] on a replay miss, or the
    /// recording/replay failure
    pub async fn handle(&self, request: InboundRequest) -> Result<Response<Full<Bytes>>> {
        match &self.engine {
            Engine::Record(engine) => {
                debug!("Record mode: {} {}", request.method, request.target);

                let engine = Arc::clone(engine);
                let recording = tokio::spawn(async move { engine.record(&request).await })
                    .await
                    .map_err(|e| TapedeckError::Other(format!("Recording task failed: {e}")))??;

                render_response(&recording.response)
            }
            Engine::Replay(engine) => {
                debug!("Replay mode: {} {}", request.method, request.target);

                let response = engine.replay(&request).await?;
                render_response(&response)
            }
        }
    }
}
