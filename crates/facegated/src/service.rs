use crate::attempts::{attempt_prefix, AttemptLog, DEFAULT_PREFIX};
use crate::notify::{AccessEvent, Notifier};
use facegate_core::extractor::ExtractError;
use facegate_core::{
    decide, Decision, EmbeddingExtractor, IdentityStore, MatchConfig, Reason, ReferenceImage,
    RegistryError,
};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("request body is not a decodable image")]
    InvalidImage(#[source] ExtractError),
    #[error("no face detected in reference image")]
    NoFaceDetected,
    #[error("invalid identity name {0:?}")]
    InvalidName(String),
    #[error("unknown identity {0:?}")]
    NotFound(String),
    #[error("registry error: {0}")]
    Registry(RegistryError),
    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<RegistryError> for ServiceError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NoFaceDetected => ServiceError::NoFaceDetected,
            RegistryError::InvalidName(name) => ServiceError::InvalidName(name),
            RegistryError::NotFound(name) => ServiceError::NotFound(name),
            other => ServiceError::Registry(other),
        }
    }
}

/// Recognition and enrollment flows shared by every HTTP handler.
pub struct AccessService {
    store: Arc<IdentityStore>,
    extractor: Arc<EmbeddingExtractor>,
    attempts: Arc<AttemptLog>,
    notifier: Arc<dyn Notifier>,
    matching: MatchConfig,
}

impl AccessService {
    pub fn new(
        store: Arc<IdentityStore>,
        extractor: Arc<EmbeddingExtractor>,
        attempts: AttemptLog,
        notifier: Arc<dyn Notifier>,
        matching: MatchConfig,
    ) -> Self {
        Self {
            store,
            extractor,
            attempts: Arc::new(attempts),
            notifier,
            matching,
        }
    }

    pub fn matching(&self) -> &MatchConfig {
        &self.matching
    }

    /// Decide whether the face in `bytes` belongs to an enrolled identity.
    ///
    /// The registry snapshot is taken before any work so the whole request
    /// sees one consistent generation even if a registration lands meanwhile.
    ///
    /// `action` is free text: it is echoed in logs and notifications, and
    /// names the attempt file only when it is a safe file-name prefix.
    pub async fn recognize(
        &self,
        bytes: Vec<u8>,
        action: Option<String>,
    ) -> Result<Decision, ServiceError> {
        let snapshot = self.store.snapshot();
        let bytes = Arc::new(bytes);

        let attempts = Arc::clone(&self.attempts);
        let logged = Arc::clone(&bytes);
        let prefix = attempt_prefix(action.as_deref()).to_string();
        if action.is_some() && prefix == DEFAULT_PREFIX {
            tracing::debug!(action = ?action, "action tag not usable as file prefix");
        }
        let persisted =
            tokio::task::spawn_blocking(move || attempts.persist(&logged, &prefix)).await?;
        if let Err(e) = persisted {
            tracing::warn!(error = %e, "failed to persist recognition attempt");
        }

        let extractor = Arc::clone(&self.extractor);
        let embedding = tokio::task::spawn_blocking(move || extractor.extract_bytes(&bytes))
            .await?
            .map_err(ServiceError::InvalidImage)?;

        let Some(embedding) = embedding else {
            tracing::info!(action = ?action, "recognition: no face detected");
            self.notifier.notify(&AccessEvent::NoFace { action });
            return Ok(Decision::denied(Reason::NoFace, None));
        };

        let decision = decide(&embedding, &snapshot, &self.matching);
        let score = decision.score.map(|s| s.value());
        match (&decision.name, decision.reason) {
            (Some(name), _) => {
                tracing::info!(name = %name, score = ?score, action = ?action, "access granted");
                self.notifier.notify(&AccessEvent::Authorized {
                    name: name.clone(),
                    score: score.unwrap_or_default(),
                    action,
                });
            }
            (None, Some(Reason::NoKnownFaces)) => {
                tracing::info!(action = ?action, "access denied: no known faces");
            }
            (None, _) => {
                tracing::info!(score = ?score, action = ?action, "access denied");
                self.notifier.notify(&AccessEvent::Denied { score, action });
            }
        }
        Ok(decision)
    }

    /// Enroll `bytes` under `name`; returns the sanitized name.
    pub async fn register(&self, name: String, bytes: Vec<u8>) -> Result<String, ServiceError> {
        let store = Arc::clone(&self.store);
        let name = tokio::task::spawn_blocking(move || store.register(&name, &bytes)).await??;
        self.notifier.notify(&AccessEvent::Registered { name: name.clone() });
        Ok(name)
    }

    /// Names in the current snapshot, in load order.
    pub fn known(&self) -> Vec<String> {
        self.store.snapshot().names().map(str::to_string).collect()
    }

    pub async fn reference_image(&self, name: String) -> Result<ReferenceImage, ServiceError> {
        let store = Arc::clone(&self.store);
        Ok(tokio::task::spawn_blocking(move || store.reference_image(&name)).await??)
    }
}
