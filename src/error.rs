use chrono::{DateTime, Utc};

/// Failure delivering to one destination. Every variant is transient from the
/// pipeline's point of view and ends up in the retry queue.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("rate limited by destination, retry after {retry_after:.1}s")]
    RateLimited { retry_after: f64, until: DateTime<Utc> },

    #[error("address is rate limited until {until}")]
    RateLimitActive { until: DateTime<Utc> },

    #[error("destination responded {status}: {body}")]
    Status { status: u16, body: String },

    #[error("destination rejected request: {0}")]
    Api(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeliveryError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(
            self,
            DeliveryError::RateLimited { .. } | DeliveryError::RateLimitActive { .. }
        )
    }

    /// When the destination will accept requests again, if known.
    pub fn retry_at(&self) -> Option<DateTime<Utc>> {
        match self {
            DeliveryError::RateLimited { until, .. } | DeliveryError::RateLimitActive { until } => {
                Some(*until)
            }
            _ => None,
        }
    }
}
