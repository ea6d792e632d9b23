//! Worker loop errors, failure classification and retry delays.

use std::time::Duration;

use thiserror::Error;

/// Errors that end the worker loop.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The supervisor (container runtime, systemd) is expected to restart the
    /// process with a fresh state.
    #[error("{count} consecutive iterations failed, exiting for restart")]
    TooManyConsecutiveErrors { count: u32 },
}

/// Broad class of an iteration failure, used to decide whether to reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Statement or lock timeout (SQLSTATE 57014 / 55P03).
    Timeout,
    /// The database connection is gone or unusable.
    Connection,
    Other,
}

impl ErrorClass {
    pub fn of(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(db_err) = cause.downcast_ref::<sqlx::Error>() {
                if let Some(class) = Self::of_sqlx(db_err) {
                    return class;
                }
            }
        }

        Self::of_message(&format!("{:#}", err))
    }

    fn of_sqlx(err: &sqlx::Error) -> Option<Self> {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Some(ErrorClass::Connection),
            sqlx::Error::Database(db) => {
                let code = db.code()?;
                match code.as_ref() {
                    "57014" | "55P03" => Some(ErrorClass::Timeout),
                    // admin_shutdown, crash_shutdown, cannot_connect_now
                    "57P01" | "57P02" | "57P03" => Some(ErrorClass::Connection),
                    c if c.starts_with("08") => Some(ErrorClass::Connection),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    fn of_message(message: &str) -> Self {
        let message = message.to_ascii_lowercase();

        let timeout_markers = ["57014", "55p03", "statement timeout", "lock timeout"];
        if timeout_markers.iter().any(|m| message.contains(m)) {
            return ErrorClass::Timeout;
        }

        let connection_markers = ["connection", "server closed", "broken pipe", "gone away"];
        if connection_markers.iter().any(|m| message.contains(m)) {
            return ErrorClass::Connection;
        }

        ErrorClass::Other
    }

    pub fn needs_reconnect(&self) -> bool {
        !matches!(self, ErrorClass::Other)
    }
}

/// Exponential backoff: `min(cap, unit * 2^min(n, max_exponent))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub unit: Duration,
    pub max_exponent: u32,
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            unit: Duration::from_secs(1),
            max_exponent: 5,
            cap: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    pub fn delay(&self, consecutive_errors: u32) -> Duration {
        let factor = 1u32 << consecutive_errors.min(self.max_exponent).min(31);
        self.unit.saturating_mul(factor).min(self.cap)
    }
}
