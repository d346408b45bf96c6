//! Runtime configuration for the relay.
//!
//! Every section has sensible defaults and a consuming `validate` that rejects
//! degenerate values up front instead of failing deep inside a session.

use std::time::Duration;

use crate::error::RelayError;

/// Expiry policy for persisted entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlConfig {
    /// How long an unresolved offset is retained.
    pub offset_ttl: Duration,
    /// How long unresolved error records are retained.
    pub error_ttl: Duration,
    /// How long a completeness marker is retained.
    pub marker_ttl: Duration,
    /// How long an offset lingers once its completeness marker was written.
    pub resolved_ttl: Duration,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            offset_ttl: Duration::from_secs(60 * 60),
            error_ttl: Duration::from_secs(60 * 60),
            marker_ttl: Duration::from_secs(15 * 60),
            resolved_ttl: Duration::from_secs(5 * 60),
        }
    }
}

impl TtlConfig {
    /// Reject zero TTLs.
    ///
    /// # Errors
    /// Returns an invalid-configuration error naming the offending field.
    pub fn validate(self) -> Result<Self, RelayError> {
        for (name, ttl) in [
            ("offset_ttl", self.offset_ttl),
            ("error_ttl", self.error_ttl),
            ("marker_ttl", self.marker_ttl),
            ("resolved_ttl", self.resolved_ttl),
        ] {
            if ttl.is_zero() {
                return Err(RelayError::invalid_config(format!("{name} must be non-zero")));
            }
        }
        Ok(self)
    }
}

/// What an offset lookup does when no offset has been published yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AbsentOffsetPolicy {
    /// Wait for the offset to be published, up to `offset_max_wait`.
    #[default]
    Wait,
    /// Start from the feed's tail as of the moment of the lookup.
    StartFromTail,
}

/// Rendezvous behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousConfig {
    /// Upper bound on how long a worker waits for a missing offset.
    pub offset_max_wait: Duration,
    /// What a worker does when no offset has been published.
    pub absent_offset: AbsentOffsetPolicy,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            offset_max_wait: Duration::from_secs(30),
            absent_offset: AbsentOffsetPolicy::Wait,
        }
    }
}

impl RendezvousConfig {
    /// Reject a zero wait under [`AbsentOffsetPolicy::Wait`].
    ///
    /// # Errors
    /// Returns an invalid-configuration error.
    pub fn validate(self) -> Result<Self, RelayError> {
        if self.absent_offset == AbsentOffsetPolicy::Wait && self.offset_max_wait.is_zero() {
            return Err(RelayError::invalid_config(
                "offset_max_wait must be non-zero when waiting for offsets",
            ));
        }
        Ok(self)
    }
}

/// Per-session limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Outbound frame buffer between the engine and the transport.
    pub outbound_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 64,
        }
    }
}

/// File audit sink settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditConfig {
    /// Max queued audit records before submissions are refused.
    pub queue_capacity: usize,
    /// Whether to fsync after every record.
    pub sync_on_write: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
            sync_on_write: false,
        }
    }
}

/// Aggregate configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayConfig {
    /// Store retention.
    pub ttl: TtlConfig,
    /// Offset and error rendezvous.
    pub rendezvous: RendezvousConfig,
    /// Per-session limits.
    pub session: SessionConfig,
    /// Audit sink tuning.
    pub audit: AuditConfig,
}

impl RelayConfig {
    /// Validate every section.
    ///
    /// # Errors
    /// Returns the first section's invalid-configuration error.
    pub fn validate(self) -> Result<Self, RelayError> {
        let ttl = self.ttl.validate()?;
        let rendezvous = self.rendezvous.validate()?;
        if self.session.outbound_capacity == 0 {
            return Err(RelayError::invalid_config("outbound_capacity must be at least 1"));
        }
        if self.audit.queue_capacity == 0 {
            return Err(RelayError::invalid_config("audit queue_capacity must be at least 1"));
        }
        // A pinned entry outlives its wait; the wait itself must fit inside the TTL.
        if rendezvous.absent_offset == AbsentOffsetPolicy::Wait
            && rendezvous.offset_max_wait > ttl.offset_ttl
        {
            return Err(RelayError::invalid_config(format!(
                "offset_max_wait ({}ms) exceeds offset_ttl ({}ms)",
                rendezvous.offset_max_wait.as_millis(),
                ttl.offset_ttl.as_millis()
            )));
        }
        Ok(Self {
            ttl,
            rendezvous,
            session: self.session,
            audit: self.audit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(RelayConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_ttl_rejected() {
        let cfg = RelayConfig {
            ttl: TtlConfig {
                marker_ttl: Duration::ZERO,
                ..TtlConfig::default()
            },
            ..RelayConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("marker_ttl"));
    }

    #[test]
    fn zero_wait_only_rejected_when_waiting() {
        let waiting = RendezvousConfig {
            offset_max_wait: Duration::ZERO,
            absent_offset: AbsentOffsetPolicy::Wait,
        };
        assert!(waiting.validate().is_err());

        let tail = RendezvousConfig {
            offset_max_wait: Duration::ZERO,
            absent_offset: AbsentOffsetPolicy::StartFromTail,
        };
        assert!(tail.validate().is_ok());
    }

    #[test]
    fn wait_longer_than_ttl_rejected() {
        let cfg = RelayConfig {
            ttl: TtlConfig {
                offset_ttl: Duration::from_secs(1),
                ..TtlConfig::default()
            },
            ..RelayConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
