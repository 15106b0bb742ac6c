//! Strongly-typed identifiers used across the gateway.
//!
//! Two families: uuid-backed ids for rows the gateway owns relationally
//! (tenants, credentials), and opaque string ids for values that cross the
//! API boundary (jobs, webhook events), where callers must never parse
//! structure out of the value.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Declares a uuid-backed id: the newtype itself plus construction,
/// display, conversion, and parsing. Fresh ids are UUIDv7 so index order
/// follows creation order; tests that need determinism pass ids in
/// explicitly via `from_uuid`.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Mint a fresh, time-ordered identifier.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Borrow the raw uuid (query binds).
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$name> for Uuid {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl FromStr for $name {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::from_str(s).map(Self).map_err(|e| {
                    DomainError::invalid_id(format!("{}: {e}", stringify!($name)))
                })
            }
        }
    };
}

uuid_id!(
    /// Identifier of a tenant (multi-tenant boundary).
    TenantId
);

uuid_id!(
    /// Identifier of a provider credential in the pool.
    CredentialId
);

/// Opaque job identifier exposed to tenants (`job_<uuidv7>`).
///
/// String-backed so the wire format stays opaque; callers never parse
/// structure out of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

/// Unique webhook event identifier (`evt_<uuid>`), fresh per enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

macro_rules! impl_opaque_id {
    ($t:ty, $prefix:literal) => {
        impl $t {
            pub fn new() -> Self {
                Self(format!(concat!($prefix, "_{}"), Uuid::now_v7().simple()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $t {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.is_empty() {
                    return Err(DomainError::invalid_id(concat!($prefix, ": empty")));
                }
                Ok(Self(s.to_string()))
            }
        }
    };
}

impl_opaque_id!(JobId, "job");
impl_opaque_id!(EventId, "evt");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_are_prefixed_and_unique() {
        let a = JobId::new();
        let b = JobId::new();
        assert!(a.as_str().starts_with("job_"));
        assert_ne!(a, b);
    }

    #[test]
    fn tenant_id_round_trips_through_string() {
        let id = TenantId::new();
        let parsed: TenantId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn uuid_id_parse_errors_name_the_type() {
        let err = "not-a-uuid".parse::<CredentialId>().unwrap_err();
        assert!(err.to_string().contains("CredentialId"));
    }

    #[test]
    fn empty_job_id_is_rejected() {
        assert!("".parse::<JobId>().is_err());
    }
}
