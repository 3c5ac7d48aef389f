//! Record validation for DHT writes.
//!
//! Keys have the shape `/<namespace>/<rest>`. A [`NamespacedValidator`]
//! routes each record to the validator registered for its namespace and
//! rejects namespaces nobody registered.

use libp2p::kad;
use libp2p::PeerId;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Namespace used by OrcaNet records.
pub const ORCANET_NAMESPACE: &str = "orcanet";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("record key is not valid utf-8")]
    KeyNotUtf8,
    #[error("record key `{0}` is not of the form /<namespace>/<key>")]
    NotNamespaced(String),
    #[error("no validator registered for namespace `{0}`")]
    UnknownNamespace(String),
    #[error("record key is empty after the namespace")]
    EmptyKey,
    #[error("record value is empty")]
    EmptyValue,
    #[error("record key `{0}` does not name a peer")]
    KeyNotAPeer(String),
    #[error("record published by {actual:?}, key names {expected}")]
    PublisherMismatch {
        expected: PeerId,
        actual: Option<PeerId>,
    },
}

/// Policy applied to records of one namespace.
pub trait RecordValidator: Send + Sync {
    /// `key` is the part after `/<namespace>/`.
    fn validate(&self, key: &str, record: &kad::Record) -> Result<(), ValidationError>;
}

/// Accepts any well-formed record.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptWellFormed;

impl RecordValidator for AcceptWellFormed {
    fn validate(&self, key: &str, record: &kad::Record) -> Result<(), ValidationError> {
        if key.is_empty() {
            return Err(ValidationError::EmptyKey);
        }
        if record.value.is_empty() {
            return Err(ValidationError::EmptyValue);
        }
        Ok(())
    }
}

/// Only the peer named by the key may publish under it: `/<ns>/<peer-id>[/...]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignedRecordValidator;

impl RecordValidator for SignedRecordValidator {
    fn validate(&self, key: &str, record: &kad::Record) -> Result<(), ValidationError> {
        AcceptWellFormed.validate(key, record)?;

        let owner = key.split('/').next().unwrap_or_default();
        let expected: PeerId = owner
            .parse()
            .map_err(|_| ValidationError::KeyNotAPeer(key.to_string()))?;

        if record.publisher != Some(expected) {
            return Err(ValidationError::PublisherMismatch {
                expected,
                actual: record.publisher,
            });
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct NamespacedValidator {
    validators: HashMap<String, Arc<dyn RecordValidator>>,
}

impl NamespacedValidator {
    /// No namespaces; every record is rejected.
    pub fn empty() -> Self {
        Self::default()
    }

    /// `orcanet` namespace with [`AcceptWellFormed`].
    pub fn orcanet() -> Self {
        Self::empty().with_namespace(ORCANET_NAMESPACE, AcceptWellFormed)
    }

    pub fn with_namespace(
        mut self,
        namespace: impl Into<String>,
        validator: impl RecordValidator + 'static,
    ) -> Self {
        self.validators
            .insert(namespace.into(), Arc::new(validator));
        self
    }

    pub fn validate(&self, record: &kad::Record) -> Result<(), ValidationError> {
        let raw = std::str::from_utf8(record.key.as_ref())
            .map_err(|_| ValidationError::KeyNotUtf8)?;
        let (namespace, rest) = split_key(raw)?;
        let validator = self
            .validators
            .get(namespace)
            .ok_or_else(|| ValidationError::UnknownNamespace(namespace.to_string()))?;
        validator.validate(rest, record)
    }
}

impl std::fmt::Debug for NamespacedValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespacedValidator")
            .field("namespaces", &self.validators.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn split_key(raw: &str) -> Result<(&str, &str), ValidationError> {
    let stripped = raw
        .strip_prefix('/')
        .ok_or_else(|| ValidationError::NotNamespaced(raw.to_string()))?;
    match stripped.split_once('/') {
        Some((namespace, rest)) if !namespace.is_empty() => Ok((namespace, rest)),
        _ => Err(ValidationError::NotNamespaced(raw.to_string())),
    }
}

/// `/<namespace>/<key>` as a DHT record key.
pub fn namespaced_key(namespace: &str, key: &str) -> kad::RecordKey {
    kad::RecordKey::new(&format!("/{namespace}/{key}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, value: &[u8]) -> kad::Record {
        kad::Record::new(kad::RecordKey::new(&key), value.to_vec())
    }

    #[test]
    fn orcanet_namespace_accepts_well_formed_records() {
        let validator = NamespacedValidator::orcanet();
        assert!(validator.validate(&record("/orcanet/some-key", b"v")).is_ok());
        assert!(validator.validate(&record("/orcanet/a/b/c", b"v")).is_ok());
    }

    #[test]
    fn empty_parts_are_rejected() {
        let validator = NamespacedValidator::orcanet();
        assert_eq!(
            validator.validate(&record("/orcanet/", b"v")),
            Err(ValidationError::EmptyKey)
        );
        assert_eq!(
            validator.validate(&record("/orcanet/key", b"")),
            Err(ValidationError::EmptyValue)
        );
    }

    #[test]
    fn unknown_and_missing_namespaces_are_rejected() {
        let validator = NamespacedValidator::orcanet();
        assert_eq!(
            validator.validate(&record("/pk/abc", b"v")),
            Err(ValidationError::UnknownNamespace("pk".into()))
        );
        assert!(matches!(
            validator.validate(&record("orcanet/abc", b"v")),
            Err(ValidationError::NotNamespaced(_))
        ));
        assert!(matches!(
            validator.validate(&record("/orcanet", b"v")),
            Err(ValidationError::NotNamespaced(_))
        ));
        assert!(NamespacedValidator::empty()
            .validate(&record("/orcanet/abc", b"v"))
            .is_err());
    }

    #[test]
    fn signed_validator_requires_matching_publisher() {
        let owner = PeerId::random();
        let validator = NamespacedValidator::empty().with_namespace("proxy", SignedRecordValidator);
        let key = format!("/proxy/{owner}");

        let mut signed = record(&key, b"addr");
        signed.publisher = Some(owner);
        assert!(validator.validate(&signed).is_ok());

        let mut forged = record(&key, b"addr");
        forged.publisher = Some(PeerId::random());
        assert!(matches!(
            validator.validate(&forged),
            Err(ValidationError::PublisherMismatch { .. })
        ));

        assert!(matches!(
            validator.validate(&record("/proxy/not-a-peer", b"addr")),
            Err(ValidationError::KeyNotAPeer(_))
        ));
    }

    #[test]
    fn namespaced_key_builds_the_expected_bytes() {
        let key = namespaced_key(ORCANET_NAMESPACE, "x");
        assert_eq!(key.as_ref(), b"/orcanet/x");
    }
}
