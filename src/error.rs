// This file is part of CATENA.
//
// Copyright (C) 2022 Affidaty Spa.
//
// CATENA is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// CATENA is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with CATENA. If not, see <https://www.gnu.org/licenses/>.

//! Library error codes and results.

use serde::{de::Visitor, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};

/// Project-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Max string length when the error is converted to string using `to_string_full`.
const MAX_ERROR_SOURCE_STRING_LENGTH: usize = 128;

/// Error kind to better contextualize the returned error.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorKind {
    MalformedData,
    InvalidSignature,
    PayloadMismatch,
    SlotMismatch,
    StateConflict,
    TransactionVerify,
    DuplicatedUnconfirmedTx,
    DuplicatedConfirmedTx,
    DatabaseFault,
    PeerFault,
    ResourceNotFound,
    Other,
}

/// Error kind strings.
pub(super) mod error_kind_str {
    pub const MALFORMED_DATA: &str = "malformed data";
    pub const INVALID_SIGNATURE: &str = "invalid signature";
    pub const PAYLOAD_MISMATCH: &str = "payload mismatch";
    pub const SLOT_MISMATCH: &str = "slot mismatch";
    pub const STATE_CONFLICT: &str = "state conflict";
    pub const TRANSACTION_VERIFY: &str = "transaction verify failure";
    pub const DUPLICATED_UNCONFIRMED_TX: &str = "duplicated unconfirmed transaction";
    pub const DUPLICATED_CONFIRMED_TX: &str = "duplicated confirmed transaction";
    pub const DATABASE_FAULT: &str = "database fault";
    pub const PEER_FAULT: &str = "peer fault";
    pub const RESOURCE_NOT_FOUND: &str = "resource not found";
    pub const OTHER: &str = "other";
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        use ErrorKind::*;
        let kind_str = match self {
            MalformedData => error_kind_str::MALFORMED_DATA,
            InvalidSignature => error_kind_str::INVALID_SIGNATURE,
            PayloadMismatch => error_kind_str::PAYLOAD_MISMATCH,
            SlotMismatch => error_kind_str::SLOT_MISMATCH,
            StateConflict => error_kind_str::STATE_CONFLICT,
            TransactionVerify => error_kind_str::TRANSACTION_VERIFY,
            DuplicatedUnconfirmedTx => error_kind_str::DUPLICATED_UNCONFIRMED_TX,
            DuplicatedConfirmedTx => error_kind_str::DUPLICATED_CONFIRMED_TX,
            DatabaseFault => error_kind_str::DATABASE_FAULT,
            PeerFault => error_kind_str::PEER_FAULT,
            ResourceNotFound => error_kind_str::RESOURCE_NOT_FOUND,
            Other => error_kind_str::OTHER,
        };
        write!(f, "{}", kind_str)
    }
}

impl Serialize for ErrorKind {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let msg = self.to_string();
        serializer.serialize_str(&msg)
    }
}

impl<'de> Deserialize<'de> for ErrorKind {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ErrorKindVisitor;

        impl<'de> Visitor<'de> for ErrorKindVisitor {
            type Value = String;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a string")
            }

            fn visit_str<R>(self, value: &str) -> std::result::Result<String, R> {
                Ok(value.to_string())
            }
        }

        let kind = match deserializer.deserialize_str(ErrorKindVisitor)?.as_str() {
            error_kind_str::MALFORMED_DATA => ErrorKind::MalformedData,
            error_kind_str::INVALID_SIGNATURE => ErrorKind::InvalidSignature,
            error_kind_str::PAYLOAD_MISMATCH => ErrorKind::PayloadMismatch,
            error_kind_str::SLOT_MISMATCH => ErrorKind::SlotMismatch,
            error_kind_str::STATE_CONFLICT => ErrorKind::StateConflict,
            error_kind_str::TRANSACTION_VERIFY => ErrorKind::TransactionVerify,
            error_kind_str::DUPLICATED_UNCONFIRMED_TX => ErrorKind::DuplicatedUnconfirmedTx,
            error_kind_str::DUPLICATED_CONFIRMED_TX => ErrorKind::DuplicatedConfirmedTx,
            error_kind_str::DATABASE_FAULT => ErrorKind::DatabaseFault,
            error_kind_str::PEER_FAULT => ErrorKind::PeerFault,
            error_kind_str::RESOURCE_NOT_FOUND => ErrorKind::ResourceNotFound,
            _ => ErrorKind::Other,
        };
        Ok(kind)
    }
}

/// Project-wide error type.
/// Contains a kind enumerate and a `source` to identify the subsystem that may
/// have propagated the error.
#[derive(Debug, Serialize, Deserialize)]
pub struct Error {
    /// Error kind.
    pub kind: ErrorKind,
    /// Not propagated by blockchain messages.
    #[serde(serialize_with = "source_se", deserialize_with = "source_de")]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

fn source_se<S: Serializer>(
    source: &Option<Box<dyn std::error::Error + Send + Sync>>,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    match source {
        Some(b) => s.serialize_str(&b.to_string()),
        None => s.serialize_unit(),
    }
}

fn source_de<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<Box<dyn std::error::Error + Send + Sync>>, D::Error> {
    struct ErrorVisitor;

    impl<'de> Visitor<'de> for ErrorVisitor {
        type Value = String;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string")
        }

        fn visit_str<R>(self, value: &str) -> std::result::Result<String, R> {
            Ok(value.to_string())
        }
    }

    match d.deserialize_str(ErrorVisitor) {
        Ok(s) => Ok(Some(s.into())),
        Err(_err) => Ok(None),
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        Error {
            kind: self.kind,
            source: None,
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::new_ext(ErrorKind::Other, s)
    }
}

impl<T> From<ErrorKind> for Result<T> {
    fn from(kind: ErrorKind) -> Self {
        Err(kind.into())
    }
}

impl Error {
    pub fn new_ext<E>(kind: ErrorKind, error: E) -> Error
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let source = error.into();
        Error {
            kind,
            source: Some(source),
        }
    }

    pub fn new(kind: ErrorKind) -> Error {
        Error { kind, source: None }
    }

    pub fn to_string_full(&self) -> String {
        let mut err_string = self.to_string();
        if let Some(ref source) = self.source {
            let detail = format!(": {}", source);
            let max_len = std::cmp::min(detail.len(), MAX_ERROR_SOURCE_STRING_LENGTH);
            err_string.push_str(&detail[..max_len]);
        }
        err_string
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Error) -> bool {
        if self.kind != other.kind {
            return false;
        }
        if self.source.is_none() && other.source.is_none() {
            true
        } else if self.source.is_some() && other.source.is_some() {
            format!("{:?}", self.source) == format!("{:?}", other.source)
        } else {
            false
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self.source {
            None => None,
            Some(ref source) => Some(source.as_ref()),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &format!("{}", self.kind))
    }
}

/// Response envelope used by operations that accumulate failures instead of
/// short-circuiting on the first one (block verification, RPC-facing
/// handlers). Carries either a payload or the collected error strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEntity<T> {
    /// Payload, present on success.
    pub data: Option<T>,
    /// Accumulated failure descriptions, most recent first.
    pub errors: Vec<String>,
}

impl<T> ResponseEntity<T> {
    pub fn ok(data: T) -> Self {
        ResponseEntity {
            data: Some(data),
            errors: Vec::new(),
        }
    }

    pub fn fail(errors: Vec<String>) -> Self {
        ResponseEntity { data: None, errors }
    }

    pub fn fail_one(error: impl Into<String>) -> Self {
        ResponseEntity {
            data: None,
            errors: vec![error.into()],
        }
    }

    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Extract the payload or collapse the accumulated errors into one.
    pub fn into_result(self) -> Result<T> {
        match self.data {
            Some(data) if self.errors.is_empty() => Ok(data),
            _ => Err(Error::new_ext(ErrorKind::Other, self.errors.join("; "))),
        }
    }
}
