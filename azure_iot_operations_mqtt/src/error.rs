// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Common error types

use std::fmt;

use thiserror::Error;

/// Error type for MQTT connection
pub type ConnectionError = rumqttc::v5::ConnectionError;
/// Error type for completion tokens
pub type CompletionError = rumqttc::NoticeError;
/// Error subtype for MQTT connection error caused by state
pub type StateError = rumqttc::v5::StateError;
/// Error type for low-level MQTT client operations (publish, subscribe, unsubscribe, disconnect, reauth)
pub type ClientError = rumqttc::v5::ClientError;

/// Error executing an MQTT ack
#[derive(Debug, Error, Clone)]
#[error("{kind}")]
pub struct AckError {
    kind: AckErrorKind,
}

impl AckError {
    /// Create a new [`AckError`]
    #[must_use]
    pub fn new(kind: AckErrorKind) -> Self {
        Self { kind }
    }

    /// Return the corresponding [`AckErrorKind`] for this error
    #[must_use]
    pub fn kind(&self) -> &AckErrorKind {
        &self.kind
    }
}

/// An enumeration of categories of [`AckError`]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AckErrorKind {
    /// Client is detached from connection/event loop. Cannot send requests.
    DetachedClient,
    /// The publish has already been sufficiently acknowledged
    AlreadyAcked,
}

impl fmt::Display for AckErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckErrorKind::DetachedClient => {
                write!(f, "client is detached from connection/event loop")
            }
            AckErrorKind::AlreadyAcked => write!(f, "publish already acknowledged"),
        }
    }
}

