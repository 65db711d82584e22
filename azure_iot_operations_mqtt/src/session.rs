// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! MQTT client providing a managed connection with automatic reconnection across a single MQTT session.

mod managed_client;
pub mod reconnect_policy;
pub mod receiver;
mod session;
mod state;

use thiserror::Error;

use crate::connection_settings::MqttConnectionSettings;
use crate::error::{ClientError, ConnectionError};
use crate::rumqttc_adapter as adapter;
use crate::session::reconnect_policy::{ExponentialBackoffWithJitter, ReconnectPolicy};
pub use session::*;

/// Options for configuring a new [`Session`].
#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct SessionOptions {
    /// MQTT connection settings to use for the underlying MQTT connection
    #[builder(setter(into))]
    pub connection_settings: MqttConnectionSettings,
    /// Reconnect policy to use for the [`Session`]
    #[builder(default = "Box::new(ExponentialBackoffWithJitter::default())")]
    pub reconnect_policy: Box<dyn ReconnectPolicy>,
}

/// Error type for [`Session`]. The type of error is specified by the value of [`SessionErrorKind`].
#[derive(Debug, Error)]
#[error(transparent)]
pub struct SessionError(#[from] SessionErrorKind);

/// Error kind for [`SessionError`].
#[derive(Error, Debug)]
pub enum SessionErrorKind {
    /// Invalid configuration options provided to the [`Session`].
    #[error("invalid configuration: {0}")]
    ConfigError(#[from] adapter::ConnectionSettingsAdapterError),
    /// MQTT session was lost due to a connection error.
    #[error("session state not present on broker after reconnect")]
    SessionLost,
    /// MQTT session was ended due to an unrecoverable connection error
    #[error(transparent)]
    ConnectionError(#[from] ConnectionError),
    /// Reconnect attempts were halted by the reconnect policy, ending the MQTT session
    #[error("reconnection halted by reconnect policy")]
    ReconnectHalted,
    /// The [`Session`] ended up in an invalid state.
    #[error("{0}")]
    InvalidState(String),
    /// I/O error occurred while reading the SAT auth file.
    #[error("{0}")]
    IoError(#[from] std::io::Error),
    /// The [`Session`] was forcefully exited.
    #[error("session was force exited")]
    ForceExit,
    /// Error occurred while initializing the SAT auth context.
    #[error("{0}")]
    SatAuthContextInitError(#[from] crate::auth::SatAuthContextInitError),
}

/// Error type for attempting to end a [`Session`] via a [`SessionExitHandle`].
/// The type of error is specified by the value of [`SessionExitErrorKind`].
#[derive(Debug, Error)]
#[error(transparent)]
pub struct SessionExitError(#[from] SessionExitErrorKind);

impl From<ClientError> for SessionExitError {
    fn from(e: ClientError) -> Self {
        Self(SessionExitErrorKind::ClientError(e))
    }
}

impl From<tokio::time::error::Elapsed> for SessionExitError {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Self(SessionExitErrorKind::Timeout(e))
    }
}

impl SessionExitError {
    /// Returns true if the exit attempt failed because the [`Session`] was not connected to the broker.
    #[must_use]
    pub fn is_broker_unavailable(&self) -> bool {
        matches!(self.0, SessionExitErrorKind::BrokerUnavailable { .. })
    }
}

/// Error kind for [`SessionExitError`].
#[derive(Error, Debug)]
enum SessionExitErrorKind {
    /// The [`Session`] no longer exists.
    #[error("the Session no longer exists")]
    Dropped,
    /// The [`Session`] is not connected to the broker.
    #[error("the Session is not connected to the broker (exit attempted: {attempted})")]
    BrokerUnavailable {
        /// Indicates whether an exit attempt was made despite the disconnection.
        attempted: bool,
    },
    /// The graceful exit attempt did not complete within the specified timeout.
    #[error("timed out waiting for the Session to exit: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),
    /// Error occurred while disconnecting from the broker.
    #[error("{0}")]
    ClientError(#[from] ClientError),
}
