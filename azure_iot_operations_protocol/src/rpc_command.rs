// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Envoys for Remote Procedure Call (RPC) operations.

use std::str::FromStr;

use crate::ProtocolVersion;
use crate::common::aio_protocol_error::AIOProtocolError;

/// This module contains the command invoker implementation.
pub mod invoker;

/// This module contains the command executor implementation.
pub mod executor;

/// Re-export the command invoker and executor for ease of use.
pub use executor::Executor;
pub use invoker::Invoker;

/// Protocol version used by all command envoys in this module
pub(crate) const RPC_COMMAND_PROTOCOL_VERSION: ProtocolVersion =
    ProtocolVersion { major: 1, minor: 0 };
/// Assumed version if no version is provided.
pub(crate) const DEFAULT_RPC_COMMAND_PROTOCOL_VERSION: ProtocolVersion =
    ProtocolVersion { major: 1, minor: 0 };

/// Represents the valid status codes for command responses.
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) enum StatusCode {
    /// No error.
    Ok = 200,

    /// There is no content to send for this response.
    NoContent = 204,

    /// Header or payload is missing or invalid.
    BadRequest = 400,

    /// The request timed out before a response could be received from the command processor.
    RequestTimeout = 408,

    /// The command cannot be invoked because the target resource is in an invalid state
    /// (for example, a fencing token was stale).
    StateInvalid = 422,

    /// Unknown error, internal logic error, or command processor error.
    InternalServerError = 500,

    /// The command processor identified an error in the request that prevented invocation.
    InvocationException = 503,
    /// The request failed because the remote party did not support the requested protocol version.
    VersionNotSupported = 505,
}

impl FromStr for StatusCode {
    type Err = StatusCodeParseError;

    fn from_str(s: &str) -> Result<Self, StatusCodeParseError> {
        match s.parse::<u16>() {
            Ok(status) => match status {
                x if x == StatusCode::Ok as u16 => Ok(StatusCode::Ok),
                x if x == StatusCode::NoContent as u16 => Ok(StatusCode::NoContent),
                x if x == StatusCode::BadRequest as u16 => Ok(StatusCode::BadRequest),
                x if x == StatusCode::RequestTimeout as u16 => Ok(StatusCode::RequestTimeout),
                x if x == StatusCode::StateInvalid as u16 => Ok(StatusCode::StateInvalid),
                x if x == StatusCode::InternalServerError as u16 => {
                    Ok(StatusCode::InternalServerError)
                }
                x if x == StatusCode::InvocationException as u16 => {
                    Ok(StatusCode::InvocationException)
                }
                x if x == StatusCode::VersionNotSupported as u16 => {
                    Ok(StatusCode::VersionNotSupported)
                }
                _ => Err(StatusCodeParseError::UnknownStatusCode(status)),
            },
            Err(_) => Err(StatusCodeParseError::InvalidStatusCode(s.to_string())),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum StatusCodeParseError {
    #[error("Invalid status code: {0}")]
    InvalidStatusCode(String),
    #[error("Unknown status code: {0}")]
    UnknownStatusCode(u16),
}
