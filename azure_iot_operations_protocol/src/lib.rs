// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Utilities for using the Azure IoT Operations Protocol over MQTT.

#![warn(missing_docs)]
#![allow(clippy::result_large_err)]

use std::{
    fmt::{self, Display},
    str::FromStr,
};

/// Application-wide utilities, including the shared hybrid logical clock.
pub mod application;
/// Common utilities shared by all envoys in this crate.
pub mod common;
/// Envoys for Remote Procedure Call (RPC) operations.
pub mod rpc_command;
/// Envoys for Telemetry operations.
#[doc(hidden)]
pub mod telemetry;

#[macro_use]
extern crate derive_builder;

/// Include the README doc on a struct when running doctests to validate that the code in the
/// README can compile to verify that it has not rotted.
#[doc = include_str!("../README.md")]
#[cfg(doctest)]
struct ReadmeDoctests;

/// The version of the Azure IoT Operations Protocol carried by a request, response, or
/// advertised as supported by a command executor.
///
/// Sent on the wire via the `__protVer` and `__supProtMajVer` user properties described in the
/// protocol's external interface.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProtocolVersion {
    /// Major version. Incompatible changes increment this value.
    pub major: u16,
    /// Minor version. Backward-compatible additions increment this value.
    pub minor: u16,
}

impl ProtocolVersion {
    /// Parses a `__protVer` user property value of the form `"<major>.<minor>"` (or
    /// `"<major>"`, defaulting the minor version to 0).
    ///
    /// Returns `None` rather than an error since a malformed protocol version is treated
    /// identically to an unsupported one by callers.
    #[must_use]
    pub fn parse_protocol_version(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    /// Parses a space-separated list of major versions, as carried in the
    /// `__supProtMajVer` user property.
    ///
    /// # Errors
    /// Returns an error if any entry is not a valid `u16`.
    pub fn parse_supported_major_versions(s: &str) -> Result<Vec<u16>, String> {
        s.split_whitespace()
            .map(|v| {
                v.parse::<u16>()
                    .map_err(|e| format!("invalid major version '{v}': {e}"))
            })
            .collect()
    }

    /// Returns `true` if `self.major` appears in `supported_major_versions`.
    #[must_use]
    pub fn is_supported(&self, supported_major_versions: &[u16]) -> bool {
        supported_major_versions.contains(&self.major)
    }
}

/// Formats a list of major versions as a space-separated string, as carried in the
/// `__supProtMajVer` user property.
#[must_use]
pub fn supported_protocol_major_versions_to_string(supported_major_versions: &[u16]) -> String {
    supported_major_versions
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parses a space-separated list of major versions, as carried in the `__supProtMajVer`
/// user property, ignoring any entry that is not a valid `u16`.
#[must_use]
pub fn parse_supported_protocol_major_versions(s: &str) -> Vec<u16> {
    s.split_whitespace()
        .filter_map(|v| v.parse::<u16>().ok())
        .collect()
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ProtocolVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(2, '.');
        let major = parts
            .next()
            .ok_or_else(|| format!("malformed protocol version '{s}'"))?
            .parse::<u16>()
            .map_err(|e| format!("malformed protocol version '{s}': {e}"))?;
        let minor = match parts.next() {
            Some(m) => m
                .parse::<u16>()
                .map_err(|e| format!("malformed protocol version '{s}': {e}"))?,
            None => 0,
        };
        Ok(Self { major, minor })
    }
}
