// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Application-wide utilities for use with the Azure IoT Operations SDK.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::common::aio_protocol_error::AIOProtocolError;
use super::common::hybrid_logical_clock::HybridLogicalClock;

const DEFAULT_MAX_CLOCK_DRIFT: u64 = 60;

/// Struct containing the application-level [`HybridLogicalClock`].
///
/// Shared by every envoy created from the same [`ApplicationContext`], so the clock advances
/// consistently across commands and telemetry within a process.
pub struct ApplicationHybridLogicalClock {
    hlc: Mutex<HybridLogicalClock>,
    max_clock_drift: Duration,
}

impl ApplicationHybridLogicalClock {
    /// Creates a new [`ApplicationHybridLogicalClock`] with the provided maximum clock drift, in
    /// seconds.
    #[must_use]
    pub fn new(max_clock_drift: u64) -> Self {
        Self {
            hlc: Mutex::new(HybridLogicalClock::new()),
            max_clock_drift: Duration::from_secs(max_clock_drift),
        }
    }

    /// Reads the current value of the [`ApplicationHybridLogicalClock`] without advancing it.
    #[must_use]
    pub fn read(&self) -> HybridLogicalClock {
        self.hlc.lock().unwrap().clone()
    }

    /// Advances the clock against the current wall-clock time and returns the canonical string
    /// form of the resulting [`HybridLogicalClock`], suitable for the `__ts` user property.
    ///
    /// # Errors
    /// Returns an [`AIOProtocolError`] if advancing the clock would overflow the counter or if
    /// the clock has drifted further into the future than the configured maximum.
    pub fn update_now(&self) -> Result<String, AIOProtocolError> {
        let mut hlc = self.hlc.lock().unwrap();
        hlc.update_now(self.max_clock_drift)?;
        Ok(hlc.to_string())
    }

    /// Updates the [`ApplicationHybridLogicalClock`] against a [`HybridLogicalClock`] received
    /// from a peer, advancing it per the hybrid logical clock update rule.
    ///
    /// # Errors
    /// Returns an [`AIOProtocolError`] if advancing the clock would overflow the counter or if
    /// either clock has drifted further into the future than the configured maximum.
    pub(crate) fn update(&self, other: &HybridLogicalClock) -> Result<(), AIOProtocolError> {
        let mut hlc = self.hlc.lock().unwrap();
        hlc.update(other, self.max_clock_drift)
    }
}

/// Struct containing the application context for the Azure IoT Operations SDK.
///
/// <div class="warning"> There must be a max of one per session and there should only be one per application (which may contain multiple sessions). </div>
#[derive(Clone, Builder)]
pub struct ApplicationContext {
    /// The [`ApplicationHybridLogicalClock`] used by the application.
    #[builder(
        setter(custom),
        default = "Arc::new(ApplicationHybridLogicalClock::new(DEFAULT_MAX_CLOCK_DRIFT))"
    )]
    pub application_hlc: Arc<ApplicationHybridLogicalClock>,
}

impl ApplicationContextBuilder {
    /// Sets the maximum clock drift allowed for the [`ApplicationHybridLogicalClock`], in
    /// seconds. Defaults to 60.
    pub fn max_clock_drift(&mut self, max_clock_drift: u64) -> &mut Self {
        self.application_hlc = Some(Arc::new(ApplicationHybridLogicalClock::new(
            max_clock_drift,
        )));
        self
    }
}
