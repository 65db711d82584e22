// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::{
    fmt::{self, Display},
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use uuid::Uuid;

use super::aio_protocol_error::AIOProtocolError;

pub const DEFAULT_MAX_CLOCK_DRIFT: Duration = Duration::from_secs(60);

/// Hybrid Logical Clock (HLC) generating unique timestamps
#[derive(Clone, Debug, PartialEq)]
pub struct HybridLogicalClock {
    /// Current timestamp.
    pub timestamp: SystemTime,
    /// Counter is used to coordinate ordering of events within a distributed system where each
    /// device may have slightly different system clock times.
    pub counter: u64,
    /// Unique identifier for this node.
    pub node_id: String,
}

impl Default for HybridLogicalClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HybridLogicalClock {
    /// Creates a new [`HybridLogicalClock`] with the current timestamp, a counter of 0,
    /// and a unique identifier
    #[must_use]
    pub fn new() -> Self {
        Self {
            timestamp: SystemTime::now(),
            counter: 0,
            node_id: Uuid::new_v4().to_string(),
        }
    }

    // (G?) Get - syncs the HLC to the current time and returns it
    // (G - only adds locking) Set - syncs the HLC to the given HLC

    // compare
    // equals?

    // Update - updates the HLC based on another one
    pub fn update(
        &mut self,
        other: &HybridLogicalClock,
        max_clock_drift: Duration,
    ) -> Result<(), AIOProtocolError> {
        // Don't update from the same node; a message we sent ourselves is already reflected
        // in our own clock.
        if self.node_id == other.node_id {
            return Ok(());
        }

        let now = SystemTime::now();

        // if now is the latest timestamp in the future, set the time to that and reset the counter
        if now > self.timestamp && now > other.timestamp {
            self.timestamp = now;
            self.counter = 0;
        }
        // if the timestamps are equal, take the max of the counters and increment by 1
        else if other.timestamp == self.timestamp {
            if self.counter >= other.counter {
                self.validate(now, max_clock_drift)?;
                self.counter += 1;
            } else {
                // timestamp matches, so validating other implicitly validates self.timestamp
                other.validate(now, max_clock_drift)?;
                self.counter = other.counter + 1;
            }
        }
        // if this timestamp is the latest, increase the counter by 1
        else if self.timestamp > other.timestamp {
            self.validate(now, max_clock_drift)?;
            self.counter += 1;
        }
        // if the other timestamp is the latest, set the time to that use the other counter + 1
        else if other.timestamp > self.timestamp {
            other.validate(now, max_clock_drift)?;
            self.timestamp = other.timestamp;
            self.counter = other.counter + 1;
        }

        Ok(())
    }

    // Update now - updates the HLC based on the current time
    pub fn update_now(&mut self, max_clock_drift: Duration) -> Result<(), AIOProtocolError> {
        let now = SystemTime::now();

        // if now later than self, set the time to that and reset the counter
        if now > self.timestamp {
            self.timestamp = now;
            self.counter = 0;
        } else {
            self.validate(now, max_clock_drift)?;
            self.counter += 1;
        }
        Ok(())
    }

    /// Validates that the HLC is not too far in the future compared to the current time,
    /// and that the counter has not overflowed.
    pub fn validate(
        &self,
        now: SystemTime,
        max_clock_drift: Duration,
    ) -> Result<(), AIOProtocolError> {
        if self.counter == u64::MAX {
            return Err(AIOProtocolError::new_internal_logic_error(
                true,
                false,
                None,
                None,
                "Counter",
                None,
                Some("Integer overflow on HybridLogicalClock counter".to_string()),
                None,
            ));
        }
        if let Ok(diff) = self.timestamp.duration_since(now) {
            if diff > max_clock_drift {
                return Err(AIOProtocolError::new_state_invalid_error(
                    "MaxClockDrift",
                    None,
                    Some(
                        "HybridLogicalClock drift is greater than the maximum allowed drift"
                            .to_string(),
                    ),
                    None,
                ));
            }
        } // else negative time difference is ok, we only care if the HLC is too far in the future

        Ok(())
    }
}

impl Display for HybridLogicalClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms_since_epoch = self
            .timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis();
        write!(
            f,
            "{:0>15}:{:0>5}:{}",
            ms_since_epoch, self.counter, self.node_id
        )
    }
}

impl FromStr for HybridLogicalClock {
    type Err = AIOProtocolError;

    fn from_str(s: &str) -> Result<Self, AIOProtocolError> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(AIOProtocolError::new_header_invalid_error(
                "HybridLogicalClock",
                s,
                false,
                None,
                None,
                None,
            ));
        }

        // Validate first part (timestamp)
        let ms_since_epoch = match parts[0].parse::<u64>() {
            Ok(ms) => ms,
            Err(e) => {
                return Err(AIOProtocolError::new_header_invalid_error(
                    "HybridLogicalClock",
                    s,
                    false,
                    None,
                    Some(format!(
                        "Malformed HLC. Could not parse first segment as an integer: {e}"
                    )),
                    None,
                ));
            }
        };
        let Some(timestamp) = UNIX_EPOCH.checked_add(Duration::from_millis(ms_since_epoch)) else {
            return Err(AIOProtocolError::new_header_invalid_error(
                "HybridLogicalClock",
                s,
                false,
                None,
                Some("Malformed HLC. Timestamp is out of range.".to_string()),
                None,
            ));
        };

        // Validate second part (counter)
        let counter = match parts[1].parse::<u64>() {
            Ok(val) => val,
            Err(e) => {
                return Err(AIOProtocolError::new_header_invalid_error(
                    "HybridLogicalClock",
                    s,
                    false,
                    None,
                    Some(format!(
                        "Malformed HLC. Could not parse second segment as an integer: {e}"
                    )),
                    None,
                ));
            }
        };

        // The node_id is just the third section as a string

        Ok(Self {
            timestamp,
            counter,
            node_id: parts[2].to_string(),
        })
    }
}
