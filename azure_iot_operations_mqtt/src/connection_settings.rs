// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Generic MQTT connection settings implementations

use std::env::{self, VarError};
use std::path::PathBuf;
use std::time::Duration;

// TODO: Split up this struct to avoid weird combinations and separate concern.
// Things like having both password and password_file don't make much sense,
// nor frankly does combining MQTT and TLS settings.

/// All the settings required to establish an MQTT connection.
#[derive(Builder, Clone)]
#[builder(pattern = "owned", setter(into), build_fn(validate = "Self::validate"))]
pub struct MqttConnectionSettings {
    /// Client identifier
    pub(crate) client_id: String,
    /// FQDN of the host to connect to
    pub(crate) hostname: String,
    /// TCP port to connect to the host on
    #[builder(default = "8883")]
    pub(crate) tcp_port: u16,
    /// Max time between communications
    #[builder(default = "Duration::from_secs(60)")]
    pub(crate) keep_alive: Duration,
    /// Max number of in-flight Quality of Service 1 and 2 messages
    //TODO: This is probably better represented as an option. Do this when refactoring.
    #[builder(default = "u16::MAX")] // See: MQTT 5.0 spec, 3.1.2.11.3
    pub(crate) receive_max: u16,
    /// Max size of a received packet
    #[builder(default = "None")]
    pub(crate) receive_packet_size_max: Option<u32>,
    /// Session Expiry Interval
    #[builder(default = "Duration::from_secs(3600)")]
    // TODO: Would this would be better represented as an integer (probably, due to max value having distinct meaning in MQTT)
    pub(crate) session_expiry: Duration,
    /// Connection timeout
    #[builder(default = "Duration::from_secs(30)")]
    pub(crate) connection_timeout: Duration,
    /// Clean start
    #[builder(default = "false")]
    //NOTE: Should be `true` outside of AIO context. Consider when refactoring settings.
    pub(crate) clean_start: bool,
    /// Username for MQTT
    #[builder(default = "None")]
    pub(crate) username: Option<String>,
    /// Password for MQTT
    #[builder(default = "None")]
    pub(crate) password: Option<String>,
    /// Path to a file containing the MQTT password
    #[builder(default = "None")]
    pub(crate) password_file: Option<String>,
    /// TLS negotiation enabled
    #[builder(default = "true")]
    pub(crate) use_tls: bool,
    /// Path to a PEM file used to validate server identity
    #[builder(default = "None")]
    pub(crate) ca_file: Option<String>,
    /// Path to PEM file used to establish X509 client authentication
    #[builder(default = "None")]
    pub(crate) cert_file: Option<String>,
    /// Path to a file containing a key used to establish X509 client authentication
    #[builder(default = "None")]
    pub(crate) key_file: Option<String>,
    /// Path to a file containing the password used to decrypt the Key
    #[builder(default = "None")]
    pub(crate) key_password_file: Option<String>,
    /// Path to a SAT file to be used for SAT auth
    #[builder(default = "None")]
    pub(crate) sat_file: Option<String>,
}

impl MqttConnectionSettingsBuilder {
    /// Initialize the [`MqttConnectionSettingsBuilder`] from environment variables.
    ///
    /// Example
    /// ```
    /// # use azure_iot_operations_mqtt::{MqttConnectionSettings, MqttConnectionSettingsBuilder, MqttConnectionSettingsBuilderError};
    /// # fn try_main() -> Result<MqttConnectionSettings, MqttConnectionSettingsBuilderError> {
    /// let connection_settings = MqttConnectionSettingsBuilder::from_environment().unwrap().build()?;
    /// # Ok(connection_settings)
    /// # }
    /// # fn main() {
    /// #     // NOTE: This example is organized like this because we don't actually have env vars set, so it always panics
    /// #     try_main().ok();
    /// # }
    /// ```
    ///
    /// # Errors
    /// Returns a `String` describing the error if any of the environment variables are invalid.
    pub fn from_environment() -> Result<Self, String> {
        let client_id = string_from_environment("AIO_MQTT_CLIENT_ID")?;
        let hostname = string_from_environment("AIO_BROKER_HOSTNAME")?;
        let tcp_port = string_from_environment("AIO_BROKER_TCP_PORT")?
            .map(|v| v.parse::<u16>())
            .transpose()
            .map_err(|e| format!("AIO_BROKER_TCP_PORT: {e}"))?;
        let keep_alive = string_from_environment("AIO_MQTT_KEEP_ALIVE")?
            .map(|v| v.parse::<u32>().map(u64::from).map(Duration::from_secs))
            .transpose()
            .map_err(|e| format!("AIO_MQTT_KEEP_ALIVE: {e}"))?;
        let session_expiry = string_from_environment("AIO_MQTT_SESSION_EXPIRY")?
            .map(|v| v.parse::<u32>().map(u64::from).map(Duration::from_secs))
            .transpose()
            .map_err(|e| format!("AIO_MQTT_SESSION_EXPIRY: {e}"))?;
        let clean_start = string_from_environment("AIO_MQTT_CLEAN_START")?
            .map(|v| v.parse::<bool>())
            .transpose()
            .map_err(|e| format!("AIO_MQTT_CLEAN_START: {e}"))?;
        let username = Some(string_from_environment("AIO_MQTT_USERNAME")?);
        let password_file = Some(string_from_environment("AIO_MQTT_PASSWORD_FILE")?);
        let use_tls = string_from_environment("AIO_MQTT_USE_TLS")?
            .map(|v| v.parse::<bool>())
            .transpose()
            .map_err(|e| format!("AIO_MQTT_USE_TLS: {e}"))?;
        let ca_file = Some(string_from_environment("AIO_TLS_CA_FILE")?);
        let cert_file = Some(string_from_environment("AIO_TLS_CERT_FILE")?);
        let key_file = Some(string_from_environment("AIO_TLS_KEY_FILE")?);
        let key_password_file = Some(string_from_environment("AIO_TLS_KEY_PASSWORD_FILE")?);
        let sat_file = Some(string_from_environment("AIO_SAT_FILE")?);

        // Log warnings if required values are missing
        // NOTE: Do not error. It is valid to have empty values if the user will be overriding them,
        // and we do not want to prevent that. However, it likely suggests a misconfiguration, and
        // the errors from .validate() will not be particularly clear in this case, as it has no
        // way of knowing if the values originally came from the environment or were set by the user.
        if client_id.is_none() {
            log::warn!("AIO_MQTT_CLIENT_ID is not set in environment");
        }
        if hostname.is_none() {
            log::warn!("AIO_BROKER_HOSTNAME is not set in environment");
        }
        // Similar to the above, some fields are mutually exclusive, but shouldn't be an error,
        // since, per the builder pattern, it should technically be possible to override them,
        // although this is almost certainly a misconfiguration.
        if sat_file.is_some() && password_file.is_some() {
            log::warn!(
                "AIO_SAT_FILE and AIO_MQTT_PASSWORD_FILE are both set in environment. Only one should be used."
            );
        }

        // TODO: consider removing some of the Option wrappers in the Builder definition to avoid these spurious Some() wrappers.

        Ok(Self {
            client_id,
            hostname,
            tcp_port,
            keep_alive,
            receive_max: Some(u16::MAX),
            receive_packet_size_max: None,
            session_expiry,
            connection_timeout: Some(Duration::from_secs(30)),
            clean_start,
            username,
            password: None,
            password_file,
            use_tls,
            ca_file,
            cert_file,
            key_file,
            key_password_file,
            sat_file,
        })
    }

    /// Construct a builder from the configuration files mounted by the Akri Operator.
    /// This method is only usable for connector applications deployed as a kubernetes pod.
    ///
    /// # Examples
    ///
    /// ```
    /// # use azure_iot_operations_mqtt::{MqttConnectionSettings, MqttConnectionSettingsBuilder, MqttConnectionSettingsBuilderError};
    /// # fn try_main() -> Result<MqttConnectionSettings, String> {
    /// let builder = MqttConnectionSettingsBuilder::from_file_mount()?;
    /// let connection_settings = builder.build()
    ///     .map_err(|e| format!("Failed to build settings: {}", e))?;
    /// # Ok(connection_settings)
    /// # }
    /// # fn main() {
    /// #     // Example not run as part of docs
    /// #     try_main().ok();
    /// # }
    /// ```
    ///
    /// # Errors
    ///
    /// Returns a `String` describing the error if:
    /// - Required environment variables are missing
    /// - Configuration files cannot be read
    /// - Configuration values are invalid
    pub fn from_file_mount() -> Result<Self, String> {
        // --- Mount 1: AEP_CONFIGMAP_MOUNT_PATH ---
        let (client_id, hostname, tcp_port, use_tls) = {
            match string_from_environment("AEP_CONFIGMAP_MOUNT_PATH")? {
                Some(s) => {
                    let aep_pathbuf = PathBuf::from(&s);
                    if !aep_pathbuf.as_path().exists() {
                        return Err(format!("Config map path does not exist: {s}"));
                    }
                    // Read target address (hostname:port)
                    let (hostname, tcp_port) = {
                        match string_from_configmap_file(&aep_pathbuf, "BROKER_TARGET_ADDRESS")? {
                            Some(target_address) => {
                                // Parse hostname and port from target address
                                let (hostname, tcp_port) = target_address.split_once(':').ok_or(
                                    format!(
                                        "BROKER_TARGET_ADDRESS is malformed. Expected format <hostname>:<port>. Found: {target_address}"
                                    )
                                )?;
                                (
                                    Some(hostname.to_string()),
                                    Some(tcp_port.parse::<u16>().map_err(|e| {
                                        format!(
                                            "Cannot parse MQTT port from BROKER_TARGET_ADDRESS: {e}"
                                        )
                                    })?),
                                )
                            }
                            None => (None, None),
                        }
                    };
                    // Read client ID
                    let client_id = string_from_configmap_file(&aep_pathbuf, "AIO_MQTT_CLIENT_ID")?;
                    // Read use TLS setting
                    let use_tls = string_from_configmap_file(&aep_pathbuf, "BROKER_USE_TLS")?
                        .map(|v| v.parse::<bool>())
                        .transpose()
                        .map_err(|e| format!("BROKER_USE_TLS: {e}"))?;

                    (client_id, hostname, tcp_port, use_tls)
                }
                None => {
                    // NOTE: See the warning section father below in the function for an
                    // explanation of why this isn't an error.
                    log::warn!("AEP_CONFIGMAP_MOUNT_PATH is not set in environment");
                    (None, None, None, None)
                }
            }
        };

        // --- Mount 2: BROKER_SAT_MOUNT_PATH ---
        // NOTE: This will be moved to be part of Mount 1 in the future.
        let sat_file = Some(string_from_environment("BROKER_SAT_MOUNT_PATH")?);

        // --- Mount 3: BROKER_TLS_TRUST_BUNDLE_CACERT_MOUNT_PATH ---
        let ca_file = Some(string_from_environment(
            "BROKER_TLS_TRUST_BUNDLE_CACERT_MOUNT_PATH",
        )?);

        // Log warnings if required values are missing
        // NOTE: Do not error. It is valid to have empty values if the user will be overriding them
        // (as is idiomatic for the Builder pattern), and we do not want to prevent that. However,
        // it likely suggests a misconfiguration, and the errors from .validate() will not be
        // particularly clear in this case, as it has no way of knowing if the values came from the
        // configmap or were set by the user.
        if client_id.is_none() {
            log::warn!("AIO_MQTT_CLIENT_ID is not set in AEP configmap");
        }
        if hostname.is_none() || tcp_port.is_none() {
            log::warn!("BROKER_TARGET_ADDRESS is not set in AEP configmap");
        }

        // Return builder with settings
        Ok(Self {
            client_id,
            hostname,
            tcp_port,
            keep_alive: Some(Duration::from_secs(60)),
            receive_max: Some(u16::MAX),
            receive_packet_size_max: None,
            session_expiry: Some(Duration::from_secs(3600)),
            connection_timeout: Some(Duration::from_secs(30)),
            clean_start: Some(false),
            username: None,
            password: None,
            password_file: None,
            use_tls,
            ca_file,
            cert_file: None,
            key_file: None,
            key_password_file: None,
            sat_file,
        })
    }

    /// Validate the MQTT Connection Settings.
    ///
    /// # Errors
    /// Returns a `String` describing the error if
    /// - `hostname` is empty
    /// - `client_id` is empty and `clean_start` is false
    /// - `password` and `password_file` are both Some
    /// - `sat_file` is Some and `password` or `password_file` are Some
    /// - `key_file` is Some and `cert_file` is None or empty
    fn validate(&self) -> Result<(), String> {
        if let Some(hostname) = &self.hostname {
            if hostname.is_empty() {
                return Err("Host name cannot be empty".to_string());
            }
        }
        if let Some(client_id) = &self.client_id {
            if client_id.is_empty() {
                if let Some(clean_start) = self.clean_start {
                    if !clean_start {
                        return Err(
                            "client_id is mandatory when clean_start is set to false".to_string()
                        );
                    }
                } else {
                    // default for clean_start is false
                    return Err(
                        "client_id is mandatory when clean_start is set to false".to_string()
                    );
                }
            }
        }
        if let (Some(password), Some(password_file)) = (&self.password, &self.password_file) {
            if password.is_some() && password_file.is_some() {
                return Err(
                    "password and password_file should not be used at the same time.".to_string(),
                );
            }
        }
        if let Some(Some(_)) = &self.sat_file {
            if let Some(Some(_)) = &self.password {
                return Err("sat_file cannot be used with password or password_file.".to_string());
            }
            if let Some(Some(_)) = &self.password_file {
                return Err("sat_file cannot be used with password or password_file.".to_string());
            }
        }
        if let Some(Some(key_file)) = &self.key_file {
            if let Some(Some(cert_file)) = &self.cert_file {
                if cert_file.is_empty() || key_file.is_empty() {
                    return Err("key_file and cert_file need to be provided together.".to_string());
                }
            } else {
                return Err("key_file and cert_file need to be provided together.".to_string());
            }
        } else if let Some(Some(_)) = &self.cert_file {
            return Err("key_file and cert_file need to be provided together.".to_string());
        }
        Ok(())
    }
}

/// Helper function to get an environment variable as a string.
fn string_from_environment(key: &str) -> Result<Option<String>, String> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(VarError::NotPresent) => Ok(None), // Handled by the validate function if required
        Err(VarError::NotUnicode(_)) => {
            Err("Could not parse non-unicode environment variable".to_string())
        }
    }
}

/// Helper function to extract the value from a config map file as a string.
fn string_from_configmap_file(
    configmap_pathbuf: &PathBuf,
    filename: &str,
) -> Result<Option<String>, String> {
    let file_pathbuf = configmap_pathbuf.join(filename);
    if !file_pathbuf.as_path().exists() {
        return Ok(None); // File doesn't exist, return None
    }
    let value = std::fs::read_to_string(file_pathbuf)
        .map_err(|e| format!("Malformed {filename} file: {e}"))?;
    // NOTE: Can't chain .trim() due to memory rules
    Ok(Some(value.trim().to_string()))
}
