// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log destinations: the primary one resolved from configuration and host
//! identity, and the optional sharing destination decoded from a
//! `key::secret::group::stream` string.

use std::fmt;

use crate::constants::SHARING_DESTINATION_DELIMITER;

/// Static credentials attached to a destination.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub log_group: String,
    pub log_stream: String,
    pub credentials: Option<Credentials>,
}

impl Destination {
    /// Destination using the ambient credentials of the process.
    #[must_use]
    pub fn new(log_group: impl Into<String>, log_stream: impl Into<String>) -> Self {
        Self {
            log_group: log_group.into(),
            log_stream: log_stream.into(),
            credentials: None,
        }
    }

    /// Parses `key::secret::group::stream`. Anything but exactly four
    /// fields is rejected.
    #[must_use]
    pub fn parse_sharing(encoded: &str) -> Option<Self> {
        let parts: Vec<&str> = encoded.split(SHARING_DESTINATION_DELIMITER).collect();
        let [access_key_id, secret_access_key, log_group, log_stream] = parts.as_slice() else {
            return None;
        };
        Some(Self {
            log_group: (*log_group).to_string(),
            log_stream: (*log_stream).to_string(),
            credentials: Some(Credentials {
                access_key_id: (*access_key_id).to_string(),
                secret_access_key: (*secret_access_key).to_string(),
            }),
        })
    }

    /// A destination needs a group and a stream; a credentialed one also
    /// needs both credential fields.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        if self.log_group.is_empty() || self.log_stream.is_empty() {
            return false;
        }
        match &self.credentials {
            Some(c) => !c.access_key_id.is_empty() && !c.secret_access_key.is_empty(),
            None => true,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.log_group, self.log_stream)
    }
}
