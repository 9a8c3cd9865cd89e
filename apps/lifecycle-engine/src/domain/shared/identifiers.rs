//! Strongly-typed identifiers for domain entities.
//!
//! These prevent mixing up IDs from different contexts.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! define_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new identifier from a string.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Generate a new unique identifier using UUID v4.
            #[must_use]
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// Get the inner string value.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner string.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

define_id!(TradeId, "Unique identifier for an orchestrated trade.");
define_id!(
    ClientOrderId,
    "Locally generated idempotency key submitted alongside an order."
);
define_id!(BrokerOrderId, "Broker-assigned identifier for an order.");
define_id!(AccountId, "Brokerage account identifier.");
define_id!(
    Symbol,
    "Identifier for a tradeable instrument (ticker or OCC option symbol)."
);

impl ClientOrderId {
    /// Generate a fresh idempotency key, unique within process lifetime.
    ///
    /// Combines a millisecond timestamp with a random UUID suffix so keys
    /// never collide across concurrent trades.
    #[must_use]
    pub fn fresh() -> Self {
        let millis = chrono::Utc::now().timestamp_millis();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("lce-{millis}-{}", &suffix[..12]))
    }
}

impl Symbol {
    /// The underlying ticker for an OCC-style option symbol.
    ///
    /// Returns the symbol unchanged if it does not look like an option.
    #[must_use]
    pub fn underlying(&self) -> &str {
        let end = self
            .0
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}
