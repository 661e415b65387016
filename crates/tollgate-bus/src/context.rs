//! Bounded contexts and consumer offset policy.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Named event namespace; its tag is the default topic name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BoundedContext {
    Proxy,
    Plan,
    Billing,
    Users,
}

impl BoundedContext {
    pub const ALL: [BoundedContext; 4] = [Self::Proxy, Self::Plan, Self::Billing, Self::Users];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Proxy => "PROXY",
            Self::Plan => "PLAN",
            Self::Billing => "BILLING",
            Self::Users => "USERS",
        }
    }
}

impl fmt::Display for BoundedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BoundedContext {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown bounded context: {s}"))
    }
}

/// Where a consumer group without a committed offset starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    /// From the first retained event.
    #[default]
    Earliest,
    /// Only events produced after subscription.
    Latest,
}

impl FromStr for OffsetReset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest" | "smallest" | "beginning" => Ok(Self::Earliest),
            "latest" | "largest" | "end" => Ok(Self::Latest),
            other => Err(format!("unknown offset reset policy: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_names() {
        assert_eq!(BoundedContext::Proxy.to_string(), "PROXY");
        assert_eq!("billing".parse::<BoundedContext>(), Ok(BoundedContext::Billing));
        assert!("ORDERS".parse::<BoundedContext>().is_err());
    }

    #[test]
    fn offset_reset_aliases() {
        assert_eq!("Earliest".parse::<OffsetReset>(), Ok(OffsetReset::Earliest));
        assert_eq!("largest".parse::<OffsetReset>(), Ok(OffsetReset::Latest));
        assert!("middle".parse::<OffsetReset>().is_err());
    }
}
