use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

macro_rules! key_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

key_newtype!(MatchId);

/// One of the two parallel broadcast outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Preview,
    Live,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Preview, Channel::Live];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Preview => "preview",
            Channel::Live => "live",
        }
    }

    pub fn other(&self) -> Channel {
        match self {
            Channel::Preview => Channel::Live,
            Channel::Live => Channel::Preview,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "preview" => Ok(Channel::Preview),
            "live" => Ok(Channel::Live),
            other => Err(format!(
                "unknown channel '{other}' (expected preview or live)"
            )),
        }
    }
}

/// An externally defined action identifier, which doubles as the rendering
/// payload written to the ticker field: boundary events are numeric, every
/// other event is a symbolic uppercase name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionValue {
    Runs(u32),
    Event(String),
}

impl ActionValue {
    pub fn event(name: impl Into<String>) -> Self {
        ActionValue::Event(name.into())
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, ActionValue::Event(name) if name.is_empty())
    }
}

impl fmt::Display for ActionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionValue::Runs(runs) => write!(f, "{runs}"),
            ActionValue::Event(name) => f.write_str(name),
        }
    }
}

impl FromStr for ActionValue {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value.is_empty() {
            return Err("action identifier must not be empty".to_string());
        }
        match value.parse::<u32>() {
            Ok(runs) => Ok(ActionValue::Runs(runs)),
            Err(_) => Ok(ActionValue::Event(value.to_string())),
        }
    }
}

impl From<u32> for ActionValue {
    fn from(runs: u32) -> Self {
        ActionValue::Runs(runs)
    }
}

impl From<&str> for ActionValue {
    fn from(name: &str) -> Self {
        ActionValue::Event(name.to_string())
    }
}
