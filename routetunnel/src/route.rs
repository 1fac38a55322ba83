use std::{borrow::Borrow, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

pub const MIN_ROUTE_LEN: usize = 3;
pub const MAX_ROUTE_LEN: usize = 64;

/// Public name of a tunnel, unique across a registry.
///
/// Only ASCII alphanumerics, `-` and `_` are accepted, between
/// [`MIN_ROUTE_LEN`] and [`MAX_ROUTE_LEN`] characters long.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Route(String);

impl Route {
    pub fn parse(value: &str) -> Result<Self, RelayError> {
        let len = value.len();
        if !(MIN_ROUTE_LEN..=MAX_ROUTE_LEN).contains(&len) {
            return Err(RelayError::InvalidRoute(value.to_string()));
        }
        let valid = value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !valid {
            return Err(RelayError::InvalidRoute(value.to_string()));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Route {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Route::parse(s)
    }
}

impl TryFrom<String> for Route {
    type Error = RelayError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Route::parse(&value)
    }
}

impl From<Route> for String {
    fn from(value: Route) -> Self {
        value.0
    }
}

impl Borrow<str> for Route {
    fn borrow(&self) -> &str {
        &self.0
    }
}
