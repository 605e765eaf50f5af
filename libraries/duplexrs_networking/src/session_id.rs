use std::fmt;
use std::str::FromStr;

/// Opaque identifier correlating the two HTTP legs of one duplex session.
/// The legs share no connection state; this value is all that ties them
/// together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u128);

impl SessionId {
    pub fn generate() -> Self {
        Self(rand::random::<u128>())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{:032x}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("malformed session id '{0}'")]
pub struct ParseSessionIdError(String);

impl FromStr for SessionId {
    type Err = ParseSessionIdError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.len() != 32 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ParseSessionIdError(value.to_string()));
        }

        match u128::from_str_radix(value, 16) {
            Ok(id) => Ok(Self(id)),
            Err(_) => Err(ParseSessionIdError(value.to_string())),
        }
    }
}
