use std::{fmt, str::FromStr};

use crate::error::Error;

/// Interpreter release selecting an opcode table. Only major and minor matter, bytecode does not change in patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PyVersion {
    pub major: u8,
    pub minor: u8,
}

impl PyVersion {
    pub const fn new(major: u8, minor: u8) -> Self {
        PyVersion { major, minor }
    }
}

impl From<(u8, u8)> for PyVersion {
    fn from((major, minor): (u8, u8)) -> Self {
        PyVersion { major, minor }
    }
}

impl fmt::Display for PyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Accepts `"3.12"` and `"3.12.4"`.
impl FromStr for PyVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidVersion(s.to_string());

        let mut parts = s.trim().split('.');

        let major = parts
            .next()
            .and_then(|p| p.parse::<u8>().ok())
            .ok_or_else(invalid)?;
        let minor = parts
            .next()
            .and_then(|p| p.parse::<u8>().ok())
            .ok_or_else(invalid)?;

        match parts.next() {
            None => {}
            Some(patch) if patch.parse::<u32>().is_ok() => {}
            Some(_) => return Err(invalid()),
        }

        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(PyVersion { major, minor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_versions() {
        assert_eq!("3.12".parse::<PyVersion>().unwrap(), PyVersion::new(3, 12));
        assert_eq!("3.10.14".parse::<PyVersion>().unwrap(), (3, 10).into());
        assert!("3".parse::<PyVersion>().is_err());
        assert!("3.x".parse::<PyVersion>().is_err());
        assert!("3.12.1.1".parse::<PyVersion>().is_err());
    }

    #[test]
    fn ordering_follows_release_order() {
        assert!(PyVersion::new(3, 9) < PyVersion::new(3, 10));
        assert_eq!(PyVersion::new(3, 14).to_string(), "3.14");
    }
}
