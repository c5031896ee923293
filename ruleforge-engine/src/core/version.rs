use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use semver::Version;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{CoreError, CoreResult};

/// 平台版本号（宽松解析：`8` / `8.3` / `8.3.1` 均合法，缺省部分补 0）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StackVersion(Version);

impl StackVersion {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self(Version::new(major, minor, patch))
    }

    /// 宽松解析，允许省略 minor / patch
    pub fn parse(raw: &str) -> CoreResult<Self> {
        let trimmed = raw.trim().trim_start_matches('^');
        if trimmed.is_empty() {
            return Err(CoreError::InvalidVersion(raw.to_string()));
        }

        // 去掉预发布/构建后缀再补齐段数
        let core_end = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
        let (core, suffix) = trimmed.split_at(core_end);
        let parts: Vec<&str> = core.split('.').collect();
        if parts.len() > 3 || parts.iter().any(|p| p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit())) {
            return Err(CoreError::InvalidVersion(raw.to_string()));
        }

        let mut padded = parts.join(".");
        for _ in parts.len()..3 {
            padded.push_str(".0");
        }
        padded.push_str(suffix);

        Ok(Self(Version::parse(&padded)?))
    }

    pub fn major(&self) -> u64 {
        self.0.major
    }

    pub fn minor(&self) -> u64 {
        self.0.minor
    }

    /// `major.minor` 形式，版本锁以此为分支键
    pub fn major_minor(&self) -> String {
        format!("{}.{}", self.0.major, self.0.minor)
    }

    /// 截断到 `major.minor.0`
    pub fn truncated(&self) -> Self {
        Self::new(self.0.major, self.0.minor, 0)
    }

    pub fn inner(&self) -> &Version {
        &self.0
    }
}

impl Display for StackVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StackVersion {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl PartialOrd for StackVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StackVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl Serialize for StackVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for StackVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_optional_minor_and_patch() {
        assert_eq!(StackVersion::parse("8").unwrap(), StackVersion::new(8, 0, 0));
        assert_eq!(StackVersion::parse("8.3").unwrap(), StackVersion::new(8, 3, 0));
        assert_eq!(StackVersion::parse("8.3.2").unwrap(), StackVersion::new(8, 3, 2));
        assert_eq!(StackVersion::parse("^1.2.0").unwrap(), StackVersion::new(1, 2, 0));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(StackVersion::parse("").is_err());
        assert!(StackVersion::parse("8.x").is_err());
        assert!(StackVersion::parse("8..1").is_err());
        assert!(StackVersion::parse("1.2.3.4").is_err());
    }

    #[test]
    fn test_ordering_and_major_minor() {
        let a = StackVersion::parse("8.9").unwrap();
        let b = StackVersion::parse("8.10.1").unwrap();
        assert!(a < b);
        assert_eq!(b.major_minor(), "8.10");
        assert_eq!(b.truncated().to_string(), "8.10.0");
    }
}
