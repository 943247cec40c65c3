// Channel address parsing
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Reasons a raw channel string is rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelParseError {
    #[error("channel is empty")]
    Empty,

    #[error("channel `{0}` has an empty segment")]
    EmptySegment(String),

    #[error("channel `{channel}` has {segments} segments, expected 1 or 3")]
    SegmentCount { channel: String, segments: usize },
}

/// Structured form of a channel such as `thread`, `store/<id>/files` or
/// `inbox/<id>/entries`.
///
/// Derived on demand from an envelope or a registration. Dispatch never keys
/// on this type; it exists to pick the remote subscribe/unsubscribe call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelAddress {
    pub module: String,
    pub instance_id: Option<String>,
    pub subtype: Option<String>,
}

impl ChannelAddress {
    /// Parses `module` or `module/instanceId/subtype`.
    ///
    /// Total over its input: anything that does not fit the grammar comes back
    /// as a [`ChannelParseError`], never a panic.
    ///
    /// ```
    /// use courier_core::channel::ChannelAddress;
    ///
    /// let addr = ChannelAddress::parse("thread/123/messages").unwrap();
    /// assert_eq!(addr.module, "thread");
    /// assert_eq!(addr.instance_id.as_deref(), Some("123"));
    /// assert_eq!(addr.subtype.as_deref(), Some("messages"));
    ///
    /// assert!(ChannelAddress::parse("thread/123").is_err());
    /// ```
    pub fn parse(raw: &str) -> Result<Self, ChannelParseError> {
        if raw.is_empty() {
            return Err(ChannelParseError::Empty);
        }

        let segments: Vec<&str> = raw.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(ChannelParseError::EmptySegment(raw.to_string()));
        }

        match segments.as_slice() {
            [module] => Ok(Self {
                module: module.to_string(),
                instance_id: None,
                subtype: None,
            }),
            [module, instance_id, subtype] => Ok(Self {
                module: module.to_string(),
                instance_id: Some(instance_id.to_string()),
                subtype: Some(subtype.to_string()),
            }),
            other => Err(ChannelParseError::SegmentCount {
                channel: raw.to_string(),
                segments: other.len(),
            }),
        }
    }

    /// Module-wide channel with no instance scope.
    pub fn module_wide(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            instance_id: None,
            subtype: None,
        }
    }

    /// Channel scoped to one instance's sub-resource.
    pub fn scoped(
        module: impl Into<String>,
        instance_id: impl Into<String>,
        subtype: impl Into<String>,
    ) -> Self {
        Self {
            module: module.into(),
            instance_id: Some(instance_id.into()),
            subtype: Some(subtype.into()),
        }
    }

    pub fn is_module_wide(&self) -> bool {
        self.instance_id.is_none()
    }
}

impl FromStr for ChannelAddress {
    type Err = ChannelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.instance_id, &self.subtype) {
            (Some(id), Some(subtype)) => write!(f, "{}/{}/{}", self.module, id, subtype),
            _ => f.write_str(&self.module),
        }
    }
}
