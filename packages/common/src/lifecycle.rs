#[cfg(feature = "sea-orm")]
use sea_orm::prelude::StringLen;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status of a namespace link (a user's file or folder entry).
///
/// Only `Active` links are visible and count as references to pool content.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(
    feature = "sea-orm",
    derive(sea_orm::DeriveActiveEnum, sea_orm::EnumIter),
    sea_orm(rs_type = "String", db_type = "String(StringLen::None)")
)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    #[default]
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "active"))]
    Active,
    /// In the recycle bin; restorable until `expire_at`.
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "deleted"))]
    Deleted,
    /// Permanently gone.
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "purged"))]
    Purged,
}

impl LinkStatus {
    pub const ALL: &'static [LinkStatus] = &[Self::Active, Self::Deleted, Self::Purged];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Deleted => "deleted",
            Self::Purged => "purged",
        }
    }
}

/// Status of a content pool entry.
///
/// `Active -> Deleted` when its last live link goes away, `Deleted -> Purging -> Purged`
/// when the recycle sweeper reclaims it. `Deleted -> Active` happens on restore or on
/// an instant upload that reuses the content.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(
    feature = "sea-orm",
    derive(sea_orm::DeriveActiveEnum, sea_orm::EnumIter),
    sea_orm(rs_type = "String", db_type = "String(StringLen::None)")
)]
#[serde(rename_all = "lowercase")]
pub enum PoolStatus {
    #[default]
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "active"))]
    Active,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "deleted"))]
    Deleted,
    /// Remote object deletion is in progress. Must not be linked.
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "purging"))]
    Purging,
    /// The remote object is gone. Never resolvable again.
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "purged"))]
    Purged,
}

impl PoolStatus {
    pub const ALL: &'static [PoolStatus] =
        &[Self::Active, Self::Deleted, Self::Purging, Self::Purged];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Deleted => "deleted",
            Self::Purging => "purging",
            Self::Purged => "purged",
        }
    }

    /// Whether a new or restored link may point at content in this state.
    pub fn is_linkable(&self) -> bool {
        matches!(self, Self::Active | Self::Deleted)
    }
}

/// Kind of lifecycle event recorded in the event log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(
    feature = "sea-orm",
    derive(sea_orm::DeriveActiveEnum, sea_orm::EnumIter),
    sea_orm(rs_type = "String", db_type = "String(StringLen::None)")
)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "delete"))]
    Delete,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "restore"))]
    Restore,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "purge"))]
    Purge,
}

impl EventType {
    pub const ALL: &'static [EventType] = &[Self::Delete, Self::Restore, Self::Purge];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delete => "delete",
            Self::Restore => "restore",
            Self::Purge => "purge",
        }
    }
}

macro_rules! impl_text {
    ($ty:ident, $kind:literal) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseValueError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $ty::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str() == s)
                    .ok_or_else(|| ParseValueError {
                        kind: $kind,
                        invalid: s.to_string(),
                        valid: $ty::ALL.iter().map(|v| v.as_str()).collect(),
                    })
            }
        }
    };
}

impl_text!(LinkStatus, "link status");
impl_text!(PoolStatus, "pool status");
impl_text!(EventType, "event type");

/// Error when parsing an unknown lifecycle value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseValueError {
    kind: &'static str,
    invalid: String,
    valid: Vec<&'static str>,
}

impl fmt::Display for ParseValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Invalid {} '{}'. Valid values: {}",
            self.kind,
            self.invalid,
            self.valid.join(", ")
        )
    }
}

impl std::error::Error for ParseValueError {}
