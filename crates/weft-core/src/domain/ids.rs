//! Ids - ULID ベースの型付き ID
//!
//! `TaskId` と `AgentId` は中身はどちらも ULID ですが、マーカー型で区別するので
//! 取り違えるとコンパイルエラーになります。
//!
//! 外に出る表現（Display / serde）は `task-01J...` のような接頭辞付き文字列です。
//! 解析時は接頭辞なしの ULID も受け付けますが、別種の接頭辞は拒否します。

use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use ulid::Ulid;

/// Compile-time tag naming one kind of id.
pub trait IdMarker: Send + Sync + 'static {
    /// Entity name used in errors ("task", "agent").
    const KIND: &'static str;
    /// Rendered before the ULID, dash included.
    const PREFIX: &'static str;
}

#[repr(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    _marker: PhantomData<fn() -> T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

// derive は T にも境界を要求してしまうので手書き
impl<T: IdMarker> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: IdMarker> Copy for Id<T> {}

impl<T: IdMarker> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ulid == other.ulid
    }
}

impl<T: IdMarker> Eq for Id<T> {}

impl<T: IdMarker> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: IdMarker> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.ulid.cmp(&other.ulid)
    }
}

impl<T: IdMarker> std::hash::Hash for Id<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ulid.hash(state);
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::PREFIX, self.ulid)
    }
}

impl<T: IdMarker> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind} id {input:?}")]
pub struct ParseIdError {
    pub kind: &'static str,
    pub input: String,
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::PREFIX).unwrap_or(s);
        Ulid::from_string(raw)
            .map(Self::from_ulid)
            .map_err(|_| ParseIdError {
                kind: T::KIND,
                input: s.to_string(),
            })
    }
}

impl<T: IdMarker> Serialize for Id<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de, T: IdMarker> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

pub enum TaskMarker {}

impl IdMarker for TaskMarker {
    const KIND: &'static str = "task";
    const PREFIX: &'static str = "task-";
}

pub enum AgentMarker {}

impl IdMarker for AgentMarker {
    const KIND: &'static str = "agent";
    const PREFIX: &'static str = "agent-";
}

/// Identifier of a task.
pub type TaskId = Id<TaskMarker>;

/// Identifier of a registered agent.
pub type AgentId = Id<AgentMarker>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_json_carry_the_prefix() {
        let ulid = Ulid::new();
        let task = TaskId::from_ulid(ulid);

        assert_eq!(task.to_string(), format!("task-{ulid}"));
        assert_eq!(
            serde_json::to_value(task).unwrap(),
            serde_json::json!(format!("task-{ulid}"))
        );
        assert_eq!(format!("{task:?}"), task.to_string());
    }

    #[test]
    fn parse_accepts_prefixed_and_bare_forms() {
        let agent = AgentId::from_ulid(Ulid::new());
        let bare = agent.as_ulid().to_string();

        assert_eq!(agent.to_string().parse::<AgentId>().unwrap(), agent);
        assert_eq!(bare.parse::<AgentId>().unwrap(), agent);
    }

    #[test]
    fn parse_rejects_foreign_prefix() {
        let task = TaskId::from_ulid(Ulid::new());
        let err = task.to_string().parse::<AgentId>().unwrap_err();
        assert_eq!(err.kind, "agent");

        let json = serde_json::to_string(&task).unwrap();
        assert!(serde_json::from_str::<AgentId>(&json).is_err());
        assert_eq!(serde_json::from_str::<TaskId>(&json).unwrap(), task);
    }

    #[test]
    fn id_is_exactly_one_ulid_wide() {
        assert_eq!(std::mem::size_of::<TaskId>(), std::mem::size_of::<Ulid>());
    }
}
