//! Node identifiers.
//!
//! Every node is addressed by `(device_uid, node_uid)`. Local nodes have
//! exactly one path and travel as SPIDs; cloud nodes may be linked under
//! several parents at once and travel as MPIDs carrying every equivalent
//! path. The GUID is the only globally unique handle exposed to clients.

use crate::domain::uid::Uid;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdentifierError {
	#[error("malformed GUID: {0:?}")]
	BadGuid(String),
}

/// Client-visible string form of `(device_uid, node_uid[, path_uid])`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Guid {
	pub device_uid: Uid,
	pub node_uid: Uid,
	pub path_uid: Option<Uid>,
}

impl Guid {
	pub fn new(device_uid: Uid, node_uid: Uid) -> Self {
		Self {
			device_uid,
			node_uid,
			path_uid: None,
		}
	}

	pub fn with_path(device_uid: Uid, node_uid: Uid, path_uid: Uid) -> Self {
		Self {
			device_uid,
			node_uid,
			path_uid: Some(path_uid),
		}
	}
}

impl fmt::Display for Guid {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.path_uid {
			Some(path_uid) => write!(f, "{}:{}:{}", self.device_uid, self.node_uid, path_uid),
			None => write!(f, "{}:{}", self.device_uid, self.node_uid),
		}
	}
}

impl FromStr for Guid {
	type Err = IdentifierError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let bad = || IdentifierError::BadGuid(s.to_string());
		let mut parts = s.split(':');
		let device_uid: Uid = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
		let node_uid: Uid = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
		let path_uid = match parts.next() {
			Some(raw) => Some(raw.parse().map_err(|_| bad())?),
			None => None,
		};
		if parts.next().is_some() {
			return Err(bad());
		}
		Ok(Self {
			device_uid,
			node_uid,
			path_uid,
		})
	}
}

/// Single-Path IDentifier: fixes exactly one path for a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinglePathId {
	pub device_uid: Uid,
	pub node_uid: Uid,
	/// UID of the path itself (distinct from the node for multi-parented
	/// trees that were flattened into one path).
	pub path_uid: Uid,
	pub full_path: String,
	pub parent_guid: Option<Guid>,
}

/// Multi-Path IDentifier: carries every equivalent path of a multi-parented
/// cloud node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiPathId {
	pub device_uid: Uid,
	pub node_uid: Uid,
	pub path_list: Vec<String>,
}

/// Tagged identifier union. Path resolution is delegated here: SPIDs return
/// their single path, MPIDs the whole list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeIdentifier {
	Spid(SinglePathId),
	Mpid(MultiPathId),
}

impl NodeIdentifier {
	pub fn spid(device_uid: Uid, node_uid: Uid, full_path: impl Into<String>) -> Self {
		Self::Spid(SinglePathId {
			device_uid,
			node_uid,
			path_uid: node_uid,
			full_path: full_path.into(),
			parent_guid: None,
		})
	}

	pub fn mpid(device_uid: Uid, node_uid: Uid, path_list: Vec<String>) -> Self {
		Self::Mpid(MultiPathId {
			device_uid,
			node_uid,
			path_list,
		})
	}

	pub fn device_uid(&self) -> Uid {
		match self {
			Self::Spid(spid) => spid.device_uid,
			Self::Mpid(mpid) => mpid.device_uid,
		}
	}

	pub fn node_uid(&self) -> Uid {
		match self {
			Self::Spid(spid) => spid.node_uid,
			Self::Mpid(mpid) => mpid.node_uid,
		}
	}

	pub fn guid(&self) -> Guid {
		match self {
			Self::Spid(spid) => Guid::with_path(spid.device_uid, spid.node_uid, spid.path_uid),
			Self::Mpid(mpid) => Guid::new(mpid.device_uid, mpid.node_uid),
		}
	}

	pub fn path_list(&self) -> Vec<&str> {
		match self {
			Self::Spid(spid) => vec![spid.full_path.as_str()],
			Self::Mpid(mpid) => mpid.path_list.iter().map(String::as_str).collect(),
		}
	}

	/// The canonical path: an SPID's only path, or an MPID's first.
	pub fn first_path(&self) -> Option<&str> {
		match self {
			Self::Spid(spid) => Some(spid.full_path.as_str()),
			Self::Mpid(mpid) => mpid.path_list.first().map(String::as_str),
		}
	}
}

impl fmt::Display for NodeIdentifier {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.first_path() {
			Some(path) => write!(f, "{} ({})", self.guid(), path),
			None => write!(f, "{}", self.guid()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn guid_round_trips() {
		let guid = Guid::with_path(Uid(2), Uid(107), Uid(107));
		let parsed: Guid = guid.to_string().parse().unwrap();
		assert_eq!(parsed, guid);

		let short = Guid::new(Uid(3), Uid(55));
		let parsed: Guid = short.to_string().parse().unwrap();
		assert_eq!(parsed, short);
	}

	#[test]
	fn malformed_guids_are_rejected() {
		assert!("".parse::<Guid>().is_err());
		assert!("1".parse::<Guid>().is_err());
		assert!("a:b".parse::<Guid>().is_err());
		assert!("1:2:3:4".parse::<Guid>().is_err());
	}

	#[test]
	fn spid_resolves_one_path() {
		let id = NodeIdentifier::spid(Uid(2), Uid(10), "/a/b");
		assert_eq!(id.path_list(), vec!["/a/b"]);
	}

	#[test]
	fn mpid_resolves_all_paths() {
		let id = NodeIdentifier::mpid(Uid(4), Uid(11), vec!["/x".into(), "/shared/x".into()]);
		assert_eq!(id.path_list().len(), 2);
	}
}
