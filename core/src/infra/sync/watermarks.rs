//! Pull cookies and the namespace watermark
//!
//! The watermark of a namespace is the highest causal version it holds,
//! across every syncable row and every tombstone. Packed HLCs sort as
//! strings, so comparisons here are plain string comparisons.

use sea_orm::DbErr;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{syncable::SyncableRegistry, tenant::TenantTx, tombstone};

/// Watermark of a namespace nothing was written to yet
pub const ZERO_WATERMARK: &str = "0";

/// A client's last-seen watermark, as sent on the wire
///
/// Clients may send a string, an integer, or null; `null`, `0`, `""` and
/// `"0"` all denote a fresh client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cookie {
	Int(i64),
	Str(String),
}

impl Cookie {
	/// The watermark this cookie stands for, `None` when the client is fresh
	pub fn watermark(&self) -> Option<String> {
		match self {
			Cookie::Int(0) => None,
			Cookie::Int(n) => Some(n.to_string()),
			Cookie::Str(s) if s.is_empty() || s == ZERO_WATERMARK => None,
			Cookie::Str(s) => Some(s.clone()),
		}
	}
}

impl fmt::Display for Cookie {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Cookie::Int(n) => write!(f, "{n}"),
			Cookie::Str(s) => f.write_str(s),
		}
	}
}

/// Normalize an optional wire cookie, `None` meaning a fresh sync
pub fn normalize(cookie: Option<&Cookie>) -> Option<String> {
	cookie.and_then(Cookie::watermark)
}

/// Highest causal version stored in the namespace, or [`ZERO_WATERMARK`]
pub async fn current_watermark(tx: &TenantTx, entities: &SyncableRegistry) -> Result<String, DbErr> {
	let mut watermark = tombstone::max_version(tx).await?;

	for entity in entities.iter() {
		if let Some(version) = entity.watermark(tx).await? {
			if watermark.as_ref().map_or(true, |current| version > *current) {
				watermark = Some(version);
			}
		}
	}

	Ok(watermark.unwrap_or_else(|| ZERO_WATERMARK.to_string()))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::infra::sync::Hlc;

	#[test]
	fn test_fresh_cookies() {
		for cookie in [
			None,
			Some(Cookie::Int(0)),
			Some(Cookie::Str(String::new())),
			Some(Cookie::Str("0".into())),
		] {
			assert_eq!(normalize(cookie.as_ref()), None, "{cookie:?}");
		}

		assert_eq!(normalize(Some(&Cookie::Int(7))), Some("7".into()));
	}

	#[test]
	fn test_wire_forms() {
		let int: Option<Cookie> = serde_json::from_str("5").unwrap();
		let string: Option<Cookie> = serde_json::from_str(r#""0000000000005:0000:n""#).unwrap();
		let null: Option<Cookie> = serde_json::from_str("null").unwrap();

		assert_eq!(int, Some(Cookie::Int(5)));
		assert_eq!(string, Some(Cookie::Str("0000000000005:0000:n".into())));
		assert_eq!(null, None);
	}

	#[test]
	fn test_zero_sorts_before_every_version() {
		let earliest = Hlc::new(0, 0, "a").pack();
		assert!(ZERO_WATERMARK < earliest.as_str());
	}
}
