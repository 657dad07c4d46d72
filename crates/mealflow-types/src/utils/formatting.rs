//! String formatting helpers for log output.

/// Truncates an identifier for display in log fields.
///
/// Order and event ids are normally UUIDs, where the first eight
/// characters are enough to correlate log lines without flooding the
/// output. Ids also arrive from request paths, so the cut lands on a
/// char boundary rather than a byte offset.
pub fn truncate_id(id: &str) -> String {
	match id.char_indices().nth(8) {
		Some((cut, _)) => format!("{}..", &id[..cut]),
		None => id.to_string(),
	}
}
