//! Failure types for the pagemap operations.

/// Failure establishing a mapping.
///
/// The only way `map` can currently fail is running the physical
/// allocator out of memory while materializing an absent intermediate
/// table. Wrapped in a dedicated type (rather than re-exporting
/// [`corvid_mem::OomError`] directly) so a future fallible condition in
/// `map` has somewhere to go without changing every caller's error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapError(pub corvid_mem::OomError);

impl From<corvid_mem::OomError> for MapError {
	fn from(err: corvid_mem::OomError) -> Self {
		Self(err)
	}
}

/// Failure tearing down a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmapError {
	/// An intermediate table on the path to the requested address was
	/// absent, or the leaf itself was already not present.
	NotMapped,
}

/// Failure updating an existing mapping's flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemapError {
	/// Same conditions as [`UnmapError::NotMapped`].
	NotMapped,
}
