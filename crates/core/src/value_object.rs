//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects have no identity and are immutable once handed out: job
/// progress and the broadcast job state are the main examples. To "modify"
/// one, build a new value.
///
/// ```ignore
/// #[derive(Debug, Clone, PartialEq, Eq)]
/// struct Progress { processed: u64, total: u64 }
///
/// impl ValueObject for Progress {}
///
/// assert_eq!(Progress { processed: 1, total: 2 }, Progress { processed: 1, total: 2 });
/// ```
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
