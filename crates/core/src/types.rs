/// Backend-assigned job identifiers are opaque strings (UUIDs in practice).
pub type JobId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
