/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Per-video monotonic sequence number. The first annotation of a video is `1`;
/// `0` means "nothing seen yet".
pub type OrderKey = i64;

/// Opaque video identifier issued by the media pipeline.
pub type VideoId = String;

/// Opaque identity issued by the external identity provider.
pub type IdentityId = String;

/// Globally unique annotation identifier (UUID v7).
pub type AnnotationId = uuid::Uuid;

/// Identifier of one live connection.
pub type SessionId = uuid::Uuid;
