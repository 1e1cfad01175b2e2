use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown media kind: {0:?} (expected image, video or audio)")]
pub struct ParseMediaKindError(pub String);
