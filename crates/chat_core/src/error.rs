use backend::BackendError;
use shared::domain::MediaKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("no active session")]
    AuthRequired,
    #[error("conversation or message not found")]
    NotFound,
    #[error("access to {kind} media was refused")]
    PermissionDenied { kind: MediaKind },
    #[error("message has neither text nor media")]
    EmptyMessage,
    #[error("media upload failed: {0}")]
    UploadFailed(String),
    #[error("message could not be stored")]
    SendFailed,
    #[error(transparent)]
    Backend(BackendError),
}

impl ChatError {
    /// Text shown to the user when the operation is aborted.
    pub fn alert_text(&self) -> String {
        match self {
            ChatError::AuthRequired => "Debes iniciar sesión para continuar.".to_string(),
            ChatError::NotFound => "No se encontró la conversación.".to_string(),
            ChatError::PermissionDenied { kind } => match kind {
                MediaKind::Image => {
                    "Necesitamos acceso a tus fotos para enviar imágenes.".to_string()
                }
                MediaKind::Video => {
                    "Necesitamos acceso a tu galería para enviar videos.".to_string()
                }
                MediaKind::Audio => {
                    "Necesitamos acceso al micrófono para grabar audio.".to_string()
                }
            },
            ChatError::EmptyMessage => "Escribe un mensaje o adjunta un archivo.".to_string(),
            ChatError::UploadFailed(_) => "No se pudo subir el archivo.".to_string(),
            ChatError::SendFailed => "No se pudo enviar el mensaje.".to_string(),
            ChatError::Backend(_) => "Ocurrió un error. Inténtalo de nuevo.".to_string(),
        }
    }
}

impl From<BackendError> for ChatError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unauthorized(_) => ChatError::AuthRequired,
            BackendError::NotFound => ChatError::NotFound,
            other => ChatError::Backend(other),
        }
    }
}
