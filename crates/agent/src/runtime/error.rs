/// What a runtime failure means, decided once where the error enters the
/// agent instead of by matching message text at every call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The container (or other object) does not exist.
    NotFound,
    ImageNotFound,
    /// A container with that name already exists.
    NameInUse,
    RemoveRunning,
    RemoveRestarting,
    ManifestUnknown,
    ContainerDead,
    Other,
}

/// Disposition of a runtime call after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    AlreadyAbsent,
    Retryable(String),
    Fatal(String),
}

pub const MSG_MANIFEST_UNKNOWN: &str = "Could not find a valid image of this app, please try to build the image again";
pub const MSG_STOPPED_FORCEFULLY: &str = "The app has been stopped forcefully";
pub const MSG_CONTAINER_EXITED: &str = "The container abruptly exited.";
pub const MSG_IMAGE_NOT_FOUND: &str = "Image was not found, please try removing and running the app again.";

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct RuntimeError {
    kind: ErrorKind,
    message: String,
}

impl RuntimeError {
    /// Classify a daemon response.
    pub fn from_response(status: Option<u16>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self { kind: classify(status, &message), message }
    }

    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Other, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Reclassify a failure raised while fetching an image. The registry
    /// reports a missing repository or tag as a plain 404, which would
    /// otherwise read as a missing container.
    pub fn in_image_pull(self) -> Self {
        match self.kind {
            ErrorKind::NotFound => Self { kind: ErrorKind::ImageNotFound, ..self },
            _ => self,
        }
    }

    /// Disposition of a failed container removal.
    pub fn removal_outcome(&self, force: bool) -> Outcome {
        match self.kind {
            ErrorKind::NotFound => Outcome::AlreadyAbsent,
            ErrorKind::RemoveRunning if !force => Outcome::Success,
            ErrorKind::RemoveRestarting if !force => Outcome::Retryable(self.message.clone()),
            _ => Outcome::Fatal(self.message.clone()),
        }
    }

    /// Disposition of a failed image removal.
    pub fn image_removal_outcome(&self) -> Outcome {
        match self.kind {
            ErrorKind::NotFound | ErrorKind::ImageNotFound => Outcome::AlreadyAbsent,
            _ => Outcome::Fatal(self.message.clone()),
        }
    }

    /// Disposition of a failed container run; fatal reasons are the
    /// user-facing text.
    pub fn run_outcome(&self) -> Outcome {
        match self.kind {
            ErrorKind::NameInUse => Outcome::Retryable(self.message.clone()),
            ErrorKind::ManifestUnknown => Outcome::Fatal(MSG_MANIFEST_UNKNOWN.to_string()),
            ErrorKind::NotFound | ErrorKind::ContainerDead => Outcome::Fatal(MSG_STOPPED_FORCEFULLY.to_string()),
            ErrorKind::ImageNotFound => Outcome::Fatal(MSG_IMAGE_NOT_FOUND.to_string()),
            _ => Outcome::Fatal(self.message.clone()),
        }
    }
}

fn classify(status: Option<u16>, message: &str) -> ErrorKind {
    if message.contains("is already in use by container") {
        ErrorKind::NameInUse
    } else if message.contains("You cannot remove a running container") {
        ErrorKind::RemoveRunning
    } else if message.contains("You cannot remove a restarting container") {
        ErrorKind::RemoveRestarting
    } else if message.contains("manifest unknown") {
        ErrorKind::ManifestUnknown
    } else if message.contains("container which is dead") {
        ErrorKind::ContainerDead
    } else if message.contains("No such image") {
        ErrorKind::ImageNotFound
    } else if status == Some(404)
        || message.contains("404 Client Error: Not Found")
        || message.contains("No such container")
    {
        ErrorKind::NotFound
    } else {
        ErrorKind::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_daemon_messages() {
        let cases = [
            (Some(409), "Conflict. The container name \"/app\" is already in use by container \"abc\"", ErrorKind::NameInUse),
            (Some(409), "You cannot remove a running container abc. Stop the container before attempting removal", ErrorKind::RemoveRunning),
            (Some(409), "You cannot remove a restarting container abc", ErrorKind::RemoveRestarting),
            (Some(404), "manifest unknown: manifest unknown", ErrorKind::ManifestUnknown),
            (Some(404), "No such image: registry/app:latest", ErrorKind::ImageNotFound),
            (Some(404), "No such container: app", ErrorKind::NotFound),
            (None, "404 Client Error: Not Found", ErrorKind::NotFound),
            (Some(500), "cannot start a container which is dead", ErrorKind::ContainerDead),
            (Some(500), "disk full", ErrorKind::Other),
        ];
        for (status, message, kind) in cases {
            assert_eq!(RuntimeError::from_response(status, message).kind(), kind, "{message}");
        }
    }

    #[test]
    fn removal_dispositions() {
        let missing = RuntimeError::from_response(Some(404), "No such container: app");
        assert_eq!(missing.removal_outcome(true), Outcome::AlreadyAbsent);
        let running = RuntimeError::from_response(Some(409), "You cannot remove a running container app");
        assert_eq!(running.removal_outcome(false), Outcome::Success);
        assert!(matches!(running.removal_outcome(true), Outcome::Fatal(_)));
        let restarting = RuntimeError::from_response(Some(409), "You cannot remove a restarting container app");
        assert!(matches!(restarting.removal_outcome(false), Outcome::Retryable(_)));
    }

    #[test]
    fn missing_image_during_pull_is_not_a_stopped_app() {
        let err = RuntimeError::from_response(Some(404), "pull access denied for registry/apps/a, repository does not exist");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = err.in_image_pull();
        assert_eq!(err.kind(), ErrorKind::ImageNotFound);
        assert_eq!(err.run_outcome(), Outcome::Fatal(MSG_IMAGE_NOT_FOUND.to_string()));

        let manifest = RuntimeError::from_response(Some(404), "manifest unknown").in_image_pull();
        assert_eq!(manifest.kind(), ErrorKind::ManifestUnknown);
    }

    #[test]
    fn run_failures_get_user_facing_text() {
        let manifest = RuntimeError::from_response(Some(404), "manifest unknown");
        assert_eq!(manifest.run_outcome(), Outcome::Fatal(MSG_MANIFEST_UNKNOWN.into()));
        let dead = RuntimeError::from_response(Some(500), "container which is dead");
        assert_eq!(dead.run_outcome(), Outcome::Fatal(MSG_STOPPED_FORCEFULLY.into()));
        let in_use = RuntimeError::from_response(Some(409), "is already in use by container x");
        assert!(matches!(in_use.run_outcome(), Outcome::Retryable(_)));
    }
}
