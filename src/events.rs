/// User-facing feedback emitted around lifecycle operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Progress {
        title: String,
    },
    Success {
        title: String,
        message: Option<String>,
    },
    Failure {
        title: String,
        message: String,
    },
}

impl SessionEvent {
    pub fn progress(title: impl Into<String>) -> Self {
        SessionEvent::Progress {
            title: title.into(),
        }
    }

    pub fn success(title: impl Into<String>, message: Option<String>) -> Self {
        SessionEvent::Success {
            title: title.into(),
            message,
        }
    }

    pub fn failure(title: impl Into<String>, message: impl Into<String>) -> Self {
        SessionEvent::Failure {
            title: title.into(),
            message: message.into(),
        }
    }
}

pub trait SessionObserver: Send + Sync {
    fn on_event(&self, event: &SessionEvent);
}

/// Routes events to the `log` facade.
#[derive(Default)]
pub struct LogObserver;

impl SessionObserver for LogObserver {
    fn on_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::Progress { title } => log::debug!("{}", title),
            SessionEvent::Success { title, message } => match message {
                Some(message) => log::info!("{}: {}", title, message),
                None => log::info!("{}", title),
            },
            SessionEvent::Failure { title, message } => log::warn!("{}: {}", title, message),
        }
    }
}
