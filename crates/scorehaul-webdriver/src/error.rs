use scorehaul_adapters::SessionError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WebDriverError>;

#[derive(Debug, Error)]
pub enum WebDriverError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("webdriver error (status {status}) {error}: {message}")]
    Command {
        status: u16,
        error: String,
        message: String,
    },

    #[error("malformed webdriver response: {0}")]
    Malformed(String),
}

impl From<WebDriverError> for SessionError {
    fn from(err: WebDriverError) -> Self {
        match err {
            WebDriverError::Transport(err) if err.is_timeout() => {
                SessionError::Timeout(err.to_string())
            }
            WebDriverError::Transport(err) if err.is_connect() => {
                SessionError::SessionLost(format!("driver unreachable: {err}"))
            }
            WebDriverError::Transport(err) => SessionError::Unavailable(err.to_string()),
            WebDriverError::Command { error, message, .. } => map_error_code(&error, message),
            WebDriverError::Malformed(message) => SessionError::Protocol(message),
        }
    }
}

/// Maps a W3C error code onto the session taxonomy.
pub fn map_error_code(code: &str, message: String) -> SessionError {
    match code {
        "timeout" | "script timeout" => SessionError::Timeout(message),
        "stale element reference" => SessionError::StaleElement(message),
        "no such element" => SessionError::NoSuchElement(message),
        "element not interactable" | "element click intercepted" => {
            SessionError::NotInteractable(message)
        }
        "invalid session id" | "no such window" | "session not created" => {
            SessionError::SessionLost(message)
        }
        "unknown error" if message.contains("net::ERR_") => SessionError::Navigation {
            url: String::new(),
            message,
        },
        "invalid argument" | "invalid selector" | "unknown command" | "unknown method" => {
            SessionError::Protocol(message)
        }
        _ => SessionError::Unavailable(format!("{code}: {message}")),
    }
}
