//! Page-level helpers run right after navigation.

use std::time::Duration;

use tracing::debug;

use crate::session::{AutomationSession, Condition, Locator, SessionError};

/// Opens `url` and waits for the document to finish loading. A load that never
/// completes is a transient timeout.
pub async fn open_ready(
    session: &mut dyn AutomationSession,
    url: &str,
    timeout: Duration,
) -> Result<(), SessionError> {
    session.open(url).await?;
    if session
        .wait_for_condition(&Condition::ReadyStateComplete, timeout)
        .await?
    {
        Ok(())
    } else {
        Err(SessionError::Timeout(format!(
            "{url} not ready after {}ms",
            timeout.as_millis()
        )))
    }
}

/// Clicks the consent button if one shows up within `timeout`. Returns whether a
/// click landed; a missing or stubborn dialog is not an error.
pub async fn dismiss_consent(
    session: &mut dyn AutomationSession,
    button: Option<&Locator>,
    timeout: Duration,
) -> Result<bool, SessionError> {
    let Some(button) = button else {
        return Ok(false);
    };
    match session
        .wait_for_condition(&Condition::Clickable(button.clone()), timeout)
        .await
    {
        Ok(true) => {}
        Ok(false) => return Ok(false),
        Err(err) if err.is_fatal() => return Err(err),
        Err(err) => {
            debug!(error = %err, "consent check failed");
            return Ok(false);
        }
    }

    for candidate in session.find_all(button).await? {
        if !session.is_displayed(&candidate).await.unwrap_or(false) {
            continue;
        }
        match session.click(&candidate).await {
            Ok(()) => {
                debug!("consent dialog dismissed");
                return Ok(true);
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => debug!(error = %err, "consent click refused"),
        }
    }
    Ok(false)
}
