//! [`AutomationSession`] backed by a W3C WebDriver endpoint (chromedriver, geckodriver,
//! a Selenium grid) spoken to over plain HTTP.

pub mod error;

pub use error::{map_error_code, Result, WebDriverError};

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use scorehaul_adapters::{
    check_condition, AutomationSession, Condition, ElementHandle, Locator, ReadyState,
    SessionError, SessionFactory,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// W3C element reference key.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct WebDriverConfig {
    pub endpoint: String,
    pub headless: bool,
    pub user_agent: Option<String>,
    pub window_width: u32,
    pub window_height: u32,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WebDriverConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9515".to_string(),
            headless: true,
            user_agent: None,
            window_width: 1920,
            window_height: 1080,
            request_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Chrome capabilities for a new session: fixed window, automation flag hidden,
/// user agent overridden.
pub fn chrome_capabilities(config: &WebDriverConfig) -> JsonValue {
    let mut args = vec![
        format!("--window-size={},{}", config.window_width, config.window_height),
        "--disable-blink-features=AutomationControlled".to_string(),
        "--disable-gpu".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        format!(
            "--user-agent={}",
            config.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT)
        ),
    ];
    if config.headless {
        args.push("--headless=new".to_string());
    }
    json!({
        "capabilities": {
            "alwaysMatch": {
                "browserName": "chrome",
                "pageLoadStrategy": "normal",
                "goog:chromeOptions": {
                    "args": args,
                    "excludeSwitches": ["enable-automation"],
                }
            }
        }
    })
}

#[derive(Debug, Deserialize)]
struct Envelope {
    value: JsonValue,
}

#[derive(Debug, Deserialize)]
struct ErrorValue {
    error: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Clone)]
struct Transport {
    client: reqwest::Client,
    endpoint: String,
}

impl Transport {
    fn new(config: &WebDriverConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
        })
    }

    async fn command(&self, method: Method, path: &str, body: Option<JsonValue>) -> Result<JsonValue> {
        let url = format!("{}{}", self.endpoint, path);
        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        let envelope: Envelope = serde_json::from_str(&text)
            .map_err(|err| WebDriverError::Malformed(format!("{url}: {err}")))?;
        if !status.is_success() {
            let detail: ErrorValue = serde_json::from_value(envelope.value).map_err(|err| {
                WebDriverError::Malformed(format!("{url} returned {status} without error body: {err}"))
            })?;
            return Err(WebDriverError::Command {
                status: status.as_u16(),
                error: detail.error,
                message: detail.message,
            });
        }
        Ok(envelope.value)
    }
}

pub struct WebDriverSession {
    transport: Transport,
    session_id: String,
    poll_interval: Duration,
}

impl WebDriverSession {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn call(
        &self,
        method: Method,
        suffix: &str,
        body: Option<JsonValue>,
    ) -> std::result::Result<JsonValue, SessionError> {
        let path = format!("/session/{}{}", self.session_id, suffix);
        Ok(self.transport.command(method, &path, body).await?)
    }

    async fn locate(
        &self,
        suffix: &str,
        locator: &Locator,
    ) -> std::result::Result<Vec<ElementHandle>, SessionError> {
        let value = self
            .call(
                Method::POST,
                suffix,
                Some(json!({ "using": "css selector", "value": locator.as_css() })),
            )
            .await?;
        parse_elements(value)
    }
}

fn parse_elements(value: JsonValue) -> std::result::Result<Vec<ElementHandle>, SessionError> {
    let JsonValue::Array(items) = value else {
        return Err(SessionError::Protocol("element lookup did not return a list".into()));
    };
    items
        .iter()
        .map(|item| {
            item.get(ELEMENT_KEY)
                .and_then(JsonValue::as_str)
                .map(ElementHandle::new)
                .ok_or_else(|| SessionError::Protocol(format!("not an element reference: {item}")))
        })
        .collect()
}

fn element_arg(element: &ElementHandle) -> JsonValue {
    json!({ ELEMENT_KEY: element.as_str() })
}

#[async_trait]
impl AutomationSession for WebDriverSession {
    async fn open(&mut self, url: &str) -> std::result::Result<(), SessionError> {
        match self.call(Method::POST, "/url", Some(json!({ "url": url }))).await {
            Ok(_) => Ok(()),
            Err(SessionError::Navigation { message, .. }) => Err(SessionError::Navigation {
                url: url.to_string(),
                message,
            }),
            Err(err) => Err(err),
        }
    }

    async fn refresh(&mut self) -> std::result::Result<(), SessionError> {
        self.call(Method::POST, "/refresh", Some(json!({}))).await.map(|_| ())
    }

    async fn ready_state(&mut self) -> std::result::Result<ReadyState, SessionError> {
        let value = self
            .execute_script("return document.readyState;", Vec::new())
            .await?;
        Ok(value.as_str().map_or(ReadyState::Unknown, ReadyState::parse))
    }

    async fn execute_script(
        &mut self,
        script: &str,
        args: Vec<JsonValue>,
    ) -> std::result::Result<JsonValue, SessionError> {
        self.call(
            Method::POST,
            "/execute/sync",
            Some(json!({ "script": script, "args": args })),
        )
        .await
    }

    async fn find_all(&mut self, locator: &Locator) -> std::result::Result<Vec<ElementHandle>, SessionError> {
        self.locate("/elements", locator).await
    }

    async fn find_within(
        &mut self,
        scope: &ElementHandle,
        locator: &Locator,
    ) -> std::result::Result<Vec<ElementHandle>, SessionError> {
        self.locate(&format!("/element/{}/elements", scope.as_str()), locator)
            .await
    }

    async fn text(&mut self, element: &ElementHandle) -> std::result::Result<String, SessionError> {
        let value = self
            .call(Method::GET, &format!("/element/{}/text", element.as_str()), None)
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn attribute(
        &mut self,
        element: &ElementHandle,
        name: &str,
    ) -> std::result::Result<Option<String>, SessionError> {
        let value = self
            .call(
                Method::GET,
                &format!("/element/{}/attribute/{}", element.as_str(), name),
                None,
            )
            .await?;
        Ok(value.as_str().map(str::to_string))
    }

    async fn is_displayed(&mut self, element: &ElementHandle) -> std::result::Result<bool, SessionError> {
        let value = self
            .call(
                Method::GET,
                &format!("/element/{}/displayed", element.as_str()),
                None,
            )
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn click(&mut self, element: &ElementHandle) -> std::result::Result<(), SessionError> {
        let native = self
            .call(
                Method::POST,
                &format!("/element/{}/click", element.as_str()),
                Some(json!({})),
            )
            .await;
        match native {
            Ok(_) => Ok(()),
            Err(SessionError::NotInteractable(reason)) => {
                debug!(element = element.as_str(), %reason, "native click refused, using script click");
                self.execute_script("arguments[0].click();", vec![element_arg(element)])
                    .await
                    .map(|_| ())
            }
            Err(err) => Err(err),
        }
    }

    async fn wait_for_condition(
        &mut self,
        condition: &Condition,
        timeout: Duration,
    ) -> std::result::Result<bool, SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            match check_condition(self, condition).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => debug!(error = %err, "condition check failed, polling again"),
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn quit(&mut self) -> std::result::Result<(), SessionError> {
        self.call(Method::DELETE, "", None).await.map(|_| ())
    }
}

/// Starts a fresh browser session per call.
#[derive(Debug, Clone)]
pub struct WebDriverFactory {
    config: WebDriverConfig,
    transport: Transport,
}

impl WebDriverFactory {
    pub fn new(config: WebDriverConfig) -> Result<Self> {
        let transport = Transport::new(&config)?;
        Ok(Self { config, transport })
    }

    pub fn config(&self) -> &WebDriverConfig {
        &self.config
    }
}

#[async_trait]
impl SessionFactory for WebDriverFactory {
    async fn create(&self) -> std::result::Result<Box<dyn AutomationSession>, SessionError> {
        let value = self
            .transport
            .command(Method::POST, "/session", Some(chrome_capabilities(&self.config)))
            .await
            .map_err(|err| {
                warn!(endpoint = %self.config.endpoint, error = %err, "webdriver session start failed");
                SessionError::Startup(err.to_string())
            })?;
        let session_id = value
            .get("sessionId")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| SessionError::Startup("new session response had no sessionId".into()))?
            .to_string();

        info!(session_id = %session_id, headless = self.config.headless, "webdriver session started");
        Ok(Box::new(WebDriverSession {
            transport: self.transport.clone(),
            session_id,
            poll_interval: self.config.poll_interval,
        }))
    }
}
