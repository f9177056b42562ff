//! Offline [`AutomationSession`] over saved HTML pages, used for replay runs and tests.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::session::{
    check_condition, AutomationSession, Condition, ElementHandle, Locator, ReadyState,
    SessionError, SessionFactory,
};

/// `index.json` in a fixture directory: URL -> HTML file relative to the directory.
#[derive(Debug, Deserialize)]
struct FixtureIndex {
    pages: BTreeMap<String, String>,
}

/// Loads every page listed in `<dir>/index.json`.
pub fn load_fixture_pages(dir: impl AsRef<Path>) -> Result<HashMap<String, String>> {
    let dir = dir.as_ref();
    let index_path = dir.join("index.json");
    let data = fs::read_to_string(&index_path)
        .with_context(|| format!("reading {}", index_path.display()))?;
    let index: FixtureIndex = serde_json::from_str(&data)
        .with_context(|| format!("parsing {}", index_path.display()))?;

    let mut pages = HashMap::with_capacity(index.pages.len());
    for (url, file) in index.pages {
        let path = dir.join(&file);
        let html = fs::read_to_string(&path)
            .with_context(|| format!("reading fixture page {}", path.display()))?;
        pages.insert(url, html);
    }
    Ok(pages)
}

/// A session whose documents are static HTML. Nothing is clickable, scripts are no-ops
/// and every page is immediately complete. Unknown URLs fail navigation.
#[derive(Debug, Clone)]
pub struct HtmlDocumentSession {
    pages: Arc<HashMap<String, String>>,
    current: Option<String>,
    closed: bool,
}

impl HtmlDocumentSession {
    pub fn new(pages: Arc<HashMap<String, String>>) -> Self {
        Self {
            pages,
            current: None,
            closed: false,
        }
    }

    pub fn from_pages<I, U, H>(pages: I) -> Self
    where
        I: IntoIterator<Item = (U, H)>,
        U: Into<String>,
        H: Into<String>,
    {
        Self::new(Arc::new(
            pages
                .into_iter()
                .map(|(url, html)| (url.into(), html.into()))
                .collect(),
        ))
    }

    pub fn current_url(&self) -> Option<&str> {
        self.current.as_deref()
    }

    fn html(&self) -> Result<&str, SessionError> {
        if self.closed {
            return Err(SessionError::SessionLost("session already quit".into()));
        }
        let url = self
            .current
            .as_deref()
            .ok_or_else(|| SessionError::Unavailable("no document open".into()))?;
        self.pages
            .get(url)
            .map(String::as_str)
            .ok_or_else(|| SessionError::SessionLost(format!("document {url} vanished")))
    }

    /// Parses the current document and hands `f` every element in document order.
    fn with_elements<R>(
        &self,
        f: impl FnOnce(&[ElementRef<'_>]) -> Result<R, SessionError>,
    ) -> Result<R, SessionError> {
        let document = Html::parse_document(self.html()?);
        let everything = parse_selector("*")?;
        let elements: Vec<ElementRef<'_>> = document.select(&everything).collect();
        f(&elements)
    }

    fn with_element<R>(
        &self,
        handle: &ElementHandle,
        f: impl FnOnce(ElementRef<'_>) -> R,
    ) -> Result<R, SessionError> {
        self.with_elements(|elements| {
            let element = resolve(elements, handle)?;
            Ok(f(element))
        })
    }

    fn select(
        &self,
        scope: Option<&ElementHandle>,
        locator: &Locator,
    ) -> Result<Vec<ElementHandle>, SessionError> {
        let selector = parse_selector(locator.as_css())?;
        self.with_elements(|elements| {
            let positions: HashMap<_, usize> = elements
                .iter()
                .enumerate()
                .map(|(index, element)| (element.id(), index))
                .collect();
            let matches: Vec<ElementRef<'_>> = match scope {
                Some(handle) => resolve(elements, handle)?.select(&selector).collect(),
                None => elements
                    .iter()
                    .copied()
                    .filter(|element| selector.matches(element))
                    .collect(),
            };
            Ok(matches
                .into_iter()
                .filter_map(|element| positions.get(&element.id()).copied())
                .map(handle_for)
                .collect())
        })
    }
}

fn parse_selector(css: &str) -> Result<Selector, SessionError> {
    Selector::parse(css).map_err(|err| SessionError::Protocol(format!("invalid selector {css}: {err:?}")))
}

fn handle_for(index: usize) -> ElementHandle {
    ElementHandle::new(format!("node-{index}"))
}

fn resolve<'a, 'b>(
    elements: &'b [ElementRef<'a>],
    handle: &ElementHandle,
) -> Result<ElementRef<'a>, SessionError> {
    handle
        .as_str()
        .strip_prefix("node-")
        .and_then(|index| index.parse::<usize>().ok())
        .and_then(|index| elements.get(index).copied())
        .ok_or_else(|| SessionError::StaleElement(handle.as_str().to_string()))
}

fn displayed(element: ElementRef<'_>) -> bool {
    let value = element.value();
    if value.attr("hidden").is_some() {
        return false;
    }
    let style = value
        .attr("style")
        .unwrap_or_default()
        .replace(' ', "")
        .to_ascii_lowercase();
    !style.contains("display:none") && !style.contains("visibility:hidden")
}

#[async_trait]
impl AutomationSession for HtmlDocumentSession {
    async fn open(&mut self, url: &str) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::SessionLost("session already quit".into()));
        }
        if !self.pages.contains_key(url) {
            return Err(SessionError::Navigation {
                url: url.to_string(),
                message: "no saved document for this URL".into(),
            });
        }
        self.current = Some(url.to_string());
        Ok(())
    }

    async fn refresh(&mut self) -> Result<(), SessionError> {
        self.html().map(|_| ())
    }

    async fn ready_state(&mut self) -> Result<ReadyState, SessionError> {
        self.html().map(|_| ReadyState::Complete)
    }

    async fn execute_script(
        &mut self,
        script: &str,
        _args: Vec<JsonValue>,
    ) -> Result<JsonValue, SessionError> {
        self.html()?;
        if script.contains("document.readyState") {
            return Ok(JsonValue::String("complete".into()));
        }
        Ok(JsonValue::Null)
    }

    async fn find_all(&mut self, locator: &Locator) -> Result<Vec<ElementHandle>, SessionError> {
        self.select(None, locator)
    }

    async fn find_within(
        &mut self,
        scope: &ElementHandle,
        locator: &Locator,
    ) -> Result<Vec<ElementHandle>, SessionError> {
        self.select(Some(scope), locator)
    }

    async fn text(&mut self, element: &ElementHandle) -> Result<String, SessionError> {
        self.with_element(element, |el| {
            el.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
        })
    }

    async fn attribute(
        &mut self,
        element: &ElementHandle,
        name: &str,
    ) -> Result<Option<String>, SessionError> {
        self.with_element(element, |el| el.value().attr(name).map(str::to_string))
    }

    async fn is_displayed(&mut self, element: &ElementHandle) -> Result<bool, SessionError> {
        self.with_element(element, displayed)
    }

    async fn click(&mut self, element: &ElementHandle) -> Result<(), SessionError> {
        self.with_element(element, |_| ())?;
        Err(SessionError::NotInteractable(format!(
            "{} belongs to a static document",
            element.as_str()
        )))
    }

    async fn wait_for_condition(
        &mut self,
        condition: &Condition,
        _timeout: Duration,
    ) -> Result<bool, SessionError> {
        // Static documents never change, so one check decides the wait.
        check_condition(self, condition).await
    }

    async fn quit(&mut self) -> Result<(), SessionError> {
        self.closed = true;
        self.current = None;
        Ok(())
    }
}

/// Hands out document sessions over one shared page set.
#[derive(Debug, Clone)]
pub struct HtmlDocumentFactory {
    pages: Arc<HashMap<String, String>>,
}

impl HtmlDocumentFactory {
    pub fn new(pages: HashMap<String, String>) -> Self {
        Self {
            pages: Arc::new(pages),
        }
    }

    pub fn from_fixture_dir(dir: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_fixture_pages(dir)?))
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

#[async_trait]
impl SessionFactory for HtmlDocumentFactory {
    async fn create(&self) -> Result<Box<dyn AutomationSession>, SessionError> {
        Ok(Box::new(HtmlDocumentSession::new(Arc::clone(&self.pages))))
    }
}
