use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActionParseError {
    #[error("unknown verb <{0}>")]
    UnknownVerb(String),

    #[error("malformed action document: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Play,
    Say,
    Gather,
}

impl FromStr for Verb {
    type Err = ActionParseError;

    fn from_str(s: &str) -> Result<Verb, ActionParseError> {
        match s.to_ascii_lowercase().as_str() {
            "play" => Ok(Verb::Play),
            "say" => Ok(Verb::Say),
            "gather" => Ok(Verb::Gather),
            _ => Err(ActionParseError::UnknownVerb(s.to_string())),
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Verb::Play => write!(f, "play"),
            Verb::Say => write!(f, "say"),
            Verb::Gather => write!(f, "gather"),
        }
    }
}

/// One verb of an action document: the tag, its text body and its
/// attributes (`action`, `numDigits`, `timeout`, ...).
#[derive(Debug, Clone)]
pub struct Action {
    pub verb: Verb,
    pub text: String,
    pub attributes: HashMap<String, String>,
}

impl Action {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

struct Cursor<'a> {
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn skip_ws(&mut self) {
        self.rest = self.rest.trim_start();
    }

    fn eat(&mut self, prefix: &str) -> bool {
        if let Some(rest) = self.rest.strip_prefix(prefix) {
            self.rest = rest;
            true
        } else {
            false
        }
    }

    fn take_until(&mut self, pat: &str) -> Option<&'a str> {
        let idx = self.rest.find(pat)?;
        let (head, tail) = self.rest.split_at(idx);
        self.rest = &tail[pat.len()..];
        Some(head)
    }

    fn take_name(&mut self) -> &'a str {
        let end = self
            .rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
            .unwrap_or(self.rest.len());
        let (name, tail) = self.rest.split_at(end);
        self.rest = tail;
        name
    }
}

/// Parse an action document: an XML element whose direct children are
/// the verbs to execute, in document order. The verb vocabulary is
/// closed, so an unknown tag is a parse error rather than a runtime
/// dispatch failure.
pub fn parse_action_document(input: &str) -> Result<Vec<Action>, ActionParseError> {
    use ActionParseError::Malformed;

    let mut cur = Cursor { rest: input };
    cur.skip_ws();
    if cur.eat("<?") {
        cur.take_until("?>").ok_or(Malformed("unterminated prolog"))?;
        cur.skip_ws();
    }
    if !cur.eat("<") {
        return Err(Malformed("missing root element"));
    }
    let root = cur.take_name();
    if root.is_empty() {
        return Err(Malformed("missing root element"));
    }
    let head = cur
        .take_until(">")
        .ok_or(Malformed("unterminated root tag"))?;
    if head.trim_end().ends_with('/') {
        return Ok(Vec::new());
    }

    let close = format!("</{root}>");
    let mut actions = Vec::new();
    loop {
        cur.skip_ws();
        if cur.eat(&close) {
            break;
        }
        if !cur.eat("<") {
            return Err(Malformed("expected an element"));
        }
        let name = cur.take_name();
        if name.is_empty() {
            return Err(Malformed("expected an element"));
        }
        let verb = name.parse::<Verb>()?;
        let head = cur.take_until(">").ok_or(Malformed("unterminated tag"))?;
        let (head, self_closing) = match head.strip_suffix('/') {
            Some(head) => (head, true),
            None => (head, false),
        };
        let attributes = parse_attributes(head)?;
        let text = if self_closing {
            String::new()
        } else {
            let body = cur
                .take_until(&format!("</{name}>"))
                .ok_or(Malformed("unterminated element"))?;
            unescape(body.trim())
        };
        actions.push(Action {
            verb,
            text,
            attributes,
        });
    }
    Ok(actions)
}

fn parse_attributes(head: &str) -> Result<HashMap<String, String>, ActionParseError> {
    use ActionParseError::Malformed;

    let mut attributes = HashMap::new();
    let mut cur = Cursor { rest: head };
    loop {
        cur.skip_ws();
        if cur.rest.is_empty() {
            break;
        }
        let name = cur.take_name();
        if name.is_empty() {
            return Err(Malformed("bad attribute name"));
        }
        cur.skip_ws();
        if !cur.eat("=") {
            return Err(Malformed("attribute without a value"));
        }
        cur.skip_ws();
        let quote = if cur.eat("\"") {
            "\""
        } else if cur.eat("'") {
            "'"
        } else {
            return Err(Malformed("unquoted attribute value"));
        };
        let value = cur
            .take_until(quote)
            .ok_or(Malformed("unterminated attribute value"))?;
        attributes.insert(name.to_string(), unescape(value));
    }
    Ok(attributes)
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Where action documents come from. A trait seam so the state
/// machine can be exercised without an HTTP server behind it.
#[async_trait]
pub trait ActionSource: Send + Sync {
    async fn fetch(&self, url: &str, params: &[(&str, &str)]) -> Result<String>;
}

#[derive(Default)]
pub struct HttpActionSource {
    http: reqwest::Client,
}

impl HttpActionSource {
    pub fn new() -> HttpActionSource {
        HttpActionSource::default()
    }
}

#[async_trait]
impl ActionSource for HttpActionSource {
    async fn fetch(&self, url: &str, params: &[(&str, &str)]) -> Result<String> {
        let res = self.http.get(url).query(params).send().await?;
        if !res.status().is_success() {
            return Err(anyhow!("action document at {} got {}", url, res.status()));
        }
        Ok(res.text().await?)
    }
}

/// Fetch and parse, degrading any failure to an empty action list so
/// the channel terminates instead of stalling on a broken document.
pub async fn fetch_actions(
    source: &dyn ActionSource,
    url: &str,
    params: &[(&str, &str)],
) -> Vec<Action> {
    let body = match source.fetch(url, params).await {
        Ok(body) => body,
        Err(e) => {
            warn!("fetching action document failed: {e}");
            return Vec::new();
        }
    };
    match parse_action_document(&body) {
        Ok(actions) => actions,
        Err(e) => {
            warn!("parsing action document failed: {e}");
            Vec::new()
        }
    }
}
