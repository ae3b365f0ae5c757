//! Document client: request/response reads of an object's remote document
//!
//! Independent of the persistent connection. Every failure is logged and
//! surfaced as `None`; callers treat `None` as "could not retrieve".

use crate::config::ObjectConfig;
use crate::protocol::EventKind;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, error, warn};

/// What a document request produced, before it is collapsed to an `Option`
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentOutcome {
    Found(Value),
    Empty,
    Forbidden,
    ServerError,
    Unexpected { status: u16, body: String },
    Malformed(String),
    Transport(String),
}

impl DocumentOutcome {
    pub fn into_value(self) -> Option<Value> {
        match self {
            DocumentOutcome::Found(value) => Some(value),
            _ => None,
        }
    }

    fn from_response(status: StatusCode, body: &str) -> Self {
        match status {
            StatusCode::CREATED if body.trim().is_empty() => DocumentOutcome::Empty,
            StatusCode::CREATED => match serde_json::from_str(body) {
                Ok(value) => DocumentOutcome::Found(value),
                Err(e) => DocumentOutcome::Malformed(e.to_string()),
            },
            StatusCode::FORBIDDEN => DocumentOutcome::Forbidden,
            StatusCode::INTERNAL_SERVER_ERROR => DocumentOutcome::ServerError,
            other => DocumentOutcome::Unexpected {
                status: other.as_u16(),
                body: body.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct DocumentClient {
    http: reqwest::Client,
    api_url: String,
    object_id: String,
}

impl DocumentClient {
    pub fn new(config: &ObjectConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            object_id: config.object_id.clone(),
        })
    }

    fn endpoint(&self, event: EventKind) -> String {
        format!("{}/iot/aliot/{}", self.api_url, event.as_str())
    }

    /// Reads the whole document, or one field of it
    pub async fn get_document(&self, field: Option<&str>) -> Option<Value> {
        self.fetch(field).await.into_value()
    }

    /// Like [`get_document`](Self::get_document) but keeps the reason a read
    /// produced nothing
    pub async fn fetch(&self, field: Option<&str>) -> DocumentOutcome {
        let (event, target) = match field {
            Some(name) => (EventKind::GetField, format!("the field {name}")),
            None => (EventKind::GetDoc, "the document".to_string()),
        };

        let mut form = vec![("id", self.object_id.as_str())];
        if let Some(name) = field {
            form.push(("field", name));
        }

        let url = self.endpoint(event);
        debug!("Requesting {} from {}", target, url);
        let outcome = match self.http.post(&url).form(&form).send().await {
            Ok(response) => {
                let status = response.status();
                match response.text().await {
                    Ok(body) => DocumentOutcome::from_response(status, &body),
                    Err(e) => DocumentOutcome::Transport(e.to_string()),
                }
            }
            Err(e) => DocumentOutcome::Transport(e.to_string()),
        };

        log_outcome(&target, &outcome);
        outcome
    }
}

fn log_outcome(target: &str, outcome: &DocumentOutcome) {
    match outcome {
        DocumentOutcome::Found(_) => debug!("Got {}", target),
        DocumentOutcome::Empty => debug!("Got {} but it is empty", target),
        DocumentOutcome::Forbidden => error!(
            "While getting {}, the request was forbidden due to permission errors or a missing project",
            target
        ),
        DocumentOutcome::ServerError => error!(
            "While getting {}, something went wrong with the platform's servers, please try again",
            target
        ),
        DocumentOutcome::Unexpected { status, body } => error!(
            "While getting {}, please try again. Status {}: {}",
            target, status, body
        ),
        DocumentOutcome::Malformed(e) => warn!("While getting {}, the body was not JSON: {}", target, e),
        DocumentOutcome::Transport(e) => error!("While getting {}, the request failed: {}", target, e),
    }
}
