use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use url::Url;

use crate::{
    error::{AppError, AppResult},
    models::Channel,
    services::hashing::sha256_text,
};

/// Source of raw iCalendar text.
#[async_trait]
pub trait CalendarFeedSource: Send + Sync {
    async fn fetch(&self, url: &Url) -> AppResult<String>;
}

pub struct HttpFeedSource {
    client: Client,
    timeout: Duration,
}

impl HttpFeedSource {
    pub fn new(client: Client, timeout_seconds: u64) -> Self {
        Self {
            client,
            timeout: Duration::from_secs(timeout_seconds.max(1)),
        }
    }
}

#[async_trait]
impl CalendarFeedSource for HttpFeedSource {
    async fn fetch(&self, url: &Url) -> AppResult<String> {
        let resp = self
            .client
            .get(url.clone())
            .timeout(self.timeout)
            .header("Accept", "text/calendar, text/plain;q=0.9, */*;q=0.1")
            .header("User-Agent", "Hospeda/1.0 calendar-import")
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, host = url.host_str().unwrap_or(""), "iCal fetch request failed");
                if e.is_timeout() {
                    AppError::Dependency("iCal fetch timed out.".to_string())
                } else {
                    AppError::Dependency("iCal fetch failed.".to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            tracing::error!(status = %status, host = url.host_str().unwrap_or(""), "iCal fetch returned non-success status");
            return Err(AppError::Dependency(
                "iCal fetch failed with non-success status.".to_string(),
            ));
        }

        resp.text().await.map_err(|e| {
            tracing::error!(error = %e, "iCal fetch body read failed");
            AppError::Dependency("iCal fetch failed.".to_string())
        })
    }
}

/// Only http(s) URLs with a host are accepted.
pub fn validate_feed_url(raw: &str) -> AppResult<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AppError::BadRequest("iCal import URL is empty.".to_string()));
    }
    let url = Url::parse(trimmed)
        .map_err(|_| AppError::BadRequest("iCal import URL is not a valid URL.".to_string()))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(AppError::BadRequest(
            "iCal import URL must use http or https.".to_string(),
        ));
    }
    Ok(url)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEvent {
    pub uid: String,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub summary: String,
    pub description: String,
    pub status: String,
}

impl FeedEvent {
    pub fn is_cancelled(&self) -> bool {
        self.status == "CANCELLED"
    }
}

/// A blocked range from a feed, keyed for idempotent insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportCandidate {
    pub external_id: String,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub summary: String,
}

pub fn import_candidates(ics_text: &str, channel: Channel) -> Vec<ImportCandidate> {
    parse_ical_events(ics_text)
        .into_iter()
        .filter(|event| !event.is_cancelled())
        .map(|event| ImportCandidate {
            external_id: format!("ical_{}_{}", channel.as_str(), event.uid),
            check_in: event.check_in,
            check_out: event.check_out,
            summary: event.summary,
        })
        .collect()
}

fn unfold_ical_lines(text: &str) -> Vec<String> {
    let mut unfolded: Vec<String> = Vec::new();
    for raw in text.lines() {
        let line = raw.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            continue;
        }
        match unfolded.last_mut() {
            Some(last) if line.starts_with(' ') || line.starts_with('\t') => {
                last.push_str(&line[1..]);
            }
            _ => unfolded.push(line.to_string()),
        }
    }
    unfolded
}

/// `YYYYMMDD` prefix of a DATE or DATE-TIME value.
fn parse_ical_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    let digits = value.get(..8)?;
    NaiveDate::parse_from_str(digits, "%Y%m%d").ok()
}

/// Events with usable, ordered dates. Properties keep their first value.
pub fn parse_ical_events(ics_text: &str) -> Vec<FeedEvent> {
    let mut raw_events: Vec<HashMap<String, String>> = Vec::new();
    let mut current: Option<HashMap<String, String>> = None;

    for line in unfold_ical_lines(ics_text) {
        let upper = line.to_uppercase();
        if upper == "BEGIN:VEVENT" {
            current = Some(HashMap::new());
            continue;
        }
        if upper == "END:VEVENT" {
            if let Some(event) = current.take() {
                raw_events.push(event);
            }
            continue;
        }
        let Some(event) = current.as_mut() else {
            continue;
        };
        let Some((key_part, value)) = line.split_once(':') else {
            continue;
        };
        // Parameters such as `;VALUE=DATE` do not change the date prefix.
        let key = key_part
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_uppercase();
        if key.is_empty() {
            continue;
        }
        event
            .entry(key)
            .or_insert_with(|| value.trim().to_string());
    }

    let prop = |event: &HashMap<String, String>, name: &str| {
        event.get(name).cloned().unwrap_or_default()
    };

    let mut parsed = Vec::new();
    for event in &raw_events {
        let Some(start) = parse_ical_date(&prop(event, "DTSTART")) else {
            continue;
        };
        let Some(end) = parse_ical_date(&prop(event, "DTEND")) else {
            continue;
        };
        if end <= start {
            continue;
        }

        let summary = prop(event, "SUMMARY").trim().to_string();
        let description = prop(event, "DESCRIPTION").trim().to_string();
        let uid_value = prop(event, "UID");
        let uid = if uid_value.trim().is_empty() {
            let stable = format!(
                "{}|{}|{}|{}",
                start.format("%Y-%m-%d"),
                end.format("%Y-%m-%d"),
                summary,
                description
            );
            format!("ical-{}", &sha256_text(&stable)[..32])
        } else {
            uid_value.trim().to_string()
        };

        parsed.push(FeedEvent {
            uid,
            check_in: start,
            check_out: end,
            summary,
            description,
            status: prop(event, "STATUS").trim().to_uppercase(),
        });
    }

    parsed
}
