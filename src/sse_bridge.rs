//! Mirrors an upstream server-sent-event stream of announcements into the
//! local hub, so gateway clients see everything the upstream API emits.

use chrono::{DateTime, Utc};
use es::Client;
use eventsource_client as es;
use events::{Announcement, DomainEvent, EventPublisher};
use futures_util::stream::StreamExt;
use log::*;
use serde::Deserialize;
use std::time::Duration;
use tokio::task::JoinHandle;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Announcement JSON as sent upstream. Every field is optional there.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnouncementPayload {
    id: Option<u64>,
    author: Option<String>,
    title: Option<String>,
    content: Option<String>,
    created_at: Option<DateTime<Utc>>,
}

impl From<AnnouncementPayload> for Announcement {
    fn from(payload: AnnouncementPayload) -> Self {
        Announcement::new(
            payload.id.unwrap_or_default(),
            payload.author.unwrap_or_else(|| "Unknown".to_owned()),
            payload.title.unwrap_or_else(|| "Untitled".to_owned()),
            payload.content.unwrap_or_default(),
            payload.created_at.unwrap_or_else(Utc::now),
        )
    }
}

fn parse_payload(data: &str) -> Result<Announcement, serde_json::Error> {
    serde_json::from_str::<AnnouncementPayload>(data).map(Announcement::from)
}

/// Spawns the bridge on the current tokio runtime. Abort the handle to stop it.
pub fn spawn(url: String, publisher: EventPublisher) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(e) = relay(&url, &publisher).await {
                warn!("SSE bridge cannot subscribe to {url}: {e:?}");
            }
            warn!(
                "SSE bridge disconnected from {url}, retrying in {}s",
                RECONNECT_DELAY.as_secs()
            );
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    })
}

/// Relays events until the upstream stream ends.
async fn relay(url: &str, publisher: &EventPublisher) -> Result<(), es::Error> {
    let client = es::ClientBuilder::for_url(url)?
        .header("Accept", "text/event-stream")?
        .reconnect(
            es::ReconnectOptions::reconnect(true)
                .retry_initial(true)
                .delay(RECONNECT_DELAY)
                .build(),
        )
        .build();

    info!("SSE bridge subscribed to {url}");
    let mut stream = client.stream();
    loop {
        match stream.next().await {
            Some(Ok(es::SSE::Event(event))) => relay_payload(&event.data, publisher),
            Some(Ok(es::SSE::Comment(_))) => {
                // Keep-alive
            }
            Some(Err(e)) => {
                warn!("SSE bridge error from {url}: {e:?}");
            }
            None => return Ok(()),
        }
    }
}

fn relay_payload(data: &str, publisher: &EventPublisher) {
    if data.trim().is_empty() {
        return;
    }
    match parse_payload(data) {
        Ok(announcement) => {
            info!(
                "SSE bridge relayed announcement #{} '{}' to the local gateway",
                announcement.id, announcement.title
            );
            publisher.publish(DomainEvent::AnnouncementCreated { announcement });
        }
        Err(e) => warn!("Failed to parse SSE payload {data}: {e}"),
    }
}
