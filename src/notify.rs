// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Notification dispatch.
//!
//! The [`Dispatcher`] announces persisted additions through a
//! [`NotificationSink`], fanning each listing out to every configured
//! channel. Listings are handed over in the order they should be announced,
//! and the dispatcher keeps that order: one listing is fully fanned out
//! before the next one starts.
//!
//! # Eligibility
//!
//! A listing is only announced while it is active, visible, and was posted
//! no longer than the configured maximum age ago. Listings without a posting
//! time have no known age, so they are never announced.
//!
//! # Channel Health
//!
//! Each dispatcher instance tracks failures per channel. A channel that
//! refuses access is dropped right away. Any other channel is dropped after
//! reaching the retry limit in consecutive failures. A successful delivery
//! resets the count. Dropped channels stay dropped for the lifetime of the
//! dispatcher.

pub mod message;

pub use message::{format_details, format_message};

use crate::{config::NotifyConfig, listing::{Listing, ListingId}};

use futures::{stream, StreamExt};
use std::{
    collections::{HashMap, HashSet},
    future::Future,
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Delivery channel for notifications.
pub trait NotificationSink: Send + Sync {
    /// Deliver announcement of a listing to a channel.
    ///
    /// # Errors
    ///
    /// - Return [`NotifyError::Forbidden`] if posting to the channel is not
    ///   allowed. The channel is never tried again.
    /// - Return any other [`NotifyError`] for failures that may be transient.
    fn deliver(
        &self,
        channel_id: &str,
        listing: &Listing,
    ) -> impl Future<Output = Result<Delivered, NotifyError>> + Send;
}

/// Receipt of a delivered notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub channel_id: String,
    pub message_id: String,
}

/// Delivered notification for a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub id: ListingId,
    pub delivered: Delivered,
}

/// Announces listings to channels.
#[derive(Debug)]
pub struct Dispatcher<S> {
    sink: S,
    channels: Vec<String>,
    max_post_age: i64,
    max_retries: u32,
    concurrency: usize,
    failure_counts: HashMap<String, u32>,
    failed_channels: HashSet<String>,
}

impl<S: NotificationSink> Dispatcher<S> {
    /// Construct new dispatcher over a sink.
    pub fn new(sink: S, config: &NotifyConfig) -> Self {
        Self {
            sink,
            channels: config.channels.clone(),
            max_post_age: i64::from(config.max_post_age_days) * SECONDS_PER_DAY,
            max_retries: config.max_retries,
            concurrency: config.concurrency.max(1),
            failure_counts: HashMap::new(),
            failed_channels: HashSet::new(),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Channels still receiving notifications.
    pub fn healthy_channels(&self) -> impl Iterator<Item = &str> + '_ {
        self.channels
            .iter()
            .filter(|channel| !self.failed_channels.contains(*channel))
            .map(String::as_str)
    }

    /// Channels dropped after failing.
    pub fn failed_channels(&self) -> impl Iterator<Item = &str> + '_ {
        self.failed_channels.iter().map(String::as_str)
    }

    /// Check if listing should be announced at time `now`.
    pub fn is_eligible(&self, listing: &Listing, now: i64) -> bool {
        listing.active
            && listing.is_visible
            && listing
                .date_posted
                .is_some_and(|posted| now - posted <= self.max_post_age)
    }

    /// Announce listings in given order to every healthy channel.
    ///
    /// Returns one record per successful delivery. Failed deliveries are
    /// logged and counted against their channel, but never stop the rest.
    #[instrument(skip_all, level = "debug")]
    pub async fn dispatch(&mut self, listings: &[Listing], now: i64) -> Vec<DeliveryRecord> {
        let mut records = Vec::new();

        for listing in listings {
            if !self.is_eligible(listing, now) {
                debug!("skipping announcement of {}: inactive, hidden, or too old", listing.id);
                continue;
            }

            let channels: Vec<String> = self.healthy_channels().map(String::from).collect();
            if channels.is_empty() {
                warn!("no healthy channel left to announce listings to");
                break;
            }

            let sink = &self.sink;
            let outcomes: Vec<(String, Result<Delivered, NotifyError>)> = stream::iter(channels)
                .map(|channel| async move {
                    let outcome = sink.deliver(&channel, listing).await;
                    (channel, outcome)
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

            for (channel, outcome) in outcomes {
                match outcome {
                    Ok(delivered) => {
                        self.failure_counts.remove(&channel);
                        records.push(DeliveryRecord {
                            id: listing.id.clone(),
                            delivered,
                        });
                    }
                    Err(error) => self.record_failure(channel, &error),
                }
            }
        }

        info!("delivered {} notifications", records.len());
        records
    }

    fn record_failure(&mut self, channel: String, error: &NotifyError) {
        warn!("failed to notify channel {channel}: {error}");

        let failures = self.failure_counts.entry(channel.clone()).or_default();
        *failures += 1;

        if matches!(error, NotifyError::Forbidden(_)) || *failures >= self.max_retries {
            warn!("dropping channel {channel} after {failures} failures");
            self.failure_counts.remove(&channel);
            self.failed_channels.insert(channel);
        }
    }
}

/// Sink that writes announcements to the log.
///
/// Useful as a dry run before wiring a real chat service, and as the default
/// sink of the command line tool.
#[derive(Debug, Default, Clone)]
pub struct LogSink {
    default_term: Option<String>,
}

impl LogSink {
    pub fn new(default_term: Option<String>) -> Self {
        Self { default_term }
    }
}

impl NotificationSink for LogSink {
    async fn deliver(&self, channel_id: &str, listing: &Listing) -> Result<Delivered, NotifyError> {
        let message = format_message(listing, self.default_term.as_deref());
        info!(channel = channel_id, "\n{message}");

        Ok(Delivered {
            channel_id: channel_id.to_string(),
            message_id: Uuid::new_v4().to_string(),
        })
    }
}

/// Notification error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    /// Channel does not exist.
    #[error("channel {0} not found")]
    ChannelNotFound(String),

    /// Posting to channel is not allowed.
    #[error("no permission to post in channel {0}")]
    Forbidden(String),

    /// Delivery failed for any other reason.
    #[error("failed to deliver to channel {channel}: {reason}")]
    Delivery { channel: String, reason: String },
}
