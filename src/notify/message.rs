// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Notification text rendering.

use crate::listing::Listing;

use chrono::DateTime;

/// Render announcement of a new listing.
///
/// Terms are omitted when they only name `default_term`, since nearly every
/// listing in a seasonal feed carries it. Sponsorship is omitted when blank
/// or "Other".
pub fn format_message(listing: &Listing, default_term: Option<&str>) -> String {
    let mut parts = vec![
        format!(">>> ## {}", listing.company_name.trim()),
        format!("## [{}](<{}>)", listing.title.trim(), listing.url.trim()),
        "### Locations:".to_string(),
        join_or(&listing.locations, " | ", "Not specified"),
    ];

    let terms = listing.terms.join(" | ");
    if !listing.terms.is_empty() && Some(terms.as_str()) != default_term {
        parts.push(format!("### Terms: `{terms}`"));
    }

    if let Some(sponsorship) = listing
        .sponsorship
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty() && !value.eq_ignore_ascii_case("other"))
    {
        parts.push(format!("### Sponsorship: `{sponsorship}`"));
    }

    parts.push(format!("Posted on: {}", format_epoch(listing.date_posted)));
    parts.join("\n")
}

/// Render full details of a listing, e.g., for a message lookup.
pub fn format_details(listing: &Listing) -> String {
    let mut parts = vec![
        format!("# {} - {}", listing.company_name, listing.title),
        String::new(),
        format!("**Company:** {}", listing.company_name),
        format!("**Position:** {}", listing.title),
        format!("**Locations:** {}", join_or(&listing.locations, ", ", "Not specified")),
        format!("**Terms:** {}", join_or(&listing.terms, ", ", "Not specified")),
        format!(
            "**Sponsorship:** {}",
            listing.sponsorship.as_deref().unwrap_or("Not specified")
        ),
        format!("**Posted on:** {}", format_epoch(listing.date_posted)),
        format!("**Status:** {}", if listing.active { "open" } else { "closed" }),
    ];

    if !listing.url.is_empty() {
        parts.push(String::new());
        parts.push("## Apply".into());
        parts.push(format!("**Application Link:** {}", listing.url));
    }

    parts.join("\n")
}

/// Render unix seconds as e.g. "January, 5 @ 3:04 PM UTC".
pub fn format_epoch(secs: Option<i64>) -> String {
    secs.and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|time| time.format("%B, %-d @ %-I:%M %p UTC").to_string())
        .unwrap_or_else(|| "Unknown".into())
}

fn join_or(items: &[String], separator: &str, fallback: &str) -> String {
    if items.is_empty() {
        fallback.to_string()
    } else {
        items.join(separator)
    }
}
