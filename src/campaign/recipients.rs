//! Recipient selection for campaigns.
//!
//! Candidates come from the emails table joined to places. They are
//! normalized, unsubscribed addresses are removed, duplicates are collapsed
//! keeping the newest, and an explicit selection narrows the result.

use std::collections::HashSet;
use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;

use crate::db::Db;
use crate::errors::CampaignError;
use crate::models::{Recipient, RecipientFilter};

pub const DEFAULT_RECIPIENT_LIMIT: i64 = 3000;
pub const MAX_RECIPIENT_LIMIT: i64 = 10_000;
/// Recipients echoed back by preview and dry-run responses.
pub const PREVIEW_SIZE: usize = 200;

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid email regex"));

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email.trim())
}

/// Reject filters with out-of-range limits, oversized fields or malformed
/// selected addresses.
pub fn validate_filter(filter: &RecipientFilter) -> Result<(), CampaignError> {
    let fields = [
        ("status", &filter.status, 30),
        ("province", &filter.province, 255),
        ("district", &filter.district, 255),
        ("category", &filter.category, 255),
        ("normalized_category", &filter.normalized_category, 255),
        ("source", &filter.source, 50),
    ];
    for (name, value, max) in fields {
        if let Some(v) = value
            && v.chars().count() > max
        {
            return Err(CampaignError::Validation(format!(
                "{} must be at most {} characters",
                name, max
            )));
        }
    }
    if let Some(limit) = filter.limit
        && !(1..=MAX_RECIPIENT_LIMIT).contains(&limit)
    {
        return Err(CampaignError::Validation(format!(
            "limit must be between 1 and {}",
            MAX_RECIPIENT_LIMIT
        )));
    }
    if let Some(selected) = &filter.selected_emails
        && let Some(bad) = selected.iter().find(|e| !is_valid_email(e))
    {
        return Err(CampaignError::Validation(format!(
            "selected_emails contains an invalid address: {}",
            bad
        )));
    }
    Ok(())
}

/// Compute the recipient set for `filter` against the store.
pub fn resolve_recipients(db: &Db, filter: &RecipientFilter) -> Result<Vec<Recipient>> {
    let limit = filter
        .limit
        .unwrap_or(DEFAULT_RECIPIENT_LIMIT)
        .clamp(1, MAX_RECIPIENT_LIMIT);
    let candidates = db.candidate_recipients(filter, limit)?;
    let unsubscribed: HashSet<String> = db
        .unsubscribed_emails()?
        .iter()
        .map(|e| normalize_email(e))
        .filter(|e| !e.is_empty())
        .collect();
    Ok(select_recipients(
        candidates,
        &unsubscribed,
        filter.selected_emails.as_deref(),
    ))
}

/// Normalize, drop empty and unsubscribed addresses, dedupe keeping the
/// first occurrence, then intersect with `selected` when it is non-empty.
pub fn select_recipients(
    candidates: Vec<Recipient>,
    unsubscribed: &HashSet<String>,
    selected: Option<&[String]>,
) -> Vec<Recipient> {
    let picked: Option<HashSet<String>> = selected
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.iter()
                .map(|e| normalize_email(e))
                .filter(|e| !e.is_empty())
                .collect()
        });

    let mut seen = HashSet::new();
    let mut recipients = Vec::new();
    for candidate in candidates {
        let email = normalize_email(&candidate.email);
        if email.is_empty() || unsubscribed.contains(&email) || !seen.insert(email.clone()) {
            continue;
        }
        if let Some(picked) = &picked
            && !picked.contains(&email)
        {
            continue;
        }
        recipients.push(Recipient { email, ..candidate });
    }
    recipients
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewPlace;
    use crate::models::CheckinResponse;

    fn candidate(email: &str, place: &str) -> Recipient {
        Recipient {
            email: email.to_string(),
            place_id: Some(place.to_string()),
            source: Some("website".to_string()),
        }
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email("  Owner@Cafe.EXAMPLE \n"), "owner@cafe.example");
        assert_eq!(normalize_email("   "), "");
    }

    #[test]
    fn test_select_dedupes_keeping_first() {
        let picked = select_recipients(
            vec![
                candidate("A@example.com", "p2"),
                candidate(" a@example.com ", "p1"),
                candidate("", "p3"),
                candidate("b@example.com", "p1"),
            ],
            &HashSet::new(),
            None,
        );
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[0].email, "a@example.com");
        assert_eq!(picked[0].place_id.as_deref(), Some("p2"));
        assert_eq!(picked[1].email, "b@example.com");
    }

    #[test]
    fn test_select_excludes_unsubscribed() {
        let unsubscribed: HashSet<String> = ["gone@example.com".to_string()].into();
        let picked = select_recipients(
            vec![candidate("GONE@example.com", "p1"), candidate("stay@example.com", "p1")],
            &unsubscribed,
            None,
        );
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].email, "stay@example.com");
    }

    #[test]
    fn test_select_intersects_with_selection() {
        let selected = vec!["B@example.com".to_string()];
        let picked = select_recipients(
            vec![candidate("a@example.com", "p1"), candidate("b@example.com", "p1")],
            &HashSet::new(),
            Some(selected.as_slice()),
        );
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].email, "b@example.com");

        // An empty selection does not narrow.
        let all = select_recipients(
            vec![candidate("a@example.com", "p1")],
            &HashSet::new(),
            Some(&[] as &[String]),
        );
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn test_validate_filter() {
        assert!(validate_filter(&RecipientFilter::default()).is_ok());
        assert!(validate_filter(&RecipientFilter {
            limit: Some(0),
            ..Default::default()
        })
        .is_err());
        assert!(validate_filter(&RecipientFilter {
            limit: Some(10_001),
            ..Default::default()
        })
        .is_err());
        assert!(validate_filter(&RecipientFilter {
            source: Some("x".repeat(51)),
            ..Default::default()
        })
        .is_err());
        assert!(validate_filter(&RecipientFilter {
            selected_emails: Some(vec!["not-an-email".into()]),
            ..Default::default()
        })
        .is_err());
        assert!(validate_filter(&RecipientFilter {
            selected_emails: Some(vec!["ok@example.com".into()]),
            limit: Some(10_000),
            ..Default::default()
        })
        .is_ok());
    }

    #[test]
    fn test_resolve_against_store() -> Result<()> {
        let db = Db::new_in_memory()?;
        for (id, province) in [("p1", "Bangkok"), ("p2", "Phuket")] {
            db.insert_place(&NewPlace {
                place_id: id.to_string(),
                name: id.to_string(),
                status: "NEW".to_string(),
                province: Some(province.to_string()),
                ..Default::default()
            })?;
        }
        db.insert_email("p1", "one@example.com", "website")?;
        db.insert_email("p1", "Two@Example.com", "website")?;
        db.insert_email("p2", "three@example.com", "website")?;
        db.insert_email("p2", "two@example.com", "facebook")?;
        db.record_checkin("tok", "ONE@example.com", Some(CheckinResponse::Unsubscribe), None, None)?;

        let all = resolve_recipients(&db, &RecipientFilter::default())?;
        let emails: Vec<_> = all.iter().map(|r| r.email.as_str()).collect();
        assert_eq!(emails, vec!["two@example.com", "three@example.com"]);
        // Newest duplicate wins.
        assert_eq!(all[0].place_id.as_deref(), Some("p2"));

        let bangkok = resolve_recipients(
            &db,
            &RecipientFilter {
                province: Some("Bangkok".into()),
                ..Default::default()
            },
        )?;
        assert_eq!(bangkok.len(), 1);
        assert_eq!(bangkok[0].place_id.as_deref(), Some("p1"));
        Ok(())
    }
}
