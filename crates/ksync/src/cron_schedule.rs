//! ⏰ Cron intervals as stored on connectors: quartz flavored, occasionally unix flavored.
//!
//! Quartz uses `?` for "no specific value", the cron crate wants `*`. Unix cron has five
//! fields and no seconds, so it gets a leading `0`.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;

pub fn parse_interval(expression: &str) -> Result<Schedule> {
    let normalized = normalize(expression);
    Schedule::from_str(&normalized).with_context(|| {
        format!("💀 '{expression}' is not a cron expression we can schedule (read it as '{normalized}')")
    })
}

/// 🗓️ When this interval fires next after `after`, if ever.
pub fn next_fire_after(expression: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    Ok(parse_interval(expression)?.after(&after).next())
}

fn normalize(expression: &str) -> String {
    let fields: Vec<String> = expression
        .split_whitespace()
        .map(|field| field.replace('?', "*"))
        .collect();
    match fields.len() {
        5 => format!("0 {}", fields.join(" ")),
        _ => fields.join(" "),
    }
}
