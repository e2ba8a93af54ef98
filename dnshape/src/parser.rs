//! Parsers for the text printed by `ipfw`.
//!
//! This is the only module that looks at raw backend output. Lines that don't match any of the
//! expected shapes are skipped, since listings are interleaved with headers and advisory lines.
//! Lines that do match but carry malformed numbers are reported as
//! [`Error::ProtocolViolation`].
//!
//! Two dialects of `pipe show` are understood. The legacy one prints everything on one line:
//!
//! ```text
//! 00300: 768.000 Kbit/s  150 ms   50 sl.plr 0.000100 0 queues (1 buckets) droptail
//! ```
//!
//! The newer one moves the queue parameters to a second line:
//!
//! ```text
//! 00300:   1.234 Mbit/s   42 ms burst 0
//! q131372  50 sl.plr 0.000100 0 flows (1 buckets) sched 65836 weight 0 lmax 0 pri 0 droptail
//! ```

use std::{
    net::{IpAddr, Ipv4Addr},
    sync::LazyLock,
};

use pnet::datalink::MacAddr;
use regex::{Captures, Regex};

use crate::{
    error::{Error, Result},
    types::{AddressSpec, ClassificationRule, LossRate, QueueConfig, QueueId, RuleId},
};

/// `<rule> pipe <queue> <predicate> <in|out>`
static RULE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?P<id>\d+)\s+pipe\s+(?P<queue>\d+)\s+(?P<predicate>.+?)\s+(?P<dir>in|out)(?:\s|$)")
        .expect("valid regex")
});

static IP_PREDICATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^ip\s+from\s+(?P<from>\S+)\s+to\s+(?P<to>\S+)$").expect("valid regex")
});

/// ipfw prints layer 2 matches destination first. Some versions also echo the implicit
/// `ip from any to any` in front.
static MAC_PREDICATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:ip\s+from\s+any\s+to\s+any\s+)?(?:layer2\s+)?(?i:mac)\s+(?P<dst>\S+)\s+(?P<src>\S+)$",
    )
    .expect("valid regex")
});

/// `<queue>: <bandwidth> <delay> ms`. The fraction is matched loosely so that a malformed one is
/// reported instead of skipped.
static QUEUE_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?P<id>\d+):\s+(?:(?P<unlimited>unlimited)|(?P<int>\d+)(?:\.(?P<frac>\d*))?\s*(?P<unit>[KM]?)bit/s)\s+(?P<delay>\d+)\s*ms(?:\s|$)",
    )
    .expect("valid regex")
});

/// `<rule> count ip from <from> to <to>`
static COUNT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?P<id>\d+)\s+count\s+ip\s+from\s+(?P<from>\S+)\s+to\s+(?P<to>\S+)\s*$")
        .expect("valid regex")
});

static LEADING_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?P<id>\d+)(?:\s|$)").expect("valid regex"));

/// The token preceding the loss rate in `pipe show` output.
const LOSS_TOKEN: &str = "sl.plr";

fn violation(text: &str) -> Error {
    Error::ProtocolViolation(text.trim().to_owned())
}

fn parse_number<T: std::str::FromStr>(caps: &Captures<'_>, name: &str, line: &str) -> Result<T> {
    caps[name].parse().map_err(|_| violation(line))
}

/// Parses an address as printed in a rule. Only the literal `any` token matches everything.
fn parse_address_token(token: &str) -> Option<AddressSpec> {
    if token == "any" {
        return Some(AddressSpec::Any);
    }
    if let Ok(ip) = token.parse::<IpAddr>() {
        return Some(AddressSpec::Ip(ip));
    }
    token.parse::<MacAddr>().ok().map(AddressSpec::Hardware)
}

/// Parses one line of `ipfw list`. Returns `None` for lines that are not `pipe` rules on a
/// single address.
pub fn parse_rule_line(line: &str) -> Result<Option<ClassificationRule>> {
    let Some(caps) = RULE_LINE.captures(line) else {
        return Ok(None);
    };

    let predicate = caps["predicate"].trim();
    let endpoints = if let Some(ip) = IP_PREDICATE.captures(predicate) {
        parse_address_token(&ip["from"]).zip(parse_address_token(&ip["to"]))
    } else if let Some(mac) = MAC_PREDICATE.captures(predicate) {
        parse_address_token(&mac["src"]).zip(parse_address_token(&mac["dst"]))
    } else {
        None
    };

    let Some((from, to)) = endpoints else {
        return Ok(None);
    };

    Ok(Some(ClassificationRule {
        rule_id: parse_number(&caps, "id", line)?,
        queue_id: parse_number(&caps, "queue", line)?,
        direction: caps["dir"].parse()?,
        from,
        to,
    }))
}

/// Parses every `pipe` rule in an `ipfw list` output, in listing order.
pub fn parse_rules(listing: &str) -> Result<Vec<ClassificationRule>> {
    let mut rules = Vec::new();
    for line in listing.lines() {
        if let Some(rule) = parse_rule_line(line)? {
            rules.push(rule);
        }
    }

    Ok(rules)
}

/// Returns the identifiers of every rule in an `ipfw list` output, whatever its action.
pub fn listed_rule_ids(listing: &str) -> Vec<RuleId> {
    listing
        .lines()
        .filter_map(|line| LEADING_ID.captures(line))
        .filter_map(|caps| caps["id"].parse().ok())
        .collect()
}

/// Returns the identifiers of the `count` rules matching `address` against itself, in listing
/// order.
pub fn placeholder_ids(listing: &str, address: Ipv4Addr) -> Vec<RuleId> {
    listing
        .lines()
        .filter_map(|line| COUNT_LINE.captures(line))
        .filter(|caps| {
            [&caps["from"], &caps["to"]]
                .into_iter()
                .all(|token| token.parse::<Ipv4Addr>().ok() == Some(address))
        })
        .filter_map(|caps| caps["id"].parse().ok())
        .collect()
}

/// Parses the line `ipfw add` prints back, which starts with the identifier of the new rule.
pub fn parse_confirmation(output: &str) -> Result<RuleId> {
    let line = output.lines().find(|line| !line.trim().is_empty()).unwrap_or_default();
    let caps = LEADING_ID.captures(line).ok_or_else(|| violation(output))?;

    parse_number(&caps, "id", line)
}

/// Decodes `<int>.<thousandths> <K|M>bit/s` into bits per second.
pub fn decode_bandwidth(int: &str, frac: Option<&str>, unit: &str) -> Result<u64> {
    let text = || format!("{int}.{} {unit}bit/s", frac.unwrap_or_default());

    let frac = match frac {
        Some(frac) if frac.len() == 3 => frac,
        _ => return Err(Error::ProtocolViolation(text())),
    };

    let multiplier: u64 = match unit {
        "" => 1,
        "K" => 1_000,
        "M" => 1_000_000,
        _ => return Err(Error::ProtocolViolation(text())),
    };

    let int: u64 = int.parse().map_err(|_| Error::ProtocolViolation(text()))?;
    let frac: u64 = frac.parse().map_err(|_| Error::ProtocolViolation(text()))?;

    int.checked_mul(multiplier)
        .and_then(|bits| bits.checked_add(frac * multiplier / 1_000))
        .ok_or_else(|| Error::ProtocolViolation(text()))
}

/// Parses the output of `ipfw pipe <queue> show`.
///
/// Bandwidth and delay come from the pipe's header line. The loss rate is taken from the first
/// `sl.plr` token found between that header and the next one. Returns `None` if the output
/// doesn't describe `queue_id`.
pub fn parse_queue_status(output: &str, queue_id: QueueId) -> Result<Option<QueueConfig>> {
    let mut lines = output.lines();

    let (line, caps) = loop {
        let Some(line) = lines.next() else {
            return Ok(None);
        };
        let Some(caps) = QUEUE_HEADER.captures(line) else {
            continue;
        };
        if parse_number::<QueueId>(&caps, "id", line)? == queue_id {
            break (line, caps);
        }
    };

    let bandwidth = if caps.name("unlimited").is_some() {
        None
    } else {
        let frac = caps.name("frac").map(|m| m.as_str());
        Some(decode_bandwidth(&caps["int"], frac, &caps["unit"])?)
    };
    let delay: u64 = parse_number(&caps, "delay", line)?;

    // The header's own tail counts as part of the block (legacy dialect).
    let tail = &line[caps.get(0).map_or(line.len(), |m| m.end())..];
    let block = std::iter::once(tail).chain(lines.take_while(|l| !QUEUE_HEADER.is_match(l)));

    let mut loss = None;
    'scan: for text in block {
        let mut tokens = text.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == LOSS_TOKEN {
                let value = tokens.next().ok_or_else(|| violation(text))?;
                loss = Some(value.parse::<LossRate>().map_err(|_| violation(text))?);
                break 'scan;
            }
        }
    }

    Ok(Some(QueueConfig { queue_id, bandwidth, delay, loss }))
}
