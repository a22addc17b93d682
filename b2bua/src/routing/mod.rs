//! Priority ordered routing rules.
//!
//! Rules are compiled once (regexes, CIDR lists, time windows) and published
//! as an immutable snapshot readers load through an atomic pointer, so the
//! hot path never takes a lock.

use arc_swap::ArcSwap;
use chrono::{DateTime, Datelike, Local, NaiveTime, Timelike};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sip_types::{Headers, Name};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

mod store;

pub use store::{RuleStore, RuleStoreError, RULES_PREFIX};

/// A routing rule as stored and exchanged over the management API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: String,
    pub priority: u32,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub conditions: RuleConditions,
    pub action: RuleAction,
}

fn enabled_default() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConditions {
    /// Full-string regex on the canonical request uri, empty matches all
    pub request_uri: String,
    /// Full-string regex on the From header as received
    pub from_uri: String,
    /// Full-string regex on the To header as received
    pub to_uri: String,
    /// IPs or CIDR blocks, empty matches all
    pub source_ips: Vec<String>,
    /// Header name to value regex, the header must be present with at least
    /// one matching value
    pub headers: HashMap<String, String>,
    pub time_window: Option<TimeWindow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Days of week, `mon` .. `sun`
    pub days: Vec<String>,
    /// `HH:MM`, inclusive
    pub start: Option<String>,
    /// `HH:MM`, exclusive. An end at or before start wraps past midnight.
    pub end: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    /// Answer with a failure response
    Reject { code: u16, reason: String },
    /// Answer 302 with the target as Contact
    Redirect { target: String },
    /// Relay toward the next hop
    Forward {
        next_hop: String,
        #[serde(default)]
        add_headers: HashMap<String, String>,
        #[serde(default)]
        remove_headers: Vec<String>,
        #[serde(default)]
        media_flags: String,
    },
}

/// Outcome of walking the rule list for a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    NoMatch,
    Reject {
        rule_id: String,
        code: u16,
        reason: String,
    },
    Redirect {
        rule_id: String,
        target: String,
    },
    Forward {
        rule_id: String,
        next_hop: String,
        add_headers: Vec<(String, String)>,
        remove_headers: Vec<String>,
        media_flags: String,
    },
}

/// The request fields the engine matches on
pub struct RouteInput<'i> {
    /// Canonical `sip:user@host:port` form
    pub request_uri: String,
    /// From header as received
    pub from: &'i str,
    /// To header as received
    pub to: &'i str,
    pub source_ip: IpAddr,
    pub headers: &'i Headers,
}

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("invalid regex in {field}: {source}")]
    Regex {
        field: &'static str,
        source: regex::Error,
    },
    #[error("invalid source ip entry {0:?}")]
    SourceIp(String),
    #[error("invalid time window: {0}")]
    TimeWindow(String),
    #[error("invalid response code {0}")]
    ResponseCode(u16),
    #[error("rule {0} must not touch the {1} header, it is managed by the B2BUA")]
    ProtectedHeader(String, String),
    #[error("next hop is not a valid sip uri: {0}")]
    NextHop(String),
}

/// Headers owned by the B2BUA which rules may not add or remove
const PROTECTED_HEADERS: [Name; 3] = [Name::VIA, Name::RECORD_ROUTE, Name::CONTACT];

struct CompiledRule {
    rule: RoutingRule,
    request_uri: Option<Regex>,
    from_uri: Option<Regex>,
    to_uri: Option<Regex>,
    source_ips: Vec<IpNet>,
    headers: Vec<(Name, Regex)>,
    time_window: Option<CompiledWindow>,
}

struct CompiledWindow {
    days: [bool; 7],
    start: Option<NaiveTime>,
    end: Option<NaiveTime>,
}

/// IP prefix, the hand rolled subset of CIDR the rule schema needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IpNet {
    addr: IpAddr,
    prefix_len: u8,
}

impl IpNet {
    fn parse(i: &str) -> Option<IpNet> {
        let (addr, prefix_len) = match i.split_once('/') {
            Some((addr, prefix)) => (addr.parse().ok()?, prefix.parse().ok()?),
            None => {
                let addr: IpAddr = i.parse().ok()?;
                let full = if addr.is_ipv4() { 32 } else { 128 };
                (addr, full)
            }
        };

        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix_len > max {
            return None;
        }

        Some(IpNet { addr, prefix_len })
    }

    fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - self.prefix_len as u32).unwrap_or(0);
                let mask = if self.prefix_len == 0 { 0 } else { mask };
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX
                    .checked_shl(128 - self.prefix_len as u32)
                    .unwrap_or(0);
                let mask = if self.prefix_len == 0 { 0 } else { mask };
                (u128::from(net) & mask) == (u128::from(ip) & mask)
            }
            _ => false,
        }
    }
}

/// Source address gate evaluated before the rule walk.
///
/// Compiled once from the configured entry lists, malformed entries are
/// logged and skipped the same way malformed rules are.
pub struct SourceAcl {
    allow: Vec<IpNet>,
    deny: Vec<IpNet>,
}

impl SourceAcl {
    pub fn new(allow: &[String], deny: &[String]) -> Self {
        fn parse_list(entries: &[String], which: &str) -> Vec<IpNet> {
            entries
                .iter()
                .filter_map(|entry| match IpNet::parse(entry) {
                    Some(net) => Some(net),
                    None => {
                        log::warn!("skipping malformed {which} acl entry {entry:?}");
                        None
                    }
                })
                .collect()
        }

        Self {
            allow: parse_list(allow, "allow"),
            deny: parse_list(deny, "deny"),
        }
    }

    /// Deny entries win; a non-empty allow list admits only its members
    pub fn permits(&self, ip: IpAddr) -> bool {
        if self.deny.iter().any(|net| net.contains(ip)) {
            return false;
        }

        if self.allow.is_empty() {
            return true;
        }

        self.allow.iter().any(|net| net.contains(ip))
    }
}

fn compile_anchored(field: &'static str, pattern: &str) -> Result<Option<Regex>, RuleError> {
    if pattern.is_empty() {
        return Ok(None);
    }

    Regex::new(&format!("^(?:{pattern})$"))
        .map(Some)
        .map_err(|source| RuleError::Regex { field, source })
}

fn parse_hhmm(i: &str) -> Option<NaiveTime> {
    let (h, m) = i.split_once(':')?;
    NaiveTime::from_hms_opt(h.parse().ok()?, m.parse().ok()?, 0)
}

fn day_index(day: &str) -> Option<usize> {
    let index = match &day.to_ascii_lowercase()[..] {
        "mon" | "monday" => 0,
        "tue" | "tuesday" => 1,
        "wed" | "wednesday" => 2,
        "thu" | "thursday" => 3,
        "fri" | "friday" => 4,
        "sat" | "saturday" => 5,
        "sun" | "sunday" => 6,
        _ => return None,
    };

    Some(index)
}

impl CompiledRule {
    fn compile(rule: RoutingRule) -> Result<CompiledRule, RuleError> {
        validate(&rule)?;

        let conditions = &rule.conditions;

        let source_ips = conditions
            .source_ips
            .iter()
            .map(|entry| IpNet::parse(entry).ok_or_else(|| RuleError::SourceIp(entry.clone())))
            .collect::<Result<Vec<_>, _>>()?;

        let headers = conditions
            .headers
            .iter()
            .map(|(name, pattern)| {
                Regex::new(&format!("^(?:{pattern})$"))
                    .map(|regex| (Name::from(name.as_str()), regex))
                    .map_err(|source| RuleError::Regex {
                        field: "headers",
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let time_window = match &conditions.time_window {
            Some(window) => {
                let mut days = [false; 7];

                for day in &window.days {
                    let index = day_index(day)
                        .ok_or_else(|| RuleError::TimeWindow(format!("unknown day {day:?}")))?;
                    days[index] = true;
                }

                if window.days.is_empty() {
                    days = [true; 7];
                }

                let parse = |field: &Option<String>| -> Result<Option<NaiveTime>, RuleError> {
                    field
                        .as_ref()
                        .map(|value| {
                            parse_hhmm(value).ok_or_else(|| {
                                RuleError::TimeWindow(format!("bad time {value:?}"))
                            })
                        })
                        .transpose()
                };

                Some(CompiledWindow {
                    days,
                    start: parse(&window.start)?,
                    end: parse(&window.end)?,
                })
            }
            None => None,
        };

        Ok(CompiledRule {
            request_uri: compile_anchored("request_uri", &conditions.request_uri)?,
            from_uri: compile_anchored("from_uri", &conditions.from_uri)?,
            to_uri: compile_anchored("to_uri", &conditions.to_uri)?,
            source_ips,
            headers,
            time_window,
            rule,
        })
    }

    fn matches(&self, input: &RouteInput<'_>, now: DateTime<Local>) -> bool {
        if let Some(regex) = &self.request_uri {
            if !regex.is_match(&input.request_uri) {
                return false;
            }
        }

        if let Some(regex) = &self.from_uri {
            if !regex.is_match(input.from) {
                return false;
            }
        }

        if let Some(regex) = &self.to_uri {
            if !regex.is_match(input.to) {
                return false;
            }
        }

        if !self.source_ips.is_empty()
            && !self.source_ips.iter().any(|net| net.contains(input.source_ip))
        {
            return false;
        }

        for (name, regex) in &self.headers {
            let mut values = input.headers.get_all(name).peekable();

            if values.peek().is_none() {
                // header absent, no match
                return false;
            }

            if !values.any(|value| regex.is_match(value)) {
                return false;
            }
        }

        if let Some(window) = &self.time_window {
            if !window.contains(now) {
                return false;
            }
        }

        true
    }

    fn decision(&self) -> RouteDecision {
        let rule_id = self.rule.id.clone();

        match &self.rule.action {
            RuleAction::Reject { code, reason } => RouteDecision::Reject {
                rule_id,
                code: *code,
                reason: reason.clone(),
            },
            RuleAction::Redirect { target } => RouteDecision::Redirect {
                rule_id,
                target: target.clone(),
            },
            RuleAction::Forward {
                next_hop,
                add_headers,
                remove_headers,
                media_flags,
            } => RouteDecision::Forward {
                rule_id,
                next_hop: next_hop.clone(),
                add_headers: add_headers
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                remove_headers: remove_headers.clone(),
                media_flags: media_flags.clone(),
            },
        }
    }
}

impl CompiledWindow {
    fn contains(&self, now: DateTime<Local>) -> bool {
        let day = now.weekday().num_days_from_monday() as usize;

        if !self.days[day] {
            return false;
        }

        let (Some(start), Some(end)) = (self.start, self.end) else {
            // a single bound or none restricts nothing beyond the days
            return true;
        };

        let time = NaiveTime::from_hms_opt(now.hour(), now.minute(), 0).unwrap();

        if end <= start {
            // wrap-around window like 22:00-06:00
            time >= start || time < end
        } else {
            time >= start && time < end
        }
    }
}

/// Reject rules that are malformed or mutate headers the B2BUA owns
pub fn validate(rule: &RoutingRule) -> Result<(), RuleError> {
    match &rule.action {
        RuleAction::Reject { code, .. } => {
            if !(300..700).contains(code) {
                return Err(RuleError::ResponseCode(*code));
            }
        }
        RuleAction::Redirect { target } => {
            sip_types::uri::SipUri::parse(target)
                .map_err(|_| RuleError::NextHop(target.clone()))?;
        }
        RuleAction::Forward {
            next_hop,
            add_headers,
            remove_headers,
            ..
        } => {
            sip_types::uri::SipUri::parse(next_hop)
                .map_err(|_| RuleError::NextHop(next_hop.clone()))?;

            for name in add_headers.keys().chain(remove_headers.iter()) {
                let name = Name::from(name.as_str());

                if PROTECTED_HEADERS.iter().any(|protected| *protected == name) {
                    return Err(RuleError::ProtectedHeader(
                        rule.id.clone(),
                        name.as_print_str().to_owned(),
                    ));
                }
            }
        }
    }

    Ok(())
}

/// The compiled, totally ordered rule set
#[derive(Default)]
struct RuleSet {
    rules: Vec<CompiledRule>,
}

/// Routing engine holding the published rule snapshot
pub struct RoutingEngine {
    snapshot: ArcSwap<RuleSet>,
}

impl Default for RoutingEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingEngine {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RuleSet::default()),
        }
    }

    /// Compile and publish a new rule set. Malformed rules are skipped with
    /// a warning so one bad blob cannot take routing down.
    pub fn publish(&self, rules: Vec<RoutingRule>) {
        let mut compiled: Vec<CompiledRule> = rules
            .into_iter()
            .filter_map(|rule| {
                let id = rule.id.clone();

                match CompiledRule::compile(rule) {
                    Ok(compiled) => Some(compiled),
                    Err(e) => {
                        log::warn!("skipping malformed routing rule {id}: {e}");
                        None
                    }
                }
            })
            .collect();

        // total order: priority desc, id asc
        compiled.sort_by(|a, b| {
            b.rule
                .priority
                .cmp(&a.rule.priority)
                .then_with(|| a.rule.id.cmp(&b.rule.id))
        });

        log::info!("published routing snapshot with {} rules", compiled.len());

        self.snapshot.store(Arc::new(RuleSet { rules: compiled }));
    }

    /// Walk the ordered rule list and return the first match's action
    pub fn route(&self, input: &RouteInput<'_>) -> RouteDecision {
        self.route_at(input, Local::now())
    }

    /// [`RoutingEngine::route`] with an explicit clock, for time window tests
    pub fn route_at(&self, input: &RouteInput<'_>, now: DateTime<Local>) -> RouteDecision {
        let snapshot = self.snapshot.load();

        for rule in &snapshot.rules {
            if !rule.rule.enabled {
                continue;
            }

            if rule.matches(input, now) {
                log::debug!("request matched rule {}", rule.rule.id);

                return rule.decision();
            }
        }

        RouteDecision::NoMatch
    }

    /// Number of rules in the active snapshot
    pub fn active_rules(&self) -> usize {
        self.snapshot.load().rules.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn forward_rule(id: &str, priority: u32, uri_pattern: &str, next_hop: &str) -> RoutingRule {
        RoutingRule {
            id: id.into(),
            priority,
            enabled: true,
            description: String::new(),
            conditions: RuleConditions {
                request_uri: uri_pattern.into(),
                ..Default::default()
            },
            action: RuleAction::Forward {
                next_hop: next_hop.into(),
                add_headers: HashMap::new(),
                remove_headers: vec![],
                media_flags: String::new(),
            },
        }
    }

    fn input<'i>(request_uri: &str, headers: &'i Headers) -> RouteInput<'i> {
        RouteInput {
            request_uri: request_uri.into(),
            from: "<sip:787@example.com>;tag=abc",
            to: "<sip:999@example.com>",
            source_ip: "198.51.100.4".parse().unwrap(),
            headers,
        }
    }

    #[test]
    fn first_match_by_priority_then_id() {
        let engine = RoutingEngine::new();

        engine.publish(vec![
            forward_rule("b-low", 10, "", "sip:low@192.0.2.1"),
            forward_rule("z-high", 100, "", "sip:z@192.0.2.1"),
            forward_rule("a-high", 100, "", "sip:a@192.0.2.1"),
        ]);

        let headers = Headers::new();

        match engine.route(&input("sip:999@example.com", &headers)) {
            RouteDecision::Forward { rule_id, .. } => assert_eq!(rule_id, "a-high"),
            decision => panic!("unexpected decision {decision:?}"),
        }
    }

    #[test]
    fn request_uri_regex_is_full_match() {
        let engine = RoutingEngine::new();

        engine.publish(vec![forward_rule(
            "nine",
            100,
            r"sip:9\d\d@example\.com",
            "sip:gw@192.0.2.1:5060",
        )]);

        let headers = Headers::new();

        assert!(matches!(
            engine.route(&input("sip:999@example.com", &headers)),
            RouteDecision::Forward { .. }
        ));

        // prefix only must not match
        assert_eq!(
            engine.route(&input("sip:999@example.com.evil.org", &headers)),
            RouteDecision::NoMatch
        );
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let engine = RoutingEngine::new();

        let mut rule = forward_rule("off", 100, "", "sip:gw@192.0.2.1");
        rule.enabled = false;

        engine.publish(vec![rule]);

        let headers = Headers::new();

        assert_eq!(
            engine.route(&input("sip:999@example.com", &headers)),
            RouteDecision::NoMatch
        );
    }

    #[test]
    fn source_ip_cidr() {
        let engine = RoutingEngine::new();

        let mut rule = forward_rule("net", 100, "", "sip:gw@192.0.2.1");
        rule.conditions.source_ips = vec!["198.51.100.0/24".into()];

        engine.publish(vec![rule]);

        let headers = Headers::new();

        assert!(matches!(
            engine.route(&input("sip:999@example.com", &headers)),
            RouteDecision::Forward { .. }
        ));

        let mut outside = input("sip:999@example.com", &headers);
        outside.source_ip = "203.0.113.9".parse().unwrap();

        assert_eq!(engine.route(&outside), RouteDecision::NoMatch);
    }

    #[test]
    fn header_condition_requires_presence() {
        let engine = RoutingEngine::new();

        let mut rule = forward_rule("hdr", 100, "", "sip:gw@192.0.2.1");
        rule.conditions
            .headers
            .insert("X-Carrier".into(), "gold|silver".into());

        engine.publish(vec![rule]);

        let absent = Headers::new();
        assert_eq!(
            engine.route(&input("sip:999@example.com", &absent)),
            RouteDecision::NoMatch
        );

        let mut present = Headers::new();
        present.insert("X-Carrier", "bronze");
        present.insert("X-Carrier", "gold");

        assert!(matches!(
            engine.route(&input("sip:999@example.com", &present)),
            RouteDecision::Forward { .. }
        ));
    }

    #[test]
    fn reject_action_short_circuits() {
        let engine = RoutingEngine::new();

        let mut reject = forward_rule("deny", 200, "", "sip:unused@192.0.2.1");
        reject.action = RuleAction::Reject {
            code: 603,
            reason: "Decline".into(),
        };

        engine.publish(vec![
            reject,
            forward_rule("fallback", 100, "", "sip:gw@192.0.2.1"),
        ]);

        let headers = Headers::new();

        assert_eq!(
            engine.route(&input("sip:999@example.com", &headers)),
            RouteDecision::Reject {
                rule_id: "deny".into(),
                code: 603,
                reason: "Decline".into(),
            }
        );
    }

    #[test]
    fn wraparound_time_window() {
        let engine = RoutingEngine::new();

        let mut rule = forward_rule("night", 100, "", "sip:gw@192.0.2.1");
        rule.conditions.time_window = Some(TimeWindow {
            days: vec![],
            start: Some("22:00".into()),
            end: Some("06:00".into()),
        });

        engine.publish(vec![rule]);

        let headers = Headers::new();
        let request = input("sip:999@example.com", &headers);

        let at_23 = Local.with_ymd_and_hms(2026, 7, 1, 23, 0, 0).unwrap();
        let at_05 = Local.with_ymd_and_hms(2026, 7, 1, 5, 30, 0).unwrap();
        let at_12 = Local.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap();

        assert!(matches!(
            engine.route_at(&request, at_23),
            RouteDecision::Forward { .. }
        ));
        assert!(matches!(
            engine.route_at(&request, at_05),
            RouteDecision::Forward { .. }
        ));
        assert_eq!(engine.route_at(&request, at_12), RouteDecision::NoMatch);
    }

    #[test]
    fn day_of_week_window() {
        let engine = RoutingEngine::new();

        let mut rule = forward_rule("weekdays", 100, "", "sip:gw@192.0.2.1");
        rule.conditions.time_window = Some(TimeWindow {
            days: vec!["mon".into(), "tue".into(), "wed".into(), "thu".into(), "fri".into()],
            start: None,
            end: None,
        });

        engine.publish(vec![rule]);

        let headers = Headers::new();
        let request = input("sip:999@example.com", &headers);

        // 2026-07-01 is a wednesday, 2026-07-04 a saturday
        let wednesday = Local.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap();
        let saturday = Local.with_ymd_and_hms(2026, 7, 4, 12, 0, 0).unwrap();

        assert!(matches!(
            engine.route_at(&request, wednesday),
            RouteDecision::Forward { .. }
        ));
        assert_eq!(engine.route_at(&request, saturday), RouteDecision::NoMatch);
    }

    #[test]
    fn malformed_rule_is_skipped_not_fatal() {
        let engine = RoutingEngine::new();

        engine.publish(vec![
            forward_rule("bad", 200, "(unclosed", "sip:gw@192.0.2.1"),
            forward_rule("good", 100, "", "sip:gw@192.0.2.1"),
        ]);

        assert_eq!(engine.active_rules(), 1);

        let headers = Headers::new();
        assert!(matches!(
            engine.route(&input("sip:999@example.com", &headers)),
            RouteDecision::Forward { .. }
        ));
    }

    #[test]
    fn acl_deny_wins_over_allow() {
        let acl = SourceAcl::new(
            &["198.51.100.0/24".into()],
            &["198.51.100.66".into()],
        );

        assert!(acl.permits("198.51.100.4".parse().unwrap()));
        assert!(!acl.permits("198.51.100.66".parse().unwrap()));
        // outside the allow list
        assert!(!acl.permits("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn empty_acl_permits_everything() {
        let acl = SourceAcl::new(&[], &[]);

        assert!(acl.permits("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn deny_only_acl_admits_the_rest() {
        let acl = SourceAcl::new(&[], &["203.0.113.0/24".into()]);

        assert!(!acl.permits("203.0.113.9".parse().unwrap()));
        assert!(acl.permits("198.51.100.4".parse().unwrap()));
    }

    #[test]
    fn malformed_acl_entries_are_skipped() {
        let acl = SourceAcl::new(&["not-a-network".into()], &[]);

        // the malformed allow entry is dropped, leaving the list empty
        assert!(acl.permits("198.51.100.4".parse().unwrap()));
    }

    #[test]
    fn rules_must_not_touch_managed_headers() {
        let mut rule = forward_rule("via", 100, "", "sip:gw@192.0.2.1");

        if let RuleAction::Forward { add_headers, .. } = &mut rule.action {
            add_headers.insert("Via".into(), "SIP/2.0/UDP evil".into());
        }

        assert!(matches!(
            validate(&rule),
            Err(RuleError::ProtectedHeader(..))
        ));
    }
}
