//! Registration metadata derived from `SERVICE_*` annotations
//!
//! Two key shapes are recognized on the owning Service:
//! - `SERVICE_<KEY>=value` applies to every port,
//! - `SERVICE_<PORT>_<KEY>=value` applies to one port and wins over the
//!   global form of the same key.
//!
//! `<KEY>` is matched case-insensitively against the known keys below.
//! `TAG_<n>` and `TAG_<name>` keys append to the tag list instead of
//! replacing it.

use crate::endpoint::HealthCheck;
use crate::{CoreError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

const SERVICE_PREFIX: &str = "SERVICE_";
const TAG_PREFIX: &str = "tag_";
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MetadataKey {
    Name,
    Ignore,
    Tags,
    CheckHttp,
    CheckHttps,
    CheckInterval,
    CheckTimeout,
}

// Longest first: prefixes are tried in order.
const KNOWN_KEYS: &[(&str, MetadataKey)] = &[
    ("check_interval", MetadataKey::CheckInterval),
    ("check_timeout", MetadataKey::CheckTimeout),
    ("check_https", MetadataKey::CheckHttps),
    ("check_http", MetadataKey::CheckHttp),
    ("ignore", MetadataKey::Ignore),
    ("tags", MetadataKey::Tags),
    ("name", MetadataKey::Name),
    ("tag", MetadataKey::Tags),
];

/// Metadata resolved for one port of a Service
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceMetadata {
    pub name: Option<String>,
    pub ignore: bool,
    pub tags: Vec<String>,
    pub check_http: Option<String>,
    pub check_https: Option<String>,
    pub check_interval: Option<String>,
    pub check_timeout: Option<String>,
    /// Keys whose value came from a port-scoped annotation
    pub from_port: BTreeSet<MetadataKey>,
}

#[derive(Default)]
struct Scope {
    scalars: BTreeMap<MetadataKey, String>,
    tags: Vec<String>,
    has_tags: bool,
}

impl Scope {
    fn apply(&mut self, key: &str, cased: &str, value: &str) {
        let Some((known, field)) = match_known_key(key) else {
            return;
        };

        if field == MetadataKey::Tags {
            if key == known {
                self.tags.extend(tags_to_array(value));
                self.has_tags = true;
            } else if let Some(suffix) = cased
                .get(TAG_PREFIX.len()..)
                .filter(|_| key.starts_with(TAG_PREFIX))
                .filter(|suffix| !suffix.is_empty())
            {
                if suffix.parse::<u64>().is_ok() {
                    self.tags.push(value.trim().to_string());
                } else {
                    self.tags.push(format!("{}={}", suffix, value.trim()));
                }
                self.has_tags = true;
            }
            return;
        }

        // `name_extra` matches `name` as a prefix but does not name a field
        if key == known {
            self.scalars.insert(field, value.to_string());
        }
    }
}

fn match_known_key(key: &str) -> Option<(&'static str, MetadataKey)> {
    KNOWN_KEYS
        .iter()
        .find(|(known, _)| key.starts_with(known))
        .copied()
}

/// Resolve the metadata that applies to `port` from a Service's annotations.
pub fn service_metadata(annotations: Option<&BTreeMap<String, String>>, port: u16) -> ServiceMetadata {
    let mut global = Scope::default();
    let mut scoped = Scope::default();
    let port = port.to_string();

    for (raw_key, value) in annotations.into_iter().flatten() {
        let Some(cased) = raw_key.strip_prefix(SERVICE_PREFIX) else {
            continue;
        };
        let key = cased.to_ascii_lowercase();

        match key.split_once('_') {
            Some((left, right)) if left.parse::<u32>().is_ok() => {
                if left != port {
                    continue;
                }
                let cased_right = &cased[left.len() + 1..];
                scoped.apply(right, cased_right, value);
            }
            _ => global.apply(&key, cased, value),
        }
    }

    let mut metadata = ServiceMetadata::default();
    let mut resolve = |field: MetadataKey| -> Option<String> {
        if let Some(value) = scoped.scalars.get(&field) {
            metadata.from_port.insert(field);
            return Some(value.clone());
        }
        global.scalars.get(&field).cloned()
    };

    let name = resolve(MetadataKey::Name).filter(|n| !n.is_empty());
    let ignore = resolve(MetadataKey::Ignore).is_some();
    let check_http = resolve(MetadataKey::CheckHttp).filter(|v| !v.is_empty());
    let check_https = resolve(MetadataKey::CheckHttps).filter(|v| !v.is_empty());
    let check_interval = resolve(MetadataKey::CheckInterval).filter(|v| !v.is_empty());
    let check_timeout = resolve(MetadataKey::CheckTimeout).filter(|v| !v.is_empty());

    metadata.name = name;
    metadata.ignore = ignore;
    metadata.check_http = check_http;
    metadata.check_https = check_https;
    metadata.check_interval = check_interval;
    metadata.check_timeout = check_timeout;

    if scoped.has_tags {
        metadata.from_port.insert(MetadataKey::Tags);
        metadata.tags = scoped.tags;
    } else {
        metadata.tags = global.tags;
    }

    metadata
}

impl ServiceMetadata {
    /// Build the health check for an address, `Ok(None)` when none is declared.
    pub fn health_check(&self, address: &str, port: u16) -> Result<Option<HealthCheck>> {
        let (scheme, target) = match (&self.check_https, &self.check_http) {
            (Some(target), _) => ("https", target),
            (None, Some(target)) => ("http", target),
            (None, None) => return Ok(None),
        };

        let http = if target.starts_with("http://") || target.starts_with("https://") {
            target.clone()
        } else {
            let path = if target.starts_with('/') {
                target.clone()
            } else {
                format!("/{}", target)
            };
            format!("{}://{}:{}{}", scheme, address, port, path)
        };

        let interval = match &self.check_interval {
            Some(raw) => parse_duration(raw)?,
            None => DEFAULT_CHECK_INTERVAL,
        };
        let timeout = self.check_timeout.as_deref().map(parse_duration).transpose()?;

        Ok(Some(HealthCheck {
            http,
            interval,
            timeout,
        }))
    }
}

fn parse_duration(raw: &str) -> Result<Duration> {
    humantime::parse_duration(raw.trim())
        .map_err(|e| CoreError::InvalidMetadata(format!("bad duration {:?}: {}", raw, e)))
}

/// Names declared through `SERVICE_NAME` or `SERVICE_<port>_NAME`.
pub fn declared_service_names(annotations: Option<&BTreeMap<String, String>>) -> BTreeSet<String> {
    annotations
        .into_iter()
        .flatten()
        .filter(|(key, value)| !value.is_empty() && is_name_key(key))
        .map(|(_, value)| value.clone())
        .collect()
}

fn is_name_key(key: &str) -> bool {
    let Some(rest) = key.strip_prefix(SERVICE_PREFIX) else {
        return false;
    };
    let rest = rest.to_ascii_lowercase();
    let Some(scope) = rest.strip_suffix("name") else {
        return false;
    };
    match scope.strip_suffix('_') {
        None => scope.is_empty(),
        Some(port) => !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()),
    }
}

/// Split a comma separated tag list, trimming and dropping empty segments.
pub fn tags_to_array(tags: &str) -> Vec<String> {
    tags.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}
