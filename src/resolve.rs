/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{future::Future, time::Duration};

use hickory_resolver::{
    config::{ResolverConfig, ResolverOpts},
    system_conf::read_system_conf,
    TokioAsyncResolver,
};

use crate::{pool::Task, search::PolicyDomainSummary};

pub const RECORD_PREFIX: &str = "v=TLSRPTv1;";
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(1);

/// One parsed `rua=` entry from a domain's policy record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAddress {
    pub scheme: AddressScheme,
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressScheme {
    Mail,
    Https,
}

/// A policy domain with at least one parsed delivery address; domains
/// without one cannot be reported and are never constructed.
#[derive(Debug, Clone)]
pub struct ResolvedDomain {
    pub summary: PolicyDomainSummary,
    pub addresses: Vec<DeliveryAddress>,
}

pub struct PolicyResolver {
    resolver: TokioAsyncResolver,
}

impl PolicyResolver {
    pub fn new() -> Self {
        let (config, mut opts) = read_system_conf()
            .unwrap_or_else(|_| (ResolverConfig::default(), ResolverOpts::default()));
        // One attempt with a hard timeout; a slow or unreachable resolver
        // must not stall the batch. Answers are not cached, every run
        // sees live records.
        opts.timeout = LOOKUP_TIMEOUT;
        opts.attempts = 1;
        opts.cache_size = 0;

        PolicyResolver {
            resolver: TokioAsyncResolver::tokio(config, opts),
        }
    }

    /// Returns the first `v=TLSRPTv1;` TXT record published at
    /// `_smtp._tls.<domain>`, or `None` on any lookup failure.
    async fn lookup_record(&self, domain: &str) -> Option<String> {
        match self
            .resolver
            .txt_lookup(format!("_smtp._tls.{domain}."))
            .await
        {
            Ok(lookup) => select_record(lookup.iter().map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|data| String::from_utf8_lossy(data))
                    .collect::<String>()
            })),
            Err(err) => {
                tracing::debug!(
                    context = "resolve",
                    event = "dns-error",
                    domain = domain,
                    reason = %err,
                );
                None
            }
        }
    }
}

impl Task for PolicyResolver {
    type Item = PolicyDomainSummary;
    type Output = ResolvedDomain;

    fn exec(&self, item: PolicyDomainSummary) -> impl Future<Output = Option<ResolvedDomain>> + Send {
        async move {
            let record = self.lookup_record(&item.domain).await?;
            let addresses = parse_rua(&record);
            if addresses.is_empty() {
                tracing::debug!(
                    context = "resolve",
                    event = "no-rua",
                    domain = item.domain.as_str(),
                );
                return None;
            }

            Some(ResolvedDomain {
                summary: item,
                addresses,
            })
        }
    }
}

pub fn select_record<I>(records: I) -> Option<String>
where
    I: IntoIterator<Item = String>,
{
    records
        .into_iter()
        .find(|record| record.starts_with(RECORD_PREFIX))
}

/// Extracts the `rua=` field from a policy record and parses its
/// comma-separated entries. Entries that are neither an HTTP(S) URL nor
/// a `mailto:` URI are silently skipped.
pub fn parse_rua(record: &str) -> Vec<DeliveryAddress> {
    record
        .split(';')
        .find_map(|segment| segment.trim().strip_prefix("rua="))
        .map(|value| value.split(',').filter_map(parse_rua_entry).collect())
        .unwrap_or_default()
}

fn parse_rua_entry(entry: &str) -> Option<DeliveryAddress> {
    let entry = entry.trim();
    if let Some(target) = entry.strip_prefix("mailto:") {
        if !target.is_empty() {
            Some(DeliveryAddress {
                scheme: AddressScheme::Mail,
                target: target.to_string(),
            })
        } else {
            None
        }
    } else if entry.starts_with("https://") || entry.starts_with("http://") {
        Some(DeliveryAddress {
            scheme: AddressScheme::Https,
            target: entry.to_string(),
        })
    } else {
        None
    }
}
