/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use elasticsearch::SearchParts;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{Error, ReportWindow, Reporter, Result};

pub const PAGE_SIZE: usize = 1000;
pub const SAMPLE_SIZE: usize = 10;

/// One page of composite aggregation results. Pagination is complete
/// when `buckets` is empty.
pub struct SearchPage {
    pub buckets: Vec<Value>,
    pub after_key: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct PolicyDomainSummary {
    pub domain: String,
    pub count: u64,
    pub policy_types: Vec<PolicyTypeSummary>,
}

#[derive(Debug, Clone)]
pub struct PolicyTypeSummary {
    pub policy_type: String,
    pub count: u64,
    pub result_types: Vec<ResultTypeSummary>,
}

#[derive(Debug, Clone)]
pub struct ResultTypeSummary {
    pub result_type: String,
    pub count: u64,
    pub details: Vec<ConnectionDetail>,
}

/// Per (sending IP, receiving IP) breakdown, enriched with fields taken
/// from the first of up to [`SAMPLE_SIZE`] sampled source documents.
#[derive(Debug, Clone)]
pub struct ConnectionDetail {
    pub count: u64,
    pub sending_mta_ip: String,
    pub receiving_ip: String,
    pub receiving_mx_hostname: Option<String>,
    pub receiving_mx_helo: Option<String>,
    pub policy_string: Option<PolicyString>,
}

/// Telemetry documents store the policy string either as a single string
/// or as a list of policy lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PolicyString {
    One(String),
    Many(Vec<String>),
}

impl Reporter {
    pub async fn search(&self, window: &ReportWindow, after: Option<Value>) -> Result<SearchPage> {
        let client = self.client.as_ref().ok_or(Error::SearchUnavailable)?;
        let response = client
            .search(SearchParts::Index(&[self.config.index.as_str()]))
            .body(search_body(window, after))
            .send()
            .await?;
        parse_page(response.json::<Value>().await?)
    }
}

pub fn search_body(window: &ReportWindow, after: Option<Value>) -> Value {
    let mut composite = json!({
        "size": PAGE_SIZE,
        "sources": {
            "policy-domain": {
                "terms": {
                    "field": "policy-domain.keyword"
                }
            }
        }
    });
    if let Some(after) = after {
        composite["after"] = after;
    }

    json!({
        "size": 0,
        "query": {
            "range": {
                "timestamp": {
                    "gte": window.start_millis(),
                    "lte": window.end_millis()
                }
            }
        },
        "aggs": {
            "tlsrpt": {
                "composite": composite,
                "aggs": {
                    "policy-type": {
                        "terms": {
                            "field": "policy-type.keyword"
                        },
                        "aggs": {
                            "result-type": {
                                "terms": {
                                    "field": "result-type.keyword"
                                },
                                "aggs": {
                                    "details": {
                                        "multi_terms": {
                                            "terms": [
                                                {
                                                    "field": "sending-mta-ip.keyword"
                                                },
                                                {
                                                    "field": "receiving-ip.keyword"
                                                }
                                            ]
                                        },
                                        "aggs": {
                                            "additional_details": {
                                                "top_hits": {
                                                    "_source": [
                                                        "receiving-mx-hostname",
                                                        "policy-string",
                                                        "receiving-mx-helo"
                                                    ],
                                                    "size": SAMPLE_SIZE
                                                }
                                            }
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    })
}

/// Partial aggregation data cannot be trusted, so a response without the
/// expected aggregation path aborts the run rather than ending it.
pub fn parse_page(mut response: Value) -> Result<SearchPage> {
    let aggregation = response
        .get_mut("aggregations")
        .and_then(|aggs| aggs.get_mut("tlsrpt"))
        .ok_or(Error::NoData("missing tlsrpt aggregation"))?;
    let after_key = aggregation.get_mut("after_key").map(Value::take);
    let buckets = match aggregation.get_mut("buckets").map(Value::take) {
        Some(Value::Array(buckets)) => buckets,
        _ => Vec::new(),
    };

    Ok(SearchPage { buckets, after_key })
}

/// Reshapes one top-level composite bucket into a summary record.
pub fn format_bucket(bucket: &Value) -> PolicyDomainSummary {
    PolicyDomainSummary {
        domain: bucket["key"]["policy-domain"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        count: bucket["doc_count"].as_u64().unwrap_or(0),
        policy_types: sub_buckets(&bucket["policy-type"])
            .map(|pt| PolicyTypeSummary {
                policy_type: pt["key"].as_str().unwrap_or_default().to_string(),
                count: pt["doc_count"].as_u64().unwrap_or(0),
                result_types: sub_buckets(&pt["result-type"])
                    .map(|rt| ResultTypeSummary {
                        result_type: rt["key"].as_str().unwrap_or_default().to_string(),
                        count: rt["doc_count"].as_u64().unwrap_or(0),
                        details: sub_buckets(&rt["details"]).map(format_detail).collect(),
                    })
                    .collect(),
            })
            .collect(),
    }
}

fn format_detail(detail: &Value) -> ConnectionDetail {
    let sample = detail["additional_details"]["hits"]["hits"]
        .get(0)
        .map(|hit| &hit["_source"]);

    ConnectionDetail {
        count: detail["doc_count"].as_u64().unwrap_or(0),
        sending_mta_ip: detail["key"][0].as_str().unwrap_or_default().to_string(),
        receiving_ip: detail["key"][1].as_str().unwrap_or_default().to_string(),
        receiving_mx_hostname: sample
            .and_then(|source| source["receiving-mx-hostname"].as_str())
            .map(str::to_string),
        receiving_mx_helo: sample
            .and_then(|source| source["receiving-mx-helo"].as_str())
            .map(str::to_string),
        policy_string: sample.and_then(|source| policy_string(&source["policy-string"])),
    }
}

fn sub_buckets(aggregation: &Value) -> impl Iterator<Item = &Value> {
    aggregation["buckets"]
        .as_array()
        .map(|buckets| buckets.iter())
        .into_iter()
        .flatten()
}

fn policy_string(value: &Value) -> Option<PolicyString> {
    match value {
        Value::String(line) => Some(PolicyString::One(line.clone())),
        Value::Array(lines) => Some(PolicyString::Many(
            lines
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
        )),
        _ => None,
    }
}
