/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use serde::{Deserialize, Serialize};

use crate::{resolve::ResolvedDomain, search::PolicyString, ReportWindow};

/// Shared by every report produced in a run: one report identifier, one
/// aggregation window.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub report_id: String,
    pub organization_name: String,
    pub contact_info: String,
    pub submitter: String,
    pub window: ReportWindow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AggregateReport {
    pub organization_name: String,
    pub date_range: DateRange,
    pub contact_info: String,
    pub report_id: String,
    pub policies: Vec<PolicyResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DateRange {
    pub start_datetime: String,
    pub end_datetime: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PolicyResult {
    pub policy: PolicyDetails,
    pub summary: Summary,
    pub failure_details: Vec<FailureDetail>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PolicyDetails {
    pub policy_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_string: Option<PolicyString>,
    pub policy_domain: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Summary {
    pub total_successful_session_count: u64,
    pub total_failure_session_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FailureDetail {
    pub result_type: String,
    pub sending_mta_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiving_mx_hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiving_mx_helo: Option<String>,
    pub receiving_ip: String,
    pub failed_session_count: u64,
}

/// Builds the aggregate report document for one resolved domain. Pure
/// transformation, no I/O.
///
/// The policy string surfaced per policy is whatever the last visited
/// connection detail carried, starting from an empty string. Receivers
/// have only ever seen this selection rule, keep it until confirmed
/// otherwise.
pub fn compose(resolved: &ResolvedDomain, ctx: &RunContext) -> AggregateReport {
    let mut policies = Vec::with_capacity(resolved.summary.policy_types.len());
    for policy_type in &resolved.summary.policy_types {
        let mut summary = Summary::default();
        let mut policy_string = Some(PolicyString::One(String::new()));
        let mut failure_details = Vec::new();

        for result_type in &policy_type.result_types {
            if result_type.result_type == "success" {
                summary.total_successful_session_count += result_type.count;
            } else {
                summary.total_failure_session_count += result_type.count;
            }
            for detail in &result_type.details {
                policy_string = detail.policy_string.clone();
                if result_type.result_type != "success" {
                    failure_details.push(FailureDetail {
                        result_type: result_type.result_type.clone(),
                        sending_mta_ip: detail.sending_mta_ip.clone(),
                        receiving_mx_hostname: detail.receiving_mx_hostname.clone(),
                        receiving_mx_helo: detail.receiving_mx_helo.clone(),
                        receiving_ip: detail.receiving_ip.clone(),
                        failed_session_count: detail.count,
                    });
                }
            }
        }

        policies.push(PolicyResult {
            policy: PolicyDetails {
                policy_type: policy_type.policy_type.clone(),
                policy_string,
                policy_domain: resolved.summary.domain.clone(),
            },
            summary,
            failure_details,
        });
    }

    AggregateReport {
        organization_name: ctx.organization_name.clone(),
        date_range: DateRange {
            start_datetime: ctx.window.start_rfc3339(),
            end_datetime: ctx.window.end_rfc3339(),
        },
        contact_info: ctx.contact_info.clone(),
        report_id: ctx.report_id.clone(),
        policies,
    }
}
