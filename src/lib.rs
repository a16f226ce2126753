/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{sync::Arc, time::Instant};

use chrono::{DateTime, Duration, Utc};
use elasticsearch::{
    auth::Credentials,
    cert::CertificateValidation,
    http::transport::{MultiNodeConnectionPool, SingleNodeConnectionPool, TransportBuilder},
    Elasticsearch,
};
use url::Url;
use uuid::Uuid;

use crate::{
    config::{Config, ElasticsearchConfig},
    pool::WorkerPool,
    report::RunContext,
    resolve::PolicyResolver,
    search::format_bucket,
    send::Dispatcher,
};

pub mod config;
pub mod pool;
pub mod report;
pub mod resolve;
pub mod search;
pub mod send;

pub static USER_AGENT: &str = concat!("StalwartTLSRPT/", env!("CARGO_PKG_VERSION"),);

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no search backend configured")]
    SearchUnavailable,
    #[error("search request failed: {0}")]
    Search(#[from] elasticsearch::Error),
    #[error("unexpected search response: {0}")]
    NoData(&'static str),
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub struct Reporter {
    pub(crate) config: Arc<Config>,
    pub(crate) client: Option<Elasticsearch>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub domains: usize,
    pub reports: usize,
    pub delivered: usize,
    pub failed: usize,
}

impl Reporter {
    pub fn new(config: Config) -> Result<Self> {
        let client = config
            .elasticsearch
            .as_ref()
            .map(build_client)
            .transpose()?;

        Ok(Reporter {
            config: Arc::new(config),
            client,
        })
    }

    /// Executes a single reporting run over the previous UTC day: pages
    /// through the aggregation, resolves each policy domain's reporting
    /// addresses, then composes and delivers one report per domain.
    pub async fn run(&self) -> Result<RunSummary> {
        let started = Instant::now();
        let report_id = Uuid::new_v4().to_string();
        let window = ReportWindow::previous_day();
        tracing::info!(
            context = "run",
            event = "start",
            report_id = report_id.as_str(),
            range_from = window.start_rfc3339().as_str(),
            range_to = window.end_rfc3339().as_str(),
        );

        let pool = WorkerPool::new(self.config.workers);
        let resolver = Arc::new(PolicyResolver::new());

        // Aggregation drains completely before any delivery starts: the
        // run identifier and window must cover the full resolved set.
        let mut queue = Vec::new();
        let mut domains = 0;
        let mut after = None;
        loop {
            let page = self.search(&window, after.take()).await?;
            if page.buckets.is_empty() {
                break;
            }
            let summaries = page.buckets.iter().map(format_bucket).collect::<Vec<_>>();
            domains += summaries.len();
            queue.extend(pool.run(resolver.clone(), summaries).await);
            after = page.after_key;
            if after.is_none() {
                break;
            }
        }
        tracing::info!(
            context = "run",
            event = "aggregated",
            domains = domains,
            reportable = queue.len(),
            elapsed = started.elapsed().as_secs(),
        );

        let reports = queue.len();
        let dispatcher = Arc::new(Dispatcher::new(
            self.config.clone(),
            RunContext {
                report_id,
                organization_name: self.config.report.organization_name.clone(),
                contact_info: self.config.report.contact_info.clone(),
                submitter: self.config.report.submitter.clone(),
                window,
            },
        )?);
        let outcomes = pool.run(dispatcher, queue).await;
        let (delivered, failed) = outcomes
            .iter()
            .fold((0, 0), |(d, f), o| (d + o.delivered, f + o.failed));
        tracing::info!(
            context = "run",
            event = "completed",
            reports = reports,
            delivered = delivered,
            failed = failed,
            elapsed = started.elapsed().as_secs(),
        );

        Ok(RunSummary {
            domains,
            reports,
            delivered,
            failed,
        })
    }
}

fn build_client(config: &ElasticsearchConfig) -> Result<Elasticsearch> {
    let mut urls = Vec::with_capacity(config.urls.len());
    for url in &config.urls {
        urls.push(
            Url::parse(url)
                .map_err(|err| Error::Config(format!("invalid elasticsearch url {url:?}: {err}")))?,
        );
    }
    let mut builder = if urls.len() == 1 {
        TransportBuilder::new(SingleNodeConnectionPool::new(urls.remove(0)))
    } else if !urls.is_empty() {
        TransportBuilder::new(MultiNodeConnectionPool::round_robin(urls, None))
    } else {
        return Err(Error::Config(
            "at least one elasticsearch url must be specified".to_string(),
        ));
    };
    if let Some(auth) = &config.auth {
        builder = builder.auth(Credentials::Basic(
            auth.username.clone(),
            auth.password.clone(),
        ));
    }
    if config.tls.allow_invalid_certs {
        builder = builder.cert_validation(CertificateValidation::None);
    }
    let transport = builder
        .build()
        .map_err(|err| Error::Config(format!("failed to build elasticsearch transport: {err}")))?;

    Ok(Elasticsearch::new(transport))
}

impl ReportWindow {
    /// The aggregation window: the previous UTC day, inclusive on both
    /// ends at second precision.
    pub fn previous_day() -> Self {
        let date = (Utc::now() - Duration::days(1)).date_naive();
        ReportWindow {
            start: date.and_hms_opt(0, 0, 0).unwrap().and_utc(),
            end: date.and_hms_opt(23, 59, 59).unwrap().and_utc(),
        }
    }

    pub fn start_millis(&self) -> i64 {
        self.start.timestamp_millis()
    }

    pub fn end_millis(&self) -> i64 {
        self.end.timestamp_millis()
    }

    pub fn start_rfc3339(&self) -> String {
        self.start.format("%Y-%m-%dT%H:%M:%SZ").to_string()
    }

    pub fn end_rfc3339(&self) -> String {
        self.end.format("%Y-%m-%dT%H:%M:%SZ").to_string()
    }
}

pub trait UnwrapFailure<T> {
    fn failed(self, action: &str) -> T;
}

impl<T> UnwrapFailure<T> for Option<T> {
    fn failed(self, message: &str) -> T {
        match self {
            Some(result) => result,
            None => {
                eprintln!("{message}");
                std::process::exit(1);
            }
        }
    }
}

impl<T, E: std::fmt::Display> UnwrapFailure<T> for std::result::Result<T, E> {
    fn failed(self, message: &str) -> T {
        match self {
            Ok(result) => result,
            Err(err) => {
                eprintln!("{message}: {err}");
                std::process::exit(1);
            }
        }
    }
}
