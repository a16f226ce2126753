/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{future::Future, sync::Arc, time::Duration};

use mail_builder::{
    headers::{
        address::{Address, EmailAddress},
        content_type::ContentType,
        HeaderType,
    },
    mime::MimePart,
    MessageBuilder,
};
use mail_send::{smtp::message::Message, SmtpClientBuilder};
use reqwest::header::CONTENT_TYPE;

use crate::{
    config::{Config, SmtpConfig},
    pool::Task,
    report::{compose, AggregateReport, RunContext},
    resolve::{AddressScheme, ResolvedDomain},
    Error, Result, USER_AGENT,
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Composes and delivers one report per resolved domain, attempting
/// every address the domain published. Failures are scoped to one
/// (domain, address) pair.
pub struct Dispatcher {
    config: Arc<Config>,
    ctx: RunContext,
    http: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub domain: String,
    pub delivered: usize,
    pub failed: usize,
}

impl Dispatcher {
    pub fn new(config: Arc<Config>, ctx: RunContext) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(HTTP_TIMEOUT)
            .danger_accept_invalid_certs(config.http.allow_invalid_certs)
            .build()
            .map_err(|err| Error::Config(format!("failed to build http client: {err}")))?;

        Ok(Dispatcher { config, ctx, http })
    }

    async fn send_http(&self, url: &str, report: &AggregateReport) -> std::result::Result<(), String> {
        let mut url = url;
        if let Some(debug_url) = &self.config.http.debug_url {
            tracing::info!(
                context = "http",
                event = "debug-override",
                url = url,
                redirected_to = debug_url.as_str(),
            );
            url = debug_url;
        }
        let body = serde_json::to_vec(report).map_err(|err| err.to_string())?;
        let response = self
            .http
            .post(url)
            .header(CONTENT_TYPE, "application/tlsrpt+json")
            .body(body)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        if response.status().as_u16() < 300 {
            Ok(())
        } else {
            Err(format!("unexpected status {}", response.status()))
        }
    }

    async fn send_mail(
        &self,
        rcpt: &str,
        domain: &str,
        report: &AggregateReport,
    ) -> std::result::Result<(), String> {
        let Some(smtp) = &self.config.smtp else {
            return Err("no mail relay configured".to_string());
        };
        let mut rcpt = rcpt;
        if let Some(debug_rcpt) = &smtp.debug_recipient {
            tracing::info!(
                context = "smtp",
                event = "debug-override",
                rcpt = rcpt,
                redirected_to = debug_rcpt.as_str(),
            );
            rcpt = debug_rcpt;
        }
        let body = self
            .build_message(smtp, rcpt, domain, report)
            .write_to_vec()
            .map_err(|err| err.to_string())?;

        let mut builder =
            SmtpClientBuilder::new(smtp.host.clone(), smtp.port).implicit_tls(smtp.implicit_tls);
        if smtp.allow_invalid_certs {
            builder = builder.allow_invalid_certs();
        }
        if let Some(auth) = &smtp.auth {
            builder = builder.credentials((auth.username.clone(), auth.password.clone()));
        }
        builder
            .connect()
            .await
            .map_err(|err| err.to_string())?
            .send(Message::new(smtp.from.as_str(), [rcpt], body))
            .await
            .map_err(|err| err.to_string())
    }

    fn build_message(
        &self,
        smtp: &SmtpConfig,
        rcpt: &str,
        domain: &str,
        report: &AggregateReport,
    ) -> MessageBuilder<'static> {
        MessageBuilder::new()
            .from(Address::Address(EmailAddress {
                name: None,
                email: smtp.from.clone().into(),
            }))
            .to(Address::Address(EmailAddress {
                name: None,
                email: rcpt.to_string().into(),
            }))
            .subject(subject(domain, &self.ctx))
            .header("X-Mailer", HeaderType::Text(USER_AGENT.into()))
            .header(
                "TLS-Report-Domain",
                HeaderType::Text(domain.to_string().into()),
            )
            .header(
                "TLS-Report-Submitter",
                HeaderType::Text(self.ctx.submitter.clone().into()),
            )
            .body(MimePart::new(
                ContentType::new("multipart/report").attribute("report-type", "tlsrpt"),
                vec![
                    MimePart::new(
                        ContentType::new("text/plain"),
                        format!(
                            "This is an aggregate TLS report from {}",
                            self.ctx.submitter
                        ),
                    ),
                    MimePart::new(
                        ContentType::new("application/tlsrpt+json"),
                        serde_json::to_vec_pretty(report).unwrap_or_default(),
                    )
                    .attachment(attachment_name(domain, &self.ctx)),
                ],
            ))
    }
}

impl Task for Dispatcher {
    type Item = ResolvedDomain;
    type Output = DeliveryOutcome;

    fn exec(&self, item: ResolvedDomain) -> impl Future<Output = Option<DeliveryOutcome>> + Send {
        async move {
            let report = compose(&item, &self.ctx);
            let domain = item.summary.domain.as_str();
            let mut outcome = DeliveryOutcome {
                domain: domain.to_string(),
                delivered: 0,
                failed: 0,
            };

            for address in &item.addresses {
                let (transport, result) = match address.scheme {
                    AddressScheme::Https => {
                        ("https", self.send_http(&address.target, &report).await)
                    }
                    AddressScheme::Mail => {
                        ("smtp", self.send_mail(&address.target, domain, &report).await)
                    }
                };
                match result {
                    Ok(()) => {
                        outcome.delivered += 1;
                        tracing::info!(
                            context = transport,
                            event = "delivered",
                            domain = domain,
                            target = address.target.as_str(),
                        );
                    }
                    Err(reason) => {
                        outcome.failed += 1;
                        tracing::warn!(
                            context = transport,
                            event = "delivery-failed",
                            domain = domain,
                            target = address.target.as_str(),
                            reason = reason.as_str(),
                        );
                    }
                }
            }

            Some(outcome)
        }
    }
}

fn subject(domain: &str, ctx: &RunContext) -> String {
    format!(
        "Report Domain: {domain} Submitter: {submitter} Report-ID: <{id}@{domain}>",
        submitter = ctx.submitter,
        id = ctx.report_id,
    )
}

fn attachment_name(domain: &str, ctx: &RunContext) -> String {
    format!(
        "{submitter}!{domain}!{start}!{end}.json",
        submitter = ctx.submitter,
        start = ctx.window.start.timestamp(),
        end = ctx.window.end.timestamp(),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};

    use super::{attachment_name, subject, Dispatcher};
    use crate::{
        config::Config,
        pool::Task,
        report::{AggregateReport, DateRange, RunContext},
        resolve::{AddressScheme, DeliveryAddress, ResolvedDomain},
        search::PolicyDomainSummary,
        ReportWindow,
    };

    fn context() -> RunContext {
        RunContext {
            report_id: "7a55ec90-a25a-48fe-bd69-8a2b0e5627cb".to_string(),
            organization_name: "Foobar, Inc.".to_string(),
            contact_info: "noc@foobar.org".to_string(),
            submitter: "mx.foobar.org".to_string(),
            window: ReportWindow {
                start: Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 0).unwrap(),
                end: Utc.with_ymd_and_hms(2023, 5, 1, 23, 59, 59).unwrap(),
            },
        }
    }

    fn report() -> AggregateReport {
        AggregateReport {
            organization_name: "Foobar, Inc.".to_string(),
            date_range: DateRange {
                start_datetime: "2023-05-01T00:00:00Z".to_string(),
                end_datetime: "2023-05-01T23:59:59Z".to_string(),
            },
            contact_info: "noc@foobar.org".to_string(),
            report_id: "7a55ec90-a25a-48fe-bd69-8a2b0e5627cb".to_string(),
            policies: vec![],
        }
    }

    fn dispatcher() -> Dispatcher {
        let config = Config::parse(
            r#"
            index = "tlsrpt"

            [report]
            organization-name = "Foobar, Inc."
            contact-info = "noc@foobar.org"
            submitter = "mx.foobar.org"

            [smtp]
            host = "relay.foobar.org"
            from = "noreply@foobar.org"
            "#,
        )
        .unwrap();
        Dispatcher::new(Arc::new(config), context()).unwrap()
    }

    #[test]
    fn subject_encodes_domain_submitter_and_report_id() {
        assert_eq!(
            subject("example.com", &context()),
            "Report Domain: example.com Submitter: mx.foobar.org \
             Report-ID: <7a55ec90-a25a-48fe-bd69-8a2b0e5627cb@example.com>"
        );
    }

    #[test]
    fn attachment_name_uses_epoch_bounds() {
        assert_eq!(
            attachment_name("example.com", &context()),
            "mx.foobar.org!example.com!1682899200!1682985599.json"
        );
    }

    #[tokio::test]
    async fn every_address_is_attempted() {
        // Without a relay every mail delivery fails, but each address is
        // still tried and the outcome accounts for all of them.
        let config = Config::parse(
            r#"
            index = "tlsrpt"

            [report]
            organization-name = "Foobar, Inc."
            contact-info = "noc@foobar.org"
            submitter = "mx.foobar.org"
            "#,
        )
        .unwrap();
        let dispatcher = Dispatcher::new(Arc::new(config), context()).unwrap();

        let outcome = dispatcher
            .exec(ResolvedDomain {
                summary: PolicyDomainSummary {
                    domain: "example.com".to_string(),
                    count: 1,
                    policy_types: vec![],
                },
                addresses: vec![
                    DeliveryAddress {
                        scheme: AddressScheme::Mail,
                        target: "tls@example.com".to_string(),
                    },
                    DeliveryAddress {
                        scheme: AddressScheme::Mail,
                        target: "backup@example.com".to_string(),
                    },
                ],
            })
            .await
            .unwrap();

        assert_eq!(outcome.domain, "example.com");
        assert_eq!(outcome.delivered, 0);
        assert_eq!(outcome.failed, 2);
    }

    #[test]
    fn message_is_a_tlsrpt_report() {
        let dispatcher = dispatcher();
        let smtp = dispatcher.config.smtp.clone().unwrap();
        let message = dispatcher
            .build_message(&smtp, "tls@example.com", "example.com", &report())
            .write_to_vec()
            .unwrap();
        let message = String::from_utf8(message).unwrap();

        assert!(message.contains("noreply@foobar.org"));
        assert!(message.contains("tls@example.com"));
        assert!(message.contains("TLS-Report-Domain: example.com"));
        assert!(message.contains("TLS-Report-Submitter: mx.foobar.org"));
        assert!(message.contains("multipart/report"));
        assert!(message.contains("report-type=\"tlsrpt\""));
        assert!(message.contains("application/tlsrpt+json"));
        assert!(message
            .contains("mx.foobar.org!example.com!1682899200!1682985599.json"));
        assert!(message.contains("This is an aggregate TLS report from mx.foobar.org"));
    }
}
