/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default = "default_workers")]
    pub workers: usize,
    pub index: String,
    pub elasticsearch: Option<ElasticsearchConfig>,
    pub report: ReportConfig,
    pub smtp: Option<SmtpConfig>,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ElasticsearchConfig {
    pub urls: Vec<String>,
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub tls: TlsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReportConfig {
    pub organization_name: String,
    pub contact_info: String,
    pub submitter: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub from: String,
    #[serde(default)]
    pub implicit_tls: bool,
    /// Report receivers commonly run self-signed endpoints; verification
    /// is off unless explicitly enabled.
    #[serde(default = "default_true")]
    pub allow_invalid_certs: bool,
    pub auth: Option<AuthConfig>,
    /// Redirects every report to this recipient instead of the addresses
    /// published in the policy records.
    pub debug_recipient: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TlsConfig {
    #[serde(default)]
    pub allow_invalid_certs: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HttpConfig {
    /// Redirects every report to this URL instead of the URLs published
    /// in the policy records.
    pub debug_url: Option<String>,
    #[serde(default = "default_true")]
    pub allow_invalid_certs: bool,
}

impl Config {
    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            debug_url: None,
            allow_invalid_certs: true,
        }
    }
}

fn default_workers() -> usize {
    1
}

fn default_smtp_port() -> u16 {
    587
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn parse_config() {
        let config = Config::parse(
            r#"
            workers = 4
            index = "tlsrpt"

            [elasticsearch]
            urls = ["https://localhost:9200"]
            [elasticsearch.auth]
            username = "elastic"
            password = "secret"
            [elasticsearch.tls]
            allow-invalid-certs = true

            [report]
            organization-name = "Foobar, Inc."
            contact-info = "noc@foobar.org"
            submitter = "mx.foobar.org"

            [smtp]
            host = "relay.foobar.org"
            from = "noreply@foobar.org"
            debug-recipient = "trap@foobar.org"

            [http]
            debug-url = "https://localhost/tls"
            "#,
        )
        .unwrap();

        assert_eq!(config.workers, 4);
        assert_eq!(config.index, "tlsrpt");
        let es = config.elasticsearch.as_ref().unwrap();
        assert_eq!(es.urls, ["https://localhost:9200"]);
        assert_eq!(es.auth.as_ref().unwrap().username, "elastic");
        assert!(es.tls.allow_invalid_certs);
        assert_eq!(config.report.organization_name, "Foobar, Inc.");
        let smtp = config.smtp.as_ref().unwrap();
        assert_eq!(smtp.port, 587);
        assert!(smtp.allow_invalid_certs);
        assert!(!smtp.implicit_tls);
        assert_eq!(smtp.debug_recipient.as_deref(), Some("trap@foobar.org"));
        assert_eq!(config.http.debug_url.as_deref(), Some("https://localhost/tls"));
        assert!(config.http.allow_invalid_certs);
    }

    #[test]
    fn parse_minimal_config() {
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

        assert_eq!(config.workers, 1);
        assert!(config.elasticsearch.is_none());
        assert!(config.smtp.is_none());
        assert!(config.http.debug_url.is_none());
        assert!(config.http.allow_invalid_certs);
    }
}
