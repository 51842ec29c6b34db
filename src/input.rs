use crate::model::{ClientAuth, StartTlsProtocol, Target};
use crate::net::proxy::HttpProxy;
use anyhow::Context;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};

const DEFAULT_TLS_PORT: u16 = 443;

/// Settings applied to every target read from the command line or a file.
#[derive(Debug, Clone, Default)]
pub struct TargetTemplate {
    pub starttls: Option<StartTlsProtocol>,
    pub server_name: Option<String>,
    pub proxy: Option<HttpProxy>,
    pub client_auth: Option<ClientAuth>,
}

impl TargetTemplate {
    pub fn default_port(&self) -> u16 {
        self.starttls
            .map(StartTlsProtocol::default_port)
            .unwrap_or(DEFAULT_TLS_PORT)
    }

    pub fn apply(&self, mut target: Target) -> Target {
        if target.starttls.is_none() {
            target.starttls = self.starttls;
        }
        if target.server_name.is_none() {
            target.server_name = self.server_name.clone();
        }
        target.proxy = self.proxy.clone();
        target.client_auth = self.client_auth.clone();
        target
    }
}

/// Parse one target line: `host`, `host:port` or `[v6]:port`, optionally
/// followed by a STARTTLS protocol name.
pub fn parse_target(line: &str, template: &TargetTemplate) -> Option<Target> {
    let mut fields = line.split_whitespace();
    let address = fields.next()?;
    let starttls = match fields.next() {
        Some(name) => Some(parse_starttls(name)?),
        None => None,
    };
    if fields.next().is_some() {
        return None;
    }

    let default_port = starttls
        .map(StartTlsProtocol::default_port)
        .unwrap_or_else(|| template.default_port());
    let (host, port) = split_host_port(address, default_port)?;
    if host.is_empty() {
        return None;
    }

    let mut target = Target::new(host, port);
    if let Ok(ip) = host.parse() {
        target = target.with_ip(ip);
    }
    if let Some(protocol) = starttls {
        target = target.with_starttls(protocol);
    }
    Some(template.apply(target))
}

fn split_host_port(address: &str, default_port: u16) -> Option<(&str, u16)> {
    if let Some(rest) = address.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        return match after.strip_prefix(':') {
            Some(port) => Some((host, port.parse().ok()?)),
            None if after.is_empty() => Some((host, default_port)),
            None => None,
        };
    }
    if address.parse::<std::net::Ipv6Addr>().is_ok() {
        return Some((address, default_port));
    }
    match address.rsplit_once(':') {
        Some((host, port)) => Some((host, port.parse().ok()?)),
        None => Some((address, default_port)),
    }
}

fn parse_starttls(name: &str) -> Option<StartTlsProtocol> {
    match name.to_ascii_lowercase().as_str() {
        "smtp" => Some(StartTlsProtocol::Smtp),
        "imap" => Some(StartTlsProtocol::Imap),
        "pop3" => Some(StartTlsProtocol::Pop3),
        "ftp" => Some(StartTlsProtocol::Ftp),
        "ldap" => Some(StartTlsProtocol::Ldap),
        "xmpp" => Some(StartTlsProtocol::Xmpp),
        "xmpp-server" | "xmpp_server" => Some(StartTlsProtocol::XmppServer),
        "postgres" => Some(StartTlsProtocol::Postgres),
        _ => None,
    }
}

/// Read targets from a file, one per line. Blank lines and `#` comments are
/// skipped; malformed lines are logged and skipped.
pub async fn read_targets(path: &Path, template: &TargetTemplate) -> anyhow::Result<Vec<Target>> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("cannot open input {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();
    let mut targets = Vec::new();
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match parse_target(trimmed, template) {
            Some(target) => targets.push(target),
            None => tracing::warn!(line = %trimmed, "skipping invalid target"),
        }
    }
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_lines() {
        let template = TargetTemplate::default();
        let target = parse_target("[::1]:8443", &template).unwrap();
        assert_eq!(target.port, 8443);
        assert_eq!(target.host, "::1");
        assert!(target.ip.is_some());

        let target = parse_target("example.com", &template).unwrap();
        assert_eq!(target.port, 443);

        let target = parse_target("mail.example.com smtp", &template).unwrap();
        assert_eq!(target.port, 25);
        assert_eq!(target.starttls, Some(StartTlsProtocol::Smtp));

        assert!(parse_target("example.com:notaport", &template).is_none());
        assert!(parse_target("example.com gopher", &template).is_none());
    }

    #[test]
    fn template_fills_defaults() {
        let template = TargetTemplate {
            starttls: Some(StartTlsProtocol::Imap),
            server_name: Some("imap.example.com".into()),
            ..TargetTemplate::default()
        };
        let target = parse_target("192.0.2.7", &template).unwrap();
        assert_eq!(target.port, 143);
        assert_eq!(target.tls_name(), "imap.example.com");
        assert_eq!(target.starttls, Some(StartTlsProtocol::Imap));
    }

    #[tokio::test]
    async fn reads_target_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# lab hosts").unwrap();
        writeln!(file, "a.example:443").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "bad:line:x").unwrap();
        writeln!(file, "b.example:8443").unwrap();

        let targets = read_targets(file.path(), &TargetTemplate::default())
            .await
            .unwrap();
        let hosts: Vec<&str> = targets.iter().map(|t| t.host.as_str()).collect();
        assert_eq!(hosts, vec!["a.example", "b.example"]);
    }
}
