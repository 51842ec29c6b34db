use crate::model::{ScanReport, ScanStatus, TargetView, VersionSupport, Verdict};
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tokio::sync::mpsc;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum OutputFormat {
    #[default]
    Jsonl,
    Pretty,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Jsonl => write!(f, "jsonl"),
            OutputFormat::Pretty => write!(f, "pretty"),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct OutputConfig {
    pub format: OutputFormat,
    /// Write here instead of stdout.
    pub path: Option<PathBuf>,
}

/// A target whose scan ended with a scan-level error.
#[derive(Debug, Serialize)]
struct ScanFailure<'a> {
    target: &'a TargetView,
    error: &'a str,
}

#[derive(Clone)]
pub struct OutputSink {
    inner: std::sync::Arc<OutputInner>,
}

struct OutputInner {
    tx: tokio::sync::Mutex<Option<mpsc::Sender<OutputCommand>>>,
    handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

enum OutputCommand {
    Report(Box<ScanReport>),
    Failure { target: TargetView, error: String },
}

impl OutputSink {
    pub fn new(cfg: OutputConfig) -> anyhow::Result<Self> {
        let writer: Box<dyn Write + Send> = match &cfg.path {
            Some(path) => Box::new(File::create(path).map_err(|err| {
                anyhow::anyhow!("cannot create output {}: {err}", path.display())
            })?),
            None => Box::new(std::io::stdout()),
        };
        let (tx, rx) = mpsc::channel(1024);
        let format = cfg.format;
        let handle = tokio::task::spawn_blocking(move || run_writer(format, writer, rx));

        Ok(Self {
            inner: std::sync::Arc::new(OutputInner {
                tx: tokio::sync::Mutex::new(Some(tx)),
                handle: tokio::sync::Mutex::new(Some(handle)),
            }),
        })
    }

    async fn send(&self, cmd: OutputCommand) -> anyhow::Result<()> {
        let guard = self.inner.tx.lock().await;
        match guard.as_ref() {
            Some(tx) => tx
                .send(cmd)
                .await
                .map_err(|err| anyhow::anyhow!("output worker not available: {err}")),
            None => anyhow::bail!("output worker not available; dropping scan report"),
        }
    }

    pub async fn emit(&self, report: ScanReport) -> anyhow::Result<()> {
        self.send(OutputCommand::Report(Box::new(report))).await
    }

    pub async fn emit_error(&self, target: TargetView, error: String) -> anyhow::Result<()> {
        self.send(OutputCommand::Failure { target, error }).await
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.inner.tx.lock().await.take();

        if let Some(handle) = self.inner.handle.lock().await.take() {
            handle
                .await
                .map_err(|err| anyhow::anyhow!("failed to join output worker: {err}"))?;
        }

        Ok(())
    }
}

fn run_writer(
    format: OutputFormat,
    writer: Box<dyn Write + Send>,
    mut rx: mpsc::Receiver<OutputCommand>,
) {
    let mut writer = BufWriter::new(writer);

    while let Some(cmd) = rx.blocking_recv() {
        if let Err(err) = write_command(format, &mut writer, cmd) {
            tracing::error!(error = %err, "failed to write scan report");
        }
    }

    let _ = writer.flush();
}

fn write_command(
    format: OutputFormat,
    writer: &mut impl Write,
    cmd: OutputCommand,
) -> anyhow::Result<()> {
    match (format, cmd) {
        (OutputFormat::Jsonl, OutputCommand::Report(report)) => {
            writeln!(writer, "{}", serde_json::to_string(&report)?)?;
        }
        (OutputFormat::Jsonl, OutputCommand::Failure { target, error }) => {
            let failure = ScanFailure {
                target: &target,
                error: &error,
            };
            writeln!(writer, "{}", serde_json::to_string(&failure)?)?;
        }
        (OutputFormat::Pretty, OutputCommand::Report(report)) => write_pretty(writer, &report)?,
        (OutputFormat::Pretty, OutputCommand::Failure { target, error }) => {
            writeln!(writer, "{}:{} -> failed: {error}", target.host, target.port)?;
        }
    }

    writer.flush()?;
    Ok(())
}

fn write_pretty(writer: &mut impl Write, report: &ScanReport) -> anyhow::Result<()> {
    let status = match &report.status {
        ScanStatus::Complete => "complete".to_string(),
        ScanStatus::Partial { gaps } => format!("partial, {} gaps", gaps.len()),
    };
    writeln!(
        writer,
        "{}:{} ({}) -> {status}",
        report.target.host, report.target.port, report.target.server_name
    )?;

    for (version, support) in &report.protocol_support {
        let text = match support {
            VersionSupport::Accepted => "accepted",
            VersionSupport::Rejected => "rejected",
            VersionSupport::Undetermined => "undetermined",
        };
        writeln!(writer, "  {version}: {text}")?;
    }
    for suite in &report.accepted_suites {
        let weak = if report.weak_suites.contains(&suite.cipher) {
            " [weak]"
        } else {
            ""
        };
        writeln!(writer, "  suite {} {}{weak}", suite.version, suite.cipher)?;
    }
    for finding in report.extensions.values() {
        let detail = finding
            .detail
            .as_deref()
            .map(|d| format!(" ({d})"))
            .unwrap_or_default();
        writeln!(
            writer,
            "  extension {}: {}{detail}",
            finding.name,
            if finding.supported { "yes" } else { "no" }
        )?;
    }
    for finding in report.vulnerabilities.values() {
        let verdict = match finding.verdict {
            Verdict::Vulnerable => "VULNERABLE",
            Verdict::NotVulnerable => "not vulnerable",
        };
        writeln!(
            writer,
            "  {} v{}: {verdict} ({})",
            finding.policy, finding.policy_version, finding.matched
        )?;
    }
    if let Some(cert) = &report.certificate {
        if let Some(leaf) = cert.chain.leaf() {
            writeln!(writer, "  certificate: {} (expires {})", leaf.subject, leaf.not_after)?;
        }
        for (store, result) in &cert.validation {
            writeln!(
                writer,
                "  trust {store}: {}",
                if result.is_valid() { "valid" } else { "invalid" }
            )?;
        }
    }
    for conflict in &report.conflicts {
        writeln!(writer, "  conflict {}: {}", conflict.subject, conflict.description)?;
    }
    if let ScanStatus::Partial { gaps } = &report.status {
        for gap in gaps {
            writeln!(writer, "  gap {}: {:?}", gap.probe, gap.reason)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::aggregate;
    use crate::model::Target;

    #[tokio::test]
    async fn writes_jsonl_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let sink = OutputSink::new(OutputConfig {
            format: OutputFormat::Jsonl,
            path: Some(path.clone()),
        })
        .unwrap();

        let target = Target::new("example.com", 443);
        sink.emit(aggregate(&target, Vec::new())).await.unwrap();
        sink.emit_error(target.view(), "socket resources exhausted".into())
            .await
            .unwrap();
        sink.shutdown().await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["status"]["status"], "complete");
        assert_eq!(lines[1]["error"], "socket resources exhausted");
    }

    #[test]
    fn pretty_output_names_the_target() {
        let report = aggregate(&Target::new("example.com", 443), Vec::new());
        let mut buf = Vec::new();
        write_pretty(&mut buf, &report).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("example.com:443 (example.com) -> complete"));
    }
}
