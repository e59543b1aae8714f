//! [`CommandGateway`] backed by the `dsconf` administration tool.
//!
//! Each command becomes one `dsconf -j <instance> <group> <verb> ...` process.
//! In JSON mode the tool prints documents on stdout and a `{"desc": ...}`
//! object on stderr when it fails.

use crate::entry::Payload;
use crate::gateway::{ArgValue, Command, CommandGateway};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

/// Gateway that shells out to `dsconf`.
#[derive(Debug, Clone)]
pub struct DsconfGateway {
    program: PathBuf,
    instance_url: String,
}

impl DsconfGateway {
    /// Create a gateway running `program` against `instance_url`.
    pub fn new(program: impl Into<PathBuf>, instance_url: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            instance_url: instance_url.into(),
        }
    }

    /// The instance URL passed to every invocation.
    pub fn instance_url(&self) -> &str {
        &self.instance_url
    }

    /// Arguments for `cmd`, excluding the program name.
    pub fn argv(&self, cmd: &Command) -> Vec<String> {
        let [group, verb] = cmd.operation.words();
        let mut argv = vec![
            "-j".to_string(),
            self.instance_url.clone(),
            group.to_string(),
            verb.to_string(),
        ];
        if let Some(suffix) = &cmd.suffix {
            argv.push(format!("--suffix={}", suffix));
        }
        argv.extend(cmd.positional.iter().cloned());
        for (name, value) in &cmd.named {
            match value {
                ArgValue::Switch => argv.push(format!("--{}", name)),
                _ => argv.push(format!("--{}={}", name, value.render())),
            }
        }
        argv
    }
}

/// Decode stdout of a successful run.
pub(crate) fn parse_output(stdout: &str) -> Payload {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Payload::empty();
    }
    match serde_json::from_str(trimmed) {
        Ok(value) => Payload::new(value),
        Err(_) => Payload::message_payload(trimmed),
    }
}

/// Extract the message of a failed run.
pub(crate) fn parse_error(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        let desc = value.get("desc").and_then(|v| v.as_str());
        let info = value.get("info").and_then(|v| v.as_str());
        match (desc, info) {
            (Some(d), Some(i)) if !i.is_empty() => return format!("{} - {}", d, i),
            (Some(d), _) => return d.to_string(),
            _ => {}
        }
    }
    if trimmed.is_empty() {
        "command failed without output".to_string()
    } else {
        trimmed.to_string()
    }
}

#[async_trait]
impl CommandGateway for DsconfGateway {
    async fn execute(&self, cmd: Command) -> Result<Payload, String> {
        let argv = self.argv(&cmd);
        debug!(program = %self.program.display(), operation = %cmd.operation, "spawning dsconf");
        let output = tokio::process::Command::new(&self.program)
            .args(&argv)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {}", self.program.display(), e))?;

        if output.status.success() {
            Ok(parse_output(&String::from_utf8_lossy(&output.stdout)))
        } else {
            Err(parse_error(&String::from_utf8_lossy(&output.stderr)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Operation;
    use crate::secret::Secret;

    #[test]
    fn test_argv_layout() {
        let gw = DsconfGateway::new("dsconf", "ldapi://%2fvar%2frun%2fslapd-localhost.socket");
        let cmd = Command::for_suffix(Operation::AgmtSet, "dc=example,dc=com")
            .arg("to-replica2")
            .flag("port", "636")
            .flag("schedule", ArgValue::Delete)
            .flag("force", ArgValue::Switch)
            .secret_flag("bind-passwd", &Secret::new("s3cret"));
        assert_eq!(
            gw.argv(&cmd),
            vec![
                "-j",
                "ldapi://%2fvar%2frun%2fslapd-localhost.socket",
                "repl-agmt",
                "set",
                "--suffix=dc=example,dc=com",
                "to-replica2",
                "--bind-passwd=s3cret",
                "--force",
                "--port=636",
                "--schedule=",
            ]
        );
    }

    #[test]
    fn test_parse_output() {
        assert_eq!(parse_output("  \n"), Payload::empty());
        assert_eq!(
            parse_output("\"Agreement successfully initialized.\"\n").message(),
            Some("Agreement successfully initialized.")
        );
        assert_eq!(
            parse_output("Successfully updated agreement").message(),
            Some("Successfully updated agreement")
        );
        assert!(parse_output(r#"{"attrs": {"cn": ["a"]}}"#).entry().is_ok());
    }

    #[test]
    fn test_parse_error() {
        assert_eq!(
            parse_error(r#"{"desc": "No such object", "info": ""}"#),
            "No such object"
        );
        assert_eq!(
            parse_error(r#"{"desc": "Operations error", "info": "changelog missing"}"#),
            "Operations error - changelog missing"
        );
        assert_eq!(parse_error("Traceback ..."), "Traceback ...");
        assert_eq!(parse_error(""), "command failed without output");
    }

    #[tokio::test]
    async fn test_missing_program_is_gateway_error() {
        let gw = DsconfGateway::new("/nonexistent/dsconf-binary", "ldap://localhost:389");
        let err = gw
            .execute(Command::new(Operation::ListCleanAllRuv))
            .await
            .unwrap_err();
        assert!(err.contains("failed to run"));
    }
}
