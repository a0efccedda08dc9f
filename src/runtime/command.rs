use crate::error::ApplyError;
use crate::types::NodeId;
use log::info;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Applies a node's identity list by running an operator-supplied shell
/// command, for proxies without an administrative API.
///
/// The template may reference `{node_id}`, `{uuids_file}` (the newline
/// separated list) and `{uuids_json}` (the JSON document).
#[derive(Debug, Clone)]
pub struct CommandApplier {
    template: String,
}

impl CommandApplier {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Expands the placeholders for one node.
    pub fn render(&self, node: NodeId, uuids_file: &Path, uuids_json: &Path) -> String {
        self.template
            .replace("{node_id}", &node.to_string())
            .replace("{uuids_file}", &uuids_file.to_string_lossy())
            .replace("{uuids_json}", &uuids_json.to_string_lossy())
    }

    /// Runs the expanded command; an empty template is a no-op.
    pub async fn apply(
        &self,
        node: NodeId,
        uuids_file: &Path,
        uuids_json: &Path,
    ) -> Result<(), ApplyError> {
        if self.template.trim().is_empty() {
            return Ok(());
        }
        let line = self.render(node, uuids_file, uuids_json);
        info!("node {} running apply command: {}", node, line);

        let mut cmd = shell(&line);
        let status = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| ApplyError::Command(format!("spawn failed: {}", e)))?;

        if status.success() {
            Ok(())
        } else {
            Err(ApplyError::Command(format!("`{}` exited with {}", line, status)))
        }
    }
}

fn shell(line: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("powershell");
        cmd.args(["-NoProfile", "-Command", line]);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.args(["-lc", line]);
        cmd
    }
}
