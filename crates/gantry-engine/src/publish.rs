//! Publishing destinations for aggregate reports.

use std::fmt;
use std::path::{Path, PathBuf};

use gantry_config::manifest::SinkDecl;
use gantry_config::PropertyStore;

use crate::error::EngineError;

/// A destination an artifact can be handed to.
pub trait Sink: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Publish `artifact`. Credentials are looked up in `properties`.
    ///
    /// # Errors
    /// Returns `EngineError::Publish` if the artifact cannot be delivered.
    fn publish(&self, artifact: &Path, properties: &PropertyStore) -> Result<(), EngineError>;
}

/// Copies artifacts into a directory.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    pub name: String,
    pub dir: PathBuf,
}

impl Sink for DirectorySink {
    fn name(&self) -> &str {
        &self.name
    }

    fn publish(&self, artifact: &Path, _properties: &PropertyStore) -> Result<(), EngineError> {
        let Some(file_name) = artifact.file_name() else {
            return Err(publish_error(self, artifact, "artifact has no file name"));
        };
        let dest = self.dir.join(file_name);
        gantry_util::fs::materialize(artifact, &dest)
            .map_err(|e| publish_error(self, artifact, &e.to_string()))?;
        tracing::info!(sink = %self.name, dest = %dest.display(), "published report");
        Ok(())
    }
}

/// POSTs artifacts to a report-upload service.
#[derive(Debug, Clone)]
pub struct HttpSink {
    pub name: String,
    pub url: String,
    /// Property holding the bearer token.
    pub token_property: Option<String>,
    pub content_type: String,
}

impl Sink for HttpSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn publish(&self, artifact: &Path, properties: &PropertyStore) -> Result<(), EngineError> {
        let token = match &self.token_property {
            Some(key) => match properties.get(key) {
                Some(token) => Some(token),
                None => {
                    return Err(publish_error(
                        self,
                        artifact,
                        &format!("property `{key}` holding the upload token is not set"),
                    ));
                }
            },
            None => None,
        };
        let status = gantry_util::http::upload_file(&self.url, artifact, &self.content_type, token)
            .map_err(|e| publish_error(self, artifact, &e.to_string()))?;
        tracing::info!(sink = %self.name, url = %self.url, status, "uploaded report");
        Ok(())
    }
}

/// Hands artifacts to an external tool; the artifact path is the last argument.
#[derive(Debug, Clone)]
pub struct CommandSink {
    pub name: String,
    pub argv: Vec<String>,
    pub work_dir: PathBuf,
}

impl Sink for CommandSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn publish(&self, artifact: &Path, _properties: &PropertyStore) -> Result<(), EngineError> {
        let mut argv = self.argv.clone();
        argv.push(artifact.display().to_string());
        let mut cmd = gantry_util::process::command_from_argv(&argv)
            .map_err(|e| publish_error(self, artifact, &e.to_string()))?;
        cmd.current_dir(&self.work_dir);
        let output = gantry_util::process::run_command(&mut cmd, None)
            .map_err(|e| publish_error(self, artifact, &e.to_string()))?;
        if !output.success {
            let detail = output.stderr.trim();
            return Err(publish_error(
                self,
                artifact,
                &format!(
                    "command exited with {}{}{detail}",
                    output
                        .exit_code
                        .map_or_else(|| "a signal".to_owned(), |c| format!("code {c}")),
                    if detail.is_empty() { "" } else { ": " },
                ),
            ));
        }
        tracing::info!(sink = %self.name, "handed report to command");
        Ok(())
    }
}

fn publish_error(sink: &dyn Sink, artifact: &Path, message: &str) -> EngineError {
    EngineError::Publish {
        sink: sink.name().to_owned(),
        artifact: artifact.display().to_string(),
        message: message.to_owned(),
    }
}

/// Build the sink declared as `[sinks.<name>]`; relative paths resolve against `root`.
pub fn sink_from_decl(name: &str, decl: &SinkDecl, root: &Path) -> Box<dyn Sink> {
    match decl {
        SinkDecl::Directory { path } => Box::new(DirectorySink {
            name: name.to_owned(),
            dir: root.join(path),
        }),
        SinkDecl::Http {
            url,
            token_property,
            content_type,
        } => Box::new(HttpSink {
            name: name.to_owned(),
            url: url.clone(),
            token_property: token_property.clone(),
            content_type: content_type.clone(),
        }),
        SinkDecl::Command { command } => Box::new(CommandSink {
            name: name.to_owned(),
            argv: command.clone(),
            work_dir: root.to_path_buf(),
        }),
    }
}
