use async_trait::async_trait;
use pipecore::{Outputs, ProcessAdapter, ProcessError, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Lines of stderr kept in a non-zero exit error.
const STDERR_TAIL_LINES: usize = 20;

/// How to run one external tool.
///
/// `args` and the file names in `outputs` are templates. `{name}` is replaced by
/// the textual form of parameter `name`; `{name:stem}` and `{name:file}` take the
/// file stem or file name of a path parameter. An argument that is exactly one
/// placeholder bound to a sequence expands to one argument per element. `{{` and
/// `}}` are literal braces.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Output port -> file name, relative to the invocation's working directory.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ToolSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, template: impl Into<String>) -> Self {
        self.args.push(template.into());
        self
    }

    pub fn args<S: Into<String>>(mut self, templates: impl IntoIterator<Item = S>) -> Self {
        self.args.extend(templates.into_iter().map(Into::into));
        self
    }

    pub fn output(mut self, port: impl Into<String>, file: impl Into<String>) -> Self {
        self.outputs.insert(port.into(), file.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// The argument list for `params`.
    pub fn render_args(&self, params: &Outputs) -> Result<Vec<String>, ProcessError> {
        let mut rendered = Vec::with_capacity(self.args.len());
        for template in &self.args {
            match whole_placeholder(template).and_then(|p| lookup(params, p).ok()) {
                Some(Value::Array(items)) => {
                    rendered.extend(items.iter().map(Value::to_arg));
                }
                _ => rendered.push(render(template, params)?),
            }
        }
        Ok(rendered)
    }

    /// Output port -> file name for `params`.
    pub fn render_outputs(&self, params: &Outputs) -> Result<BTreeMap<String, PathBuf>, ProcessError> {
        self.outputs
            .iter()
            .map(|(port, template)| Ok((port.clone(), PathBuf::from(render(template, params)?))))
            .collect()
    }
}

/// Runs external programs described by [`ToolSpec`]s.
///
/// Each invocation runs with the working directory as cwd and leaves
/// `command.txt`, `stdout.log` and `stderr.log` behind in it.
#[derive(Debug, Clone, Default)]
pub struct CommandAdapter {
    tools: HashMap<String, ToolSpec>,
}

impl CommandAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, name: impl Into<String>, spec: ToolSpec) -> Self {
        self.register(name, spec);
        self
    }

    pub fn register(&mut self, name: impl Into<String>, spec: ToolSpec) {
        let name = name.into();
        tracing::debug!("Registering tool: {} ({})", name, spec.program);
        self.tools.insert(name, spec);
    }

    pub fn tool(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }
}

#[async_trait]
impl ProcessAdapter for CommandAdapter {
    async fn invoke(
        &self,
        tool: &str,
        params: &Outputs,
        working_dir: &Path,
    ) -> Result<BTreeMap<String, PathBuf>, ProcessError> {
        let spec = self
            .tools
            .get(tool)
            .ok_or_else(|| ProcessError::UnknownTool(tool.to_string()))?;

        let args = spec.render_args(params)?;
        let outputs = spec.render_outputs(params)?;

        let command_line = std::iter::once(spec.program.as_str())
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        write_file(&working_dir.join("command.txt"), command_line.as_bytes()).await?;
        tracing::info!("Running {}: {}", tool, command_line);

        let mut cmd = Command::new(&spec.program);
        cmd.args(&args)
            .envs(&spec.env)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = cmd
            .spawn()
            .map_err(|e| ProcessError::Spawn {
                program: spec.program.clone(),
                reason: e.to_string(),
            })?
            .wait_with_output()
            .await
            .map_err(|e| ProcessError::Io(format!("Failed to wait for {}: {}", spec.program, e)))?;

        write_file(&working_dir.join("stdout.log"), &output.stdout).await?;
        write_file(&working_dir.join("stderr.log"), &output.stderr).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!("{} exited with status {}", tool, output.status);
            return Err(ProcessError::NonZeroExit {
                code: output.status.code(),
                stderr: tail(&stderr, STDERR_TAIL_LINES),
            });
        }

        Ok(outputs)
    }

    fn tools(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

async fn write_file(path: &Path, contents: &[u8]) -> Result<(), ProcessError> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| ProcessError::Io(format!("Failed to write {}: {}", path.display(), e)))
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim_end().lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

/// The placeholder body if `template` is exactly one `{...}`.
fn whole_placeholder(template: &str) -> Option<&str> {
    let inner = template.strip_prefix('{')?.strip_suffix('}')?;
    if inner.is_empty() || inner.contains(['{', '}']) {
        None
    } else {
        Some(inner)
    }
}

fn lookup<'a>(params: &'a Outputs, placeholder: &str) -> Result<&'a Value, ProcessError> {
    let name = placeholder.split(':').next().unwrap_or(placeholder);
    params
        .get(name)
        .ok_or_else(|| ProcessError::Template(format!("no parameter named '{}'", name)))
}

fn render(template: &str, params: &Outputs) -> Result<String, ProcessError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut placeholder = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => placeholder.push(c),
                        None => {
                            return Err(ProcessError::Template(format!(
                                "unterminated placeholder in '{}'",
                                template
                            )))
                        }
                    }
                }
                out.push_str(&substitute(params, &placeholder)?);
            }
            '}' => {
                return Err(ProcessError::Template(format!(
                    "unmatched '}}' in '{}'",
                    template
                )))
            }
            c => out.push(c),
        }
    }
    Ok(out)
}

fn substitute(params: &Outputs, placeholder: &str) -> Result<String, ProcessError> {
    let value = lookup(params, placeholder)?;
    let filter = placeholder.split_once(':').map(|(_, f)| f);

    let Some(filter) = filter else {
        return Ok(value.to_arg());
    };
    let path = value.as_path().ok_or_else(|| {
        ProcessError::Template(format!("'{}' needs a path, got {}", placeholder, value.kind()))
    })?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match filter {
        "file" => Ok(file_name),
        "stem" => Ok(stem(&file_name).to_string()),
        other => Err(ProcessError::Template(format!("unknown filter '{}'", other))),
    }
}

/// File name without its extension; `.gz` counts together with the one before it.
fn stem(file_name: &str) -> &str {
    let base = file_name.strip_suffix(".gz").unwrap_or(file_name);
    match base.rfind('.') {
        Some(0) | None => base,
        Some(i) => &base[..i],
    }
}
