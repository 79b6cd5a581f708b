use std::path::Path;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use tokio::process::Command;
use crate::config::SeparatorCommandConfig;
use crate::models::{Bitrate, SeparatorArgs, StemPart};

/// Per-run settings handed to the separation capability
#[derive(Debug, Clone, PartialEq)]
pub struct SeparationOptions {
    pub separator: String,
    pub bitrate: Bitrate,
    pub random_shifts: u8,
    /// `cpu` or `gpu`
    pub device: &'static str,
    pub segment_secs: Option<u32>,
}

impl SeparationOptions {
    pub fn new(separator: &str, args: &SeparatorArgs, bitrate: Bitrate, cpu_by_default: bool) -> Self {
        Self {
            separator: separator.to_string(),
            bitrate,
            random_shifts: args.random_shifts,
            device: args.device(cpu_by_default),
            segment_secs: args.segment_secs,
        }
    }
}

/// Splits a mixed audio file into stems.
///
/// `split_all` writes `{vocals,piano,other,bass,drums}.mp3` into `output_dir`.
/// `split_selected` writes a single file at `output` containing only `parts`.
/// Both either produce their files or return an error.
#[async_trait]
pub trait Separator: Send + Sync {
    async fn split_all(&self, input: &Path, output_dir: &Path, options: &SeparationOptions) -> Result<()>;

    async fn split_selected(
        &self,
        parts: &[StemPart],
        input: &Path,
        output: &Path,
        options: &SeparationOptions,
    ) -> Result<()>;
}

/// Separator backed by an external program
#[derive(Debug, Clone)]
pub struct CommandSeparator {
    config: SeparatorCommandConfig,
}

impl CommandSeparator {
    pub fn new(config: SeparatorCommandConfig) -> Self {
        Self { config }
    }

    async fn run(&self, templates: &[String], vars: &[(&str, String)]) -> Result<()> {
        let args = render_args(templates, vars);
        debug!("separator command: {} {:?}", self.config.program.display(), args);

        // Dropping the future (job time limit) must not leave the model running.
        let output = Command::new(&self.config.program)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to execute separator: {}", self.config.program.display()))?;

        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Separator exited with code {}: {}", exit_code, stderr.trim());
        }
        Ok(())
    }
}

fn common_vars(input: &Path, options: &SeparationOptions) -> Vec<(&'static str, String)> {
    vec![
        ("input", input.display().to_string()),
        ("bitrate", options.bitrate.to_string()),
        ("separator", options.separator.clone()),
        ("shifts", options.random_shifts.to_string()),
        ("device", options.device.to_string()),
        ("segment", options.segment_secs.map(|s| s.to_string()).unwrap_or_default()),
    ]
}

/// Substitute `{name}` placeholders in one left-to-right pass. Substituted
/// text is never scanned again; unknown placeholders are kept verbatim.
fn render(template: &str, vars: &[(&str, String)]) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        rendered.push_str(&rest[..start]);
        let tail = &rest[start..];
        let known = tail[1..].find('}').and_then(|end| {
            let name = &tail[1..1 + end];
            vars.iter().find(|(n, _)| *n == name).map(|(_, value)| (value, end + 2))
        });
        match known {
            Some((value, consumed)) => {
                rendered.push_str(value);
                rest = &tail[consumed..];
            }
            None => {
                rendered.push('{');
                rest = &tail[1..];
            }
        }
    }
    rendered.push_str(rest);
    rendered
}

/// Render every template. An argument whose placeholders render to nothing is
/// dropped together with the flag right before it (`--segment {segment}`).
fn render_args(templates: &[String], vars: &[(&str, String)]) -> Vec<String> {
    let mut args: Vec<String> = Vec::with_capacity(templates.len());
    let mut after_flag = false;
    for template in templates {
        let rendered = render(template, vars);
        let is_placeholder = template.contains('{');
        if rendered.is_empty() && is_placeholder {
            if after_flag {
                args.pop();
            }
            after_flag = false;
            continue;
        }
        after_flag = !is_placeholder && rendered.starts_with('-');
        args.push(rendered);
    }
    args
}

#[async_trait]
impl Separator for CommandSeparator {
    async fn split_all(&self, input: &Path, output_dir: &Path, options: &SeparationOptions) -> Result<()> {
        let mut vars = common_vars(input, options);
        vars.push(("output_dir", output_dir.display().to_string()));
        self.run(&self.config.split_all_args, &vars).await
    }

    async fn split_selected(
        &self,
        parts: &[StemPart],
        input: &Path,
        output: &Path,
        options: &SeparationOptions,
    ) -> Result<()> {
        let parts: Vec<&str> = parts.iter().map(|p| p.as_str()).collect();
        let mut vars = common_vars(input, options);
        vars.push(("output", output.display().to_string()));
        vars.push(("parts", parts.join(",")));
        self.run(&self.config.split_selected_args, &vars).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn options() -> SeparationOptions {
        SeparationOptions::new("demo", &SeparatorArgs { random_shifts: 2, cpu_only: None, segment_secs: None }, Bitrate::Kbps256, true)
    }

    #[test]
    fn test_render_substitutes_known_placeholders() {
        let vars = vec![("input", "/a b/in.mp3".to_string()), ("segment", String::new())];
        assert_eq!(render("--in={input}", &vars), "--in=/a b/in.mp3");
        assert_eq!(render("{segment}", &vars), "");
        assert_eq!(render("{unknown}", &vars), "{unknown}");
    }

    #[test]
    fn test_render_does_not_rescan_substituted_values() {
        let vars = vec![
            ("separator", "{output}".to_string()),
            ("output", "/jobs/x/mix.mp3".to_string()),
        ];
        assert_eq!(render("--model={separator} {output}", &vars), "--model={output} /jobs/x/mix.mp3");
        assert_eq!(render("{{output}}", &vars), "{/jobs/x/mix.mp3}");
    }

    #[test]
    fn test_unset_value_drops_its_flag() {
        let templates: Vec<String> = ["mix", "--segment", "{segment}", "--shifts", "{shifts}", "-v"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let vars = vec![("segment", String::new()), ("shifts", "2".to_string())];
        assert_eq!(render_args(&templates, &vars), vec!["mix", "--shifts", "2", "-v"]);

        let vars = vec![("segment", "30".to_string()), ("shifts", "2".to_string())];
        assert_eq!(render_args(&templates, &vars), vec!["mix", "--segment", "30", "--shifts", "2", "-v"]);
    }

    #[test]
    fn test_options_resolve_device() {
        let opts = options();
        assert_eq!(opts.device, "cpu");
        let gpu = SeparationOptions::new("demo", &SeparatorArgs { cpu_only: Some(false), ..Default::default() }, Bitrate::Kbps192, true);
        assert_eq!(gpu.device, "gpu");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_separator_passes_rendered_args() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("mix.mp3");
        let separator = CommandSeparator::new(SeparatorCommandConfig {
            program: PathBuf::from("sh"),
            split_all_args: vec![],
            split_selected_args: vec![
                "-c".to_string(),
                "printf '%s' \"$1\" > \"$0\"".to_string(),
                "{output}".to_string(),
                "{parts}:{bitrate}:{separator}:{shifts}:{device}".to_string(),
            ],
        });

        separator
            .split_selected(&[StemPart::Vocals, StemPart::Drums], Path::new("in.mp3"), &output, &options())
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "vocals,drums:256:demo:2:cpu");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_separator_reports_exit_code() {
        let separator = CommandSeparator::new(SeparatorCommandConfig {
            program: PathBuf::from("sh"),
            split_all_args: vec!["-c".to_string(), "echo 'model exploded' >&2; exit 3".to_string()],
            split_selected_args: vec![],
        });
        let err = separator
            .split_all(Path::new("in.mp3"), Path::new("/tmp"), &options())
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("code 3"), "{}", err);
        assert!(err.contains("model exploded"), "{}", err);
    }
}
