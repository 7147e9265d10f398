//! Inspect command: JSON views of containers and images.

use clap::Args;
use cradle::error::{Error, Result};
use cradle::lifecycle::Engine;
use cradle::resolver::{self, Resolved};

#[derive(Args, Debug)]
pub struct InspectCmd {
    /// Print only this field, given as a dotted path (e.g. `.status`).
    #[arg(short, long)]
    pub format: Option<String>,

    /// Containers or images to inspect.
    #[arg(required = true)]
    pub items: Vec<String>,
}

impl InspectCmd {
    pub async fn run(self, engine: &Engine) -> Result<()> {
        let images = engine.runtime.list_images().await?;

        let mut views = Vec::new();
        for token in &self.items {
            let view = match resolver::resolve_any(&engine.store, &images, token)? {
                Resolved::Container(record) => serde_json::to_value(&*record)?,
                Resolved::Image(image) => serde_json::to_value(&image)?,
            };
            views.push(view);
        }

        match &self.format {
            None => println!("{}", serde_json::to_string_pretty(&views)?),
            Some(path) => {
                for view in &views {
                    println!("{}", render_path(view, path)?);
                }
            }
        }
        Ok(())
    }
}

/// Walk a dotted field path (`.a.b`, `{{.a.b}}` also accepted) through a
/// JSON value.
fn render_path(value: &serde_json::Value, path: &str) -> Result<String> {
    let path = path
        .trim()
        .trim_start_matches("{{")
        .trim_end_matches("}}")
        .trim();
    let mut current = value;
    for field in path.split('.').filter(|f| !f.is_empty()) {
        current = match current.get(field) {
            Some(v) => v,
            None => {
                return Err(Error::invalid(format!(
                    "no such field {:?} in --format path {:?}",
                    field, path
                )))
            }
        };
    }
    Ok(match current {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_path_forms() {
        let v = json!({"status": "running", "ports": [{"host_port": 80}]});
        assert_eq!(render_path(&v, ".status").unwrap(), "running");
        assert_eq!(render_path(&v, "{{.status}}").unwrap(), "running");
        assert_eq!(render_path(&v, ".ports").unwrap(), r#"[{"host_port":80}]"#);
        assert!(render_path(&v, ".missing").is_err());
    }
}
