//! In-place image tag updates for declarative deployment descriptors.

use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::is_valid_tag;
use crate::error::{PipelineError, Result};

static IMAGE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r#"^(?P<lead>\s*(?:-\s+)?image:\s*)(?P<quote>["']?)"#,
        r#"(?P<reference>[^\s"'#]+)(?P<rest>.*)$"#,
    ))
    .expect("image line pattern is valid")
});

#[derive(Debug, Clone, Serialize)]
pub struct ManifestDescriptor {
    pub path: PathBuf,
    #[serde(skip)]
    pub content: String,
    /// 1-based numbers of every line referencing the application image.
    pub matched_lines: Vec<usize>,
    /// Subset of `matched_lines` whose tag actually changed.
    pub changed_lines: Vec<usize>,
}

impl ManifestDescriptor {
    pub fn changed(&self) -> bool {
        !self.changed_lines.is_empty()
    }
}

/// Rewrites the tag of every `image:` reference whose final path segment is
/// `app_name`. The file is only written when something changed, so running
/// twice with the same tag leaves it untouched.
pub fn update(path: &Path, app_name: &str, new_tag: &str) -> Result<ManifestDescriptor> {
    let content = fs::read_to_string(path).map_err(|err| {
        PipelineError::io(format!("failed to read manifest {}", path.display()), err)
    })?;
    let mut descriptor = rewrite(&content, app_name, new_tag).map_err(|err| match err {
        PipelineError::ManifestNotFound { app, .. } => PipelineError::ManifestNotFound {
            path: path.to_path_buf(),
            app,
        },
        other => other,
    })?;
    descriptor.path = path.to_path_buf();

    if descriptor.changed() {
        fs::write(path, &descriptor.content).map_err(|err| {
            PipelineError::io(format!("failed to write manifest {}", path.display()), err)
        })?;
        info!(
            manifest = %path.display(),
            lines = ?descriptor.changed_lines,
            tag = new_tag,
            "Manifest image tag updated"
        );
    } else {
        debug!(manifest = %path.display(), tag = new_tag, "Manifest already at requested tag");
    }
    Ok(descriptor)
}

pub fn rewrite(content: &str, app_name: &str, new_tag: &str) -> Result<ManifestDescriptor> {
    if !is_valid_tag(new_tag) {
        return Err(PipelineError::Config(format!(
            "'{new_tag}' is not a valid image tag"
        )));
    }

    let mut output = String::with_capacity(content.len() + new_tag.len());
    let mut matched_lines = Vec::new();
    let mut changed_lines = Vec::new();

    for (idx, raw) in content.split_inclusive('\n').enumerate() {
        let (body, ending) = split_line_ending(raw);
        match retag_line(body, app_name, new_tag) {
            Some(retagged) => {
                matched_lines.push(idx + 1);
                if retagged != body {
                    changed_lines.push(idx + 1);
                }
                output.push_str(&retagged);
            }
            None => output.push_str(body),
        }
        output.push_str(ending);
    }

    if matched_lines.is_empty() {
        return Err(PipelineError::ManifestNotFound {
            path: PathBuf::new(),
            app: app_name.to_string(),
        });
    }

    Ok(ManifestDescriptor {
        path: PathBuf::new(),
        content: output,
        matched_lines,
        changed_lines,
    })
}

fn split_line_ending(line: &str) -> (&str, &str) {
    if let Some(body) = line.strip_suffix("\r\n") {
        (body, "\r\n")
    } else if let Some(body) = line.strip_suffix('\n') {
        (body, "\n")
    } else {
        (line, "")
    }
}

fn retag_line(line: &str, app_name: &str, new_tag: &str) -> Option<String> {
    let captures = IMAGE_LINE.captures(line)?;
    let reference = captures.name("reference")?;
    // Digest-pinned references are left alone.
    if reference.as_str().contains('@') {
        return None;
    }
    let (name, _tag) = split_reference(reference.as_str());
    let segment = name.rsplit('/').next().unwrap_or(name);
    if segment != app_name {
        return None;
    }

    let mut retagged = String::with_capacity(line.len() + new_tag.len());
    retagged.push_str(&line[..reference.start()]);
    retagged.push_str(name);
    retagged.push(':');
    retagged.push_str(new_tag);
    retagged.push_str(&line[reference.end()..]);
    Some(retagged)
}

/// Splits `host:port/account/app:tag` into name and optional tag. Only a
/// colon after the last slash separates a tag.
fn split_reference(reference: &str) -> (&str, Option<&str>) {
    let last_slash = reference.rfind('/').map(|idx| idx + 1).unwrap_or(0);
    match reference[last_slash..].rfind(':') {
        Some(colon) => {
            let split = last_slash + colon;
            (&reference[..split], Some(&reference[split + 1..]))
        }
        None => (reference, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEPLOYMENT: &str = "apiVersion: apps/v1\nkind: Deployment\nspec:\n  template:\n    spec:\n      containers:\n        - name: netflix-clone-app\n          image: asa96/netflix-clone-app:17\n          ports:\n            - containerPort: 80\n";

    #[test]
    fn rewrites_only_the_tag() {
        let descriptor = rewrite(DEPLOYMENT, "netflix-clone-app", "42").unwrap();
        let expected = DEPLOYMENT.replace(
            "image: asa96/netflix-clone-app:17",
            "image: asa96/netflix-clone-app:42",
        );
        assert_eq!(descriptor.content, expected);
        assert_eq!(descriptor.changed_lines, vec![8]);
    }

    #[test]
    fn second_application_is_a_no_op() {
        let first = rewrite(DEPLOYMENT, "netflix-clone-app", "42").unwrap();
        let second = rewrite(&first.content, "netflix-clone-app", "42").unwrap();
        assert_eq!(first.content, second.content);
        assert!(!second.changed());
        assert_eq!(second.matched_lines, vec![8]);
    }

    #[test]
    fn missing_image_line_is_reported() {
        let err = rewrite("kind: Service\n", "netflix-clone-app", "42").unwrap_err();
        assert_eq!(err.kind(), "ManifestNotFoundError");
    }

    #[test]
    fn other_images_and_similar_names_are_untouched() {
        let content = "image: asa96/netflix-clone-app-db:3\nimage: redis:7\n- image: \"ghcr.io:443/asa96/netflix-clone-app:1\" # pinned\r\n";
        let descriptor = rewrite(content, "netflix-clone-app", "42").unwrap();
        assert_eq!(
            descriptor.content,
            "image: asa96/netflix-clone-app-db:3\nimage: redis:7\n- image: \"ghcr.io:443/asa96/netflix-clone-app:42\" # pinned\r\n"
        );
    }

    #[test]
    fn untagged_reference_gains_a_tag() {
        let descriptor =
            rewrite("image: asa96/netflix-clone-app", "netflix-clone-app", "42").unwrap();
        assert_eq!(descriptor.content, "image: asa96/netflix-clone-app:42");
    }

    #[test]
    fn digest_references_are_skipped() {
        let err = rewrite(
            "image: asa96/netflix-clone-app@sha256:abcd\n",
            "netflix-clone-app",
            "42",
        )
        .unwrap_err();
        assert_eq!(err.kind(), "ManifestNotFoundError");
    }

    #[test]
    fn invalid_tag_is_a_config_error() {
        let err = rewrite(DEPLOYMENT, "netflix-clone-app", "bad tag").unwrap_err();
        assert_eq!(err.kind(), "ConfigError");
    }

    #[test]
    fn update_writes_only_when_changed() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("deployment.yml");
        fs::write(&path, DEPLOYMENT).unwrap();

        let first = update(&path, "netflix-clone-app", "42").unwrap();
        assert!(first.changed());
        let after_first = fs::read(&path).unwrap();

        let second = update(&path, "netflix-clone-app", "42").unwrap();
        assert!(!second.changed());
        assert_eq!(fs::read(&path).unwrap(), after_first);
        assert_eq!(second.path, path);
    }
}
