//! ---
//! vigil_section: "15-testing"
//! vigil_subsection: "integration-tests"
//! vigil_type: "source"
//! vigil_scope: "code"
//! vigil_description: "Repository layout checks for the vigil workspace."
//! vigil_version: "v0.1.0"
//! vigil_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..")
}

fn files_with_extension(dir: &Path, extension: &str) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().is_some_and(|ext| ext == extension))
        .collect()
}

#[test]
fn sources_carry_frontmatter() {
    let crates = workspace_root().join("crates");
    let sources = files_with_extension(&crates, "rs");
    assert!(!sources.is_empty(), "expected sources under {}", crates.display());
    for source in sources {
        let content = fs::read_to_string(&source)
            .unwrap_or_else(|err| panic!("failed to read {}: {}", source.display(), err));
        assert!(
            content.starts_with("//! ---"),
            "{} must include frontmatter header",
            source.display()
        );
        assert!(
            content.contains("vigil_section:"),
            "{} frontmatter must name its section",
            source.display()
        );
    }
}

#[test]
fn manifests_carry_frontmatter() {
    for manifest in [
        "Cargo.toml",
        "crates/vigil-logging/Cargo.toml",
        "crates/vigil-msg/Cargo.toml",
        "crates/vigil-gateway/Cargo.toml",
        "tests/Cargo.toml",
    ] {
        let path = workspace_root().join(manifest);
        let content = fs::read_to_string(&path)
            .unwrap_or_else(|err| panic!("failed to read {}: {}", path.display(), err));
        assert!(
            content.starts_with("# ---"),
            "{manifest} must include frontmatter header"
        );
    }
}
