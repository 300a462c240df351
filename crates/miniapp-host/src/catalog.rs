//! App discovery on disk.
//!
//! An app is a subdirectory of the apps directory that contains the
//! configured logic file. Markup and stylesheet files are optional.

use std::path::{Path, PathBuf};

use miniapp_config::AppsSection;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{HostError, HostResult};

/// One entry of `GET /api/apps`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppDescriptor {
    /// Stable identifier (the directory name).
    pub id: String,
    /// Display name (the directory name).
    pub name: String,
    /// Absolute or configured path of the app directory.
    pub path: PathBuf,
}

/// Sources of one app, read at launch time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppBundle {
    /// App name.
    pub name: String,
    /// Logic source.
    pub script: String,
    /// Markup source, if the app has one.
    pub template: Option<String>,
    /// Stylesheet, if the app has one.
    pub style: Option<String>,
}

/// The apps directory and the file names inside each app.
#[derive(Debug, Clone)]
pub struct AppCatalog {
    root: PathBuf,
    script_file: String,
    template_file: String,
    style_file: String,
}

impl AppCatalog {
    /// Catalog over `[apps]` settings.
    #[must_use]
    pub fn new(section: &AppsSection) -> Self {
        Self {
            root: section.dir.clone(),
            script_file: section.script_file.clone(),
            template_file: section.template_file.clone(),
            style_file: section.style_file.clone(),
        }
    }

    /// The apps directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every app directory, sorted by name. A missing apps directory is an
    /// empty catalog.
    #[must_use]
    pub fn list(&self) -> Vec<AppDescriptor> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.root.display(), error = %e, "Cannot read apps directory");
                return Vec::new();
            },
        };

        let mut apps: Vec<AppDescriptor> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.path().join(&self.script_file).is_file())
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                Some(AppDescriptor {
                    id: name.clone(),
                    name,
                    path: entry.path(),
                })
            })
            .collect();
        apps.sort_by(|a, b| a.name.cmp(&b.name));
        apps
    }

    /// Read an app's sources.
    ///
    /// # Errors
    ///
    /// [`HostError::AppNotFound`] if the name is not a plain directory name
    /// or the app has no logic file; [`HostError::Io`] if a present file
    /// cannot be read.
    pub fn load(&self, name: &str) -> HostResult<AppBundle> {
        if !is_plain_name(name) {
            return Err(HostError::AppNotFound(name.to_string()));
        }
        let dir = self.root.join(name);

        let script = match std::fs::read_to_string(dir.join(&self.script_file)) {
            Ok(script) => script,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(HostError::AppNotFound(name.to_string()));
            },
            Err(e) => return Err(e.into()),
        };
        let template = read_optional(&dir.join(&self.template_file))?;
        let style = read_optional(&dir.join(&self.style_file))?;

        debug!(
            app = name,
            has_template = template.is_some(),
            has_style = style.is_some(),
            "Loaded app bundle"
        );
        Ok(AppBundle {
            name: name.to_string(),
            script,
            template,
            style,
        })
    }
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && !name.contains("..")
        && !name.contains(['/', '\\'])
}

fn read_optional(path: &Path) -> HostResult<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog(dir: &Path) -> AppCatalog {
        AppCatalog::new(&AppsSection {
            dir: dir.to_path_buf(),
            ..AppsSection::default()
        })
    }

    fn write_app(root: &Path, name: &str, files: &[(&str, &str)]) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        for (file, content) in files {
            std::fs::write(dir.join(file), content).unwrap();
        }
    }

    #[test]
    fn test_list_only_dirs_with_script() {
        let tmp = tempfile::tempdir().unwrap();
        write_app(tmp.path(), "todo", &[("app.rhai", "")]);
        write_app(tmp.path(), "counter", &[("app.rhai", ""), ("app.axml", "<view/>")]);
        write_app(tmp.path(), "assets", &[("logo.txt", "")]);
        std::fs::write(tmp.path().join("README"), "").unwrap();

        let names: Vec<String> = catalog(tmp.path())
            .list()
            .into_iter()
            .map(|app| app.name)
            .collect();
        assert_eq!(names, vec!["counter".to_string(), "todo".to_string()]);
    }

    #[test]
    fn test_missing_root_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(catalog(&tmp.path().join("nope")).list().is_empty());
    }

    #[test]
    fn test_load_reads_optional_files() {
        let tmp = tempfile::tempdir().unwrap();
        write_app(
            tmp.path(),
            "counter",
            &[("app.rhai", "App(#{})"), ("app.axss", ".a{}")],
        );
        let bundle = catalog(tmp.path()).load("counter").unwrap();
        assert_eq!(bundle.script, "App(#{})");
        assert_eq!(bundle.template, None);
        assert_eq!(bundle.style.as_deref(), Some(".a{}"));
    }

    #[test]
    fn test_load_rejects_unknown_and_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        write_app(tmp.path(), "counter", &[("app.rhai", "")]);
        let catalog = catalog(&tmp.path().join("apps"));
        for name in ["missing", "../counter", "a/b", "..", "", "."] {
            assert!(
                matches!(catalog.load(name), Err(HostError::AppNotFound(_))),
                "{name:?} should be AppNotFound"
            );
        }
    }
}
