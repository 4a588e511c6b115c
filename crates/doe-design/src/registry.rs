use std::collections::BTreeSet;
use std::path::Path;

use walkdir::WalkDir;

use crate::error::{DesignError, Result};

/// Host types and setup roles known to the project. Built once by the caller
/// and handed to the validator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registry {
    host_types: BTreeSet<String>,
    roles: BTreeSet<String>,
}

impl Registry {
    pub fn new<H, R, S, T>(host_types: H, roles: R) -> Self
    where
        H: IntoIterator<Item = S>,
        R: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            host_types: host_types.into_iter().map(Into::into).collect(),
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    /// One host type per directory in `group_vars_dir`, one role per
    /// directory in `roles_dir`. A missing roles directory means no roles.
    pub fn scan(group_vars_dir: &Path, roles_dir: &Path) -> Result<Self> {
        if !group_vars_dir.is_dir() {
            return Err(DesignError::Io {
                path: group_vars_dir.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "group vars directory not found",
                ),
            });
        }
        let host_types = subdirectory_names(group_vars_dir)?
            .into_iter()
            .filter(|name| name != "all")
            .collect::<BTreeSet<_>>();
        let roles = if roles_dir.is_dir() {
            subdirectory_names(roles_dir)?
        } else {
            BTreeSet::new()
        };
        tracing::debug!(
            host_types = host_types.len(),
            roles = roles.len(),
            "scanned registry"
        );
        Ok(Self { host_types, roles })
    }

    pub fn has_host_type(&self, name: &str) -> bool {
        self.host_types.contains(name)
    }

    pub fn has_role(&self, name: &str) -> bool {
        self.roles.contains(name)
    }

    pub fn host_types(&self) -> impl Iterator<Item = &str> {
        self.host_types.iter().map(String::as_str)
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.roles.iter().map(String::as_str)
    }
}

fn subdirectory_names(dir: &Path) -> Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| DesignError::Io {
            path: dir.to_path_buf(),
            source: e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "walk failed")),
        })?;
        if entry.file_type().is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.insert(name.to_string());
            }
        }
    }
    Ok(names)
}
