//! Filesystem-backed cgroup accessor

use super::{CgroupAccessor, CgroupKey, Hierarchy};
use crate::error::{Result, TurboError};
use std::fs;

/// Reads and writes attributes under a mounted cgroup v1 hierarchy
///
/// File I/O is synchronous; the service runs each tick on a blocking thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsCgroupAccessor;

impl FsCgroupAccessor {
    pub fn new() -> Self {
        Self
    }
}

impl CgroupAccessor for FsCgroupAccessor {
    fn get(&self, hierarchy: &Hierarchy, key: CgroupKey) -> Result<String> {
        let file = hierarchy.attr_path(key);
        fs::read_to_string(&file)
            .map(|content| content.trim().to_string())
            .map_err(|source| TurboError::Read {
                path: hierarchy.path.clone(),
                file: key.file.to_string(),
                source,
            })
    }

    fn set(&self, hierarchy: &Hierarchy, key: CgroupKey, value: &str) -> Result<()> {
        let file = hierarchy.attr_path(key);
        fs::write(&file, value).map_err(|source| TurboError::Write {
            path: hierarchy.path.clone(),
            file: key.file.to_string(),
            value: value.to_string(),
            source,
        })
    }

    fn exists(&self, hierarchy: &Hierarchy, subsystem: &str) -> bool {
        hierarchy.controller_dir(subsystem).is_dir()
    }
}
