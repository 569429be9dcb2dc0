//! Candidate discovery: which source files still need a generated test.
//!
//! Each category directory is listed one level deep. Discovery never writes
//! and never touches the network, so running it twice over the same tree
//! yields the same work items.

use std::path::Path;

use ignore::WalkBuilder;
use tracing::{debug, info, warn};

use crate::errors::GenerationError;
use crate::types::{Category, WorkItem};

/// Discover work items for `categories`, in the order given.
///
/// Items within a category are sorted by file name.
pub fn discover(root: &Path, categories: &[Category]) -> Result<Vec<WorkItem>, GenerationError> {
    if !root.is_dir() {
        return Err(GenerationError::io(
            root,
            std::io::Error::new(std::io::ErrorKind::NotFound, "root is not a directory"),
        ));
    }

    let mut items = Vec::new();
    for &category in categories {
        let found = discover_category(root, category)?;
        info!(category = %category, count = found.len(), "candidates discovered");
        items.extend(found);
    }
    Ok(items)
}

/// Discover the candidates of a single category directory.
pub fn discover_category(root: &Path, category: Category) -> Result<Vec<WorkItem>, GenerationError> {
    let dir = root.join(category.dir_name());
    if !dir.is_dir() {
        warn!(dir = %dir.display(), "category directory missing, skipping");
        return Ok(Vec::new());
    }

    let language = category.language();
    let walker = WalkBuilder::new(&dir)
        .standard_filters(false)
        .max_depth(Some(1))
        .build();

    let mut items = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|e| GenerationError::io(&dir, std::io::Error::other(e)))?;
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }

        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if !language.is_candidate_name(name) {
            continue;
        }
        let Some(test_name) = language.test_file_name(name) else {
            continue;
        };

        let target = dir.join(&test_name);
        if target.exists() {
            debug!(source = name, "test already exists, skipping");
            continue;
        }

        items.push(WorkItem {
            category,
            source: entry.path().to_path_buf(),
            target,
        });
    }

    items.sort_by(|a, b| a.source.cmp(&b.source));
    Ok(items)
}
