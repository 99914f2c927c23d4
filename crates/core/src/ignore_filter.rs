use ignore::gitignore::{Gitignore, GitignoreBuilder};
use tracing::{debug, warn};

use crate::archive::Entries;

/// Synthetic root folder that archive downloads wrap the project in.
pub const ARCHIVE_ROOT_PREFIX: &str = "project/";

pub const GITIGNORE_NAME: &str = ".gitignore";

/// Applied when the archive carries no `.gitignore` of its own.
pub const DEFAULT_IGNORE_PATTERNS: &[&str] = &[
    // dependencies
    "node_modules/",
    "bower_components/",
    "jspm_packages/",
    ".pnp/",
    ".pnp.js",
    // build output
    "dist/",
    "build/",
    "out/",
    ".next/",
    ".nuxt/",
    ".output/",
    ".cache/",
    "coverage/",
    // OS and editor artifacts
    ".DS_Store",
    "Thumbs.db",
    ".idea/",
    ".vscode/",
    "*.swp",
    "*.swo",
    ".git/",
    // env files
    ".env",
    ".env.*",
    // logs
    "*.log",
    "logs/",
    "npm-debug.log*",
    "yarn-debug.log*",
    "yarn-error.log*",
];

/// Drops directory markers, empty files and ignored paths from `entries`,
/// using the archive's own `.gitignore` when it carries one.
pub fn filter(entries: &Entries) -> Entries {
    filter_with(entries, find_gitignore(entries))
}

/// Same as [`filter`] with the rules given explicitly; `None` selects
/// [`DEFAULT_IGNORE_PATTERNS`]. When rules are given, the `.gitignore` entry
/// they come from is consumed and not kept.
///
/// The surviving keys are normalized (root prefix stripped) and are the paths
/// written to the remote repository.
pub fn filter_with(entries: &Entries, gitignore: Option<&str>) -> Entries {
    let matcher = match gitignore {
        Some(text) => compile(text.lines()),
        None => compile(DEFAULT_IGNORE_PATTERNS.iter().copied()),
    };

    let mut kept = Entries::new();
    let mut dropped = 0u64;
    for (path, content) in entries {
        let is_rules_file = gitignore.is_some() && is_root_gitignore(path);
        if path.ends_with('/') || content.is_empty() || is_rules_file {
            dropped += 1;
            continue;
        }
        let normalized = normalize_path(path);
        if normalized.is_empty()
            || matcher
                .matched_path_or_any_parents(normalized, false)
                .is_ignore()
        {
            dropped += 1;
            continue;
        }
        kept.insert(normalized.to_string(), content.clone());
    }

    debug!(
        event = "filter.applied",
        source = if gitignore.is_some() { "gitignore" } else { "default" },
        kept = kept.len() as u64,
        dropped,
        "filter.applied"
    );
    kept
}

/// Strips the archive's synthetic root folder, if present.
pub fn normalize_path(path: &str) -> &str {
    let path = path.trim_start_matches("./").trim_start_matches('/');
    path.strip_prefix(ARCHIVE_ROOT_PREFIX).unwrap_or(path)
}

/// `.gitignore` at the archive root, either bare or inside the synthetic root
/// folder. A `.gitignore` in any other folder is ordinary content.
pub fn find_gitignore(entries: &Entries) -> Option<&str> {
    if let Some(text) = entries.get(GITIGNORE_NAME) {
        return Some(text);
    }
    entries
        .iter()
        .find(|(path, _)| is_root_gitignore(path))
        .map(|(_, text)| text.as_str())
}

fn is_root_gitignore(path: &str) -> bool {
    normalize_path(path) == GITIGNORE_NAME
}

fn compile<'a>(lines: impl Iterator<Item = &'a str>) -> Gitignore {
    let mut builder = GitignoreBuilder::new(".");
    for line in lines {
        if let Err(e) = builder.add_line(None, line) {
            warn!(
                event = "filter.pattern_invalid",
                pattern = line,
                error = %e,
                "filter.pattern_invalid"
            );
        }
    }
    builder.build().unwrap_or_else(|e| {
        warn!(event = "filter.build_failed", error = %e, "filter.build_failed");
        Gitignore::empty()
    })
}
