//! Domain-scoped context manager.
//!
//! Loads only the files an agent actually needs: everything matching
//! its domain patterns (pinned, never evicted), the files a story
//! explicitly lists (unpinned), and on-demand retrievals. The cache
//! keeps the total under a token budget via LRU eviction, cutting
//! context well below the full-codebase baseline.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use serde::Deserialize;

use crate::boundary::DomainConfig;
use crate::budget::estimate_tokens;

use super::cache::LruContextCache;

/// Default context token budget per agent.
pub const DEFAULT_MAX_TOKENS: i64 = 100_000;

const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// The `context` block of a story definition.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoryContext {
    #[serde(default)]
    pub read_files: Vec<String>,
}

/// Per-agent context manager over an LRU cache.
pub struct ContextManager {
    domain: String,
    repo_path: PathBuf,
    domain_patterns: Vec<Pattern>,
    cache: LruContextCache,
}

impl ContextManager {
    /// Build a manager for one agent domain.
    ///
    /// Unknown domains get an empty pattern set; loading domain context
    /// then pins nothing, which is logged rather than fatal.
    pub fn new(
        domain: impl Into<String>,
        config: &DomainConfig,
        repo_path: impl Into<PathBuf>,
        max_tokens: i64,
    ) -> Self {
        let domain = domain.into();
        let domain_patterns = config
            .domains
            .iter()
            .find(|d| d.id == domain)
            .map(|d| {
                d.file_patterns
                    .iter()
                    .filter_map(|p| Pattern::new(p).ok())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            domain,
            repo_path: repo_path.into(),
            domain_patterns,
            cache: LruContextCache::new(max_tokens),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn total_tokens(&self) -> i64 {
        self.cache.total_tokens()
    }

    pub fn pinned_count(&self) -> usize {
        self.cache.pinned_count()
    }

    /// Paths currently loaded.
    pub fn loaded_files(&self) -> Vec<String> {
        self.cache.keys()
    }

    /// Load every repo file matching the agent's domain patterns.
    ///
    /// Domain files are pinned so eviction never drops them.
    pub fn load_domain_context(&mut self) {
        if self.domain_patterns.is_empty() {
            tracing::warn!(domain = %self.domain, "no patterns for domain");
            return;
        }

        let files = walk_files(&self.repo_path);
        for rel_path in files {
            if self.matches_domain(&rel_path) {
                self.load_file(&rel_path, true);
            }
        }

        tracing::info!(
            domain = %self.domain,
            pinned = self.cache.pinned_count(),
            tokens = self.cache.total_tokens(),
            "domain context loaded"
        );
    }

    /// Load the files a story lists under `context.read_files`
    /// (unpinned, so they can be evicted as the story progresses).
    pub fn load_story_context(&mut self, context: &StoryContext) {
        for file in &context.read_files {
            self.load_file(file, false);
        }
    }

    /// Fetch a file's content, from cache or disk.
    ///
    /// On-demand loads are unpinned. Returns `None` for unreadable
    /// paths.
    pub fn retrieve(&mut self, rel_path: &str) -> Option<String> {
        if let Some(content) = self.cache.get(rel_path) {
            return Some(content);
        }
        self.load_file(rel_path, false)
    }

    /// Snapshot of everything cached, as path to content.
    pub fn get_context(&mut self) -> HashMap<String, String> {
        let keys = self.cache.keys();
        let mut context = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(content) = self.cache.get(&key) {
                context.insert(key, content);
            }
        }
        context
    }

    fn matches_domain(&self, rel_path: &str) -> bool {
        self.domain_patterns
            .iter()
            .any(|p| p.matches_with(rel_path, GLOB_OPTIONS))
    }

    fn load_file(&mut self, rel_path: &str, pinned: bool) -> Option<String> {
        let full_path = self.repo_path.join(rel_path);
        if !full_path.is_file() {
            return None;
        }

        let content = std::fs::read_to_string(&full_path).ok()?;
        let tokens = estimate_tokens(&content);
        self.cache.put(rel_path, content.clone(), tokens, pinned);
        Some(content)
    }
}

/// All files under a root, as normalized relative paths. Hidden
/// directories (including .git) are skipped.
pub fn walk_files(root: &Path) -> Vec<String> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(rel) = path.strip_prefix(root) {
                files.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
    }

    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config() -> DomainConfig {
        serde_json::from_value(serde_json::json!({
            "domains": [
                {"id": "auth", "file_patterns": ["src/auth/**/*"]},
                {"id": "booking", "file_patterns": ["src/booking/**/*"]}
            ]
        }))
        .unwrap()
    }

    fn repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        let write = |rel: &str, content: &str| {
            let path = dir.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        };
        write("src/auth/login.ts", "export function login() {}\n");
        write("src/auth/oauth/google.ts", "export function google() {}\n");
        write("src/booking/flights.ts", "export function flights() {}\n");
        write("src/lib/utils.ts", "export function utils() {}\n");
        dir
    }

    #[test]
    fn domain_context_loads_and_pins_matching_files() {
        let repo = repo();
        let mut manager = ContextManager::new("auth", &config(), repo.path(), 100_000);
        manager.load_domain_context();

        let mut loaded = manager.loaded_files();
        loaded.sort();
        assert_eq!(loaded, vec!["src/auth/login.ts", "src/auth/oauth/google.ts"]);
        assert_eq!(manager.pinned_count(), 2);
    }

    #[test]
    fn story_context_loads_unpinned() {
        let repo = repo();
        let mut manager = ContextManager::new("auth", &config(), repo.path(), 100_000);
        manager.load_story_context(&StoryContext {
            read_files: vec!["src/lib/utils.ts".to_owned(), "missing.ts".to_owned()],
        });

        assert_eq!(manager.loaded_files(), vec!["src/lib/utils.ts"]);
        assert_eq!(manager.pinned_count(), 0);
    }

    #[test]
    fn retrieve_loads_on_demand_then_caches() {
        let repo = repo();
        let mut manager = ContextManager::new("auth", &config(), repo.path(), 100_000);

        let first = manager.retrieve("src/booking/flights.ts");
        assert!(first.is_some());

        // Second read comes from cache.
        let second = manager.retrieve("src/booking/flights.ts");
        assert_eq!(first, second);

        assert!(manager.retrieve("does/not/exist.ts").is_none());
    }

    #[test]
    fn get_context_returns_path_to_content() {
        let repo = repo();
        let mut manager = ContextManager::new("auth", &config(), repo.path(), 100_000);
        manager.load_domain_context();

        let context = manager.get_context();
        assert_eq!(context.len(), 2);
        assert!(context["src/auth/login.ts"].contains("login"));
    }

    #[test]
    fn domain_scoping_cuts_context_below_full_codebase() {
        let repo = repo();
        let all_files = walk_files(repo.path());
        let full_tokens: i64 = all_files
            .iter()
            .filter_map(|f| std::fs::read_to_string(repo.path().join(f)).ok())
            .map(|c| estimate_tokens(&c))
            .sum();

        let mut manager = ContextManager::new("auth", &config(), repo.path(), 100_000);
        manager.load_domain_context();

        assert!(manager.total_tokens() < full_tokens);
    }

    #[test]
    fn unknown_domain_loads_nothing() {
        let repo = repo();
        let mut manager = ContextManager::new("payments", &config(), repo.path(), 100_000);
        manager.load_domain_context();
        assert!(manager.loaded_files().is_empty());
    }
}
