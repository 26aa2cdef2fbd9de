//! Domain scoping: which files matter to which domain, and how much.
//!
//! Native files (matching the domain's config patterns) score 1.0;
//! files reached through one import hop score 0.6, with relevance
//! decaying 0.1 per further hop down to a 0.1 floor. Files imported by
//! two or more domains are shared. Scopes are cached per domain and
//! invalidated on file change.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use regex::Regex;
use serde::Serialize;

use crate::boundary::DomainConfig;

use super::context::walk_files;

const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// A file in a domain's scope, ranked by relevance.
#[derive(Debug, Clone, Serialize)]
pub struct ScopedFile {
    pub path: String,
    /// 1.0 for domain-native files, decaying with import distance.
    pub relevance: f64,
    pub is_domain_native: bool,
    pub is_shared: bool,
    pub import_depth: usize,
}

/// Extracts import targets from source files.
///
/// Understands ES-style `import ... from "./x"` and CommonJS
/// `require("./x")`, resolving relative specifiers against the
/// importing file with the usual extension and index fallbacks.
pub struct ImportAnalyzer {
    repo_path: PathBuf,
    import_re: Regex,
    require_re: Regex,
}

impl ImportAnalyzer {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
            import_re: Regex::new(r#"import\s+[^;]*?from\s+["']([^"']+)["']"#)
                .expect("static pattern must compile"),
            require_re: Regex::new(r#"require\s*\(\s*["']([^"']+)["']\s*\)"#)
                .expect("static pattern must compile"),
        }
    }

    /// Direct imports of a file, as repo-relative paths.
    ///
    /// Bare (package) specifiers are skipped; only relative imports
    /// resolve to repo files.
    pub fn direct_imports(&self, rel_path: &str) -> Vec<String> {
        let full_path = self.repo_path.join(rel_path);
        let Ok(content) = std::fs::read_to_string(&full_path) else {
            return Vec::new();
        };

        let dir = Path::new(rel_path)
            .parent()
            .unwrap_or_else(|| Path::new(""));

        let mut imports = Vec::new();
        let specifiers = self
            .import_re
            .captures_iter(&content)
            .chain(self.require_re.captures_iter(&content))
            .map(|c| c[1].to_owned());

        for specifier in specifiers {
            if !specifier.starts_with('.') {
                continue;
            }
            if let Some(resolved) = self.resolve(dir, &specifier) {
                imports.push(resolved);
            }
        }

        imports.sort();
        imports.dedup();
        imports
    }

    /// Resolve a relative specifier to an existing repo file.
    fn resolve(&self, from_dir: &Path, specifier: &str) -> Option<String> {
        let joined = normalize(&from_dir.join(specifier));

        let candidates = [
            joined.clone(),
            format!("{joined}.ts"),
            format!("{joined}.tsx"),
            format!("{joined}.js"),
            format!("{joined}.jsx"),
            format!("{joined}/index.ts"),
            format!("{joined}/index.js"),
        ];

        candidates
            .into_iter()
            .find(|candidate| self.repo_path.join(candidate).is_file())
    }
}

/// Collapse `.` and `..` segments in a relative path.
fn normalize(path: &Path) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for component in path.components() {
        match component.as_os_str().to_str() {
            Some(".") | None => {}
            Some("..") => {
                segments.pop();
            }
            Some(segment) => segments.push(segment),
        }
    }
    segments.join("/")
}

/// Computes and caches per-domain file scopes.
pub struct DomainScoper {
    repo_path: PathBuf,
    config: DomainConfig,
    analyzer: ImportAnalyzer,
    cache: HashMap<String, Vec<ScopedFile>>,
    all_files: Option<Vec<String>>,
}

impl DomainScoper {
    pub fn new(repo_path: impl Into<PathBuf>, config: DomainConfig) -> Self {
        let repo_path = repo_path.into();
        Self {
            analyzer: ImportAnalyzer::new(&repo_path),
            repo_path,
            config,
            cache: HashMap::new(),
            all_files: None,
        }
    }

    /// Ranked scope for a domain, cached until invalidated.
    pub fn compute_scope(&mut self, domain: &str) -> Vec<ScopedFile> {
        if let Some(cached) = self.cache.get(domain) {
            return cached.clone();
        }

        let patterns: Vec<Pattern> = self
            .config
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

        let all_files = self.all_files().to_vec();
        let native: HashSet<String> = all_files
            .iter()
            .filter(|f| patterns.iter().any(|p| p.matches_with(f, GLOB_OPTIONS)))
            .cloned()
            .collect();

        // Breadth-first over the import graph from the native set.
        let mut depth_of: HashMap<String, usize> = HashMap::new();
        let mut queue: VecDeque<(String, usize)> =
            native.iter().map(|f| (f.clone(), 0)).collect();

        while let Some((file, depth)) = queue.pop_front() {
            for import in self.analyzer.direct_imports(&file) {
                if native.contains(&import) {
                    continue;
                }
                let next_depth = depth + 1;
                let best = depth_of.entry(import.clone()).or_insert(usize::MAX);
                if next_depth < *best {
                    *best = next_depth;
                    queue.push_back((import, next_depth));
                }
            }
        }

        let mut scope: Vec<ScopedFile> = native
            .iter()
            .map(|path| ScopedFile {
                path: path.clone(),
                relevance: 1.0,
                is_domain_native: true,
                is_shared: false,
                import_depth: 0,
            })
            .collect();

        for (path, depth) in depth_of {
            // One hop scores 0.6; each further hop costs another 0.1.
            let relevance = (0.6 - 0.1 * (depth.saturating_sub(1)) as f64).max(0.1);
            scope.push(ScopedFile {
                path,
                relevance,
                is_domain_native: false,
                is_shared: false,
                import_depth: depth,
            });
        }

        scope.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.path.cmp(&b.path))
        });

        self.cache.insert(domain.to_owned(), scope.clone());
        scope
    }

    /// Files that appear in the scope of two or more domains.
    pub fn find_shared_files(&mut self) -> Vec<ScopedFile> {
        let domains: Vec<String> = self.config.domains.iter().map(|d| d.id.clone()).collect();

        let mut used_by: HashMap<String, HashSet<String>> = HashMap::new();
        for domain in &domains {
            for scoped in self.compute_scope(domain) {
                used_by.entry(scoped.path).or_default().insert(domain.clone());
            }
        }

        let mut shared: Vec<ScopedFile> = used_by
            .into_iter()
            .filter(|(_, domains)| domains.len() >= 2)
            .map(|(path, _)| ScopedFile {
                path,
                relevance: 0.5,
                is_domain_native: false,
                is_shared: true,
                import_depth: 0,
            })
            .collect();

        shared.sort_by(|a, b| a.path.cmp(&b.path));
        shared
    }

    /// Drop a domain's cached scope (call when its files change).
    pub fn invalidate(&mut self, domain: &str) {
        self.cache.remove(domain);
        self.all_files = None;
    }

    fn all_files(&mut self) -> &[String] {
        if self.all_files.is_none() {
            self.all_files = Some(walk_files(&self.repo_path));
        }
        self.all_files.as_deref().unwrap_or(&[])
    }
}
