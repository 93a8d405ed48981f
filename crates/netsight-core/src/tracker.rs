use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    terminal: bool,
}

/// Known tracker hosts, stored as a trie over reversed domain labels.
///
/// `ads.example.com` is stored as `com -> example -> ads`, so a lookup for
/// `eu.ads.example.com` walks the same path and matches the listed parent.
#[derive(Debug, Default)]
pub struct TrackerTrie {
    root: TrieNode,
    len: usize,
}

impl TrackerTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a host list (one host per line, `#` starts a comment).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let trie = Self::from_lines(content.lines());
        tracing::info!(path = %path.display(), hosts = trie.len(), "loaded tracker list");
        Ok(trie)
    }

    pub fn from_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
        let mut trie = Self::new();
        for line in lines {
            let host = line.split('#').next().unwrap_or("").trim();
            if !host.is_empty() {
                trie.insert(host);
            }
        }
        trie
    }

    pub fn insert(&mut self, host: &str) {
        let mut node = &mut self.root;
        for label in host.to_lowercase().trim_end_matches('.').rsplit('.') {
            node = node.children.entry(label.to_string()).or_default();
        }
        if !node.terminal {
            node.terminal = true;
            self.len += 1;
        }
    }

    /// Whether the host or one of its parent domains is listed.
    pub fn is_tracker(&self, host: &str) -> bool {
        let host = host.to_lowercase();
        let mut node = &self.root;
        for label in host.trim_end_matches('.').rsplit('.') {
            match node.children.get(label) {
                Some(child) => {
                    if child.terminal {
                        return true;
                    }
                    node = child;
                }
                None => return false,
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_domain_matches() {
        let trie = TrackerTrie::from_lines(["ads.example.com", "# comment", "", "metrics.test # inline"]);
        assert_eq!(trie.len(), 2);

        assert!(trie.is_tracker("ads.example.com"));
        assert!(trie.is_tracker("eu.ads.example.com"));
        assert!(trie.is_tracker("METRICS.test"));
        assert!(!trie.is_tracker("example.com"));
        assert!(!trie.is_tracker("badads.example.com"));
        assert!(!trie.is_tracker("com"));
    }

    #[test]
    fn test_empty_trie() {
        let trie = TrackerTrie::new();
        assert!(trie.is_empty());
        assert!(!trie.is_tracker("anything.example"));
    }
}
