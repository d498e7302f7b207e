// ABOUTME: Flat file snapshots, snapshot diffing, and directory-tree conversion
// ABOUTME: Also defines FilesRef, the deferred handle to a remote file bundle

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

/// Contents of a single file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileContent {
    Text(String),
    Binary(Vec<u8>),
}

impl FileContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FileContent::Text(text) => Some(text),
            FileContent::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            FileContent::Text(text) => text.as_bytes(),
            FileContent::Binary(bytes) => bytes,
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, FileContent::Binary(_))
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Interpret raw bytes, keeping them as text when they are valid UTF-8.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => FileContent::Text(text),
            Err(err) => FileContent::Binary(err.into_bytes()),
        }
    }
}

impl Default for FileContent {
    fn default() -> Self {
        FileContent::Text(String::new())
    }
}

impl From<&str> for FileContent {
    fn from(value: &str) -> Self {
        FileContent::Text(value.to_string())
    }
}

impl From<String> for FileContent {
    fn from(value: String) -> Self {
        FileContent::Text(value)
    }
}

impl From<Vec<u8>> for FileContent {
    fn from(value: Vec<u8>) -> Self {
        FileContent::Binary(value)
    }
}

/// Flat filesystem snapshot keyed by absolute-style path (`/src/index.js`).
pub type Files = BTreeMap<String, FileContent>;

/// Normalize a path to the `/a/b` form used as key in [`Files`].
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path
        .split(['/', '\\'])
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect();
    format!("/{}", segments.join("/"))
}

/// Build a [`Files`] map from `(path, content)` pairs, normalizing every path.
pub fn files_from<I, P, C>(entries: I) -> Files
where
    I: IntoIterator<Item = (P, C)>,
    P: AsRef<str>,
    C: Into<FileContent>,
{
    entries
        .into_iter()
        .map(|(path, content)| (normalize_path(path.as_ref()), content.into()))
        .collect()
}

/// Result of comparing two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilesDiff {
    /// Paths of the new snapshot whose content is new or different
    pub added_or_modified: Files,
    /// Paths of the old snapshot that are gone
    pub removed: Vec<String>,
}

impl FilesDiff {
    pub fn is_empty(&self) -> bool {
        self.added_or_modified.is_empty() && self.removed.is_empty()
    }
}

/// Compare two snapshots by content bytes; a text and a binary entry with
/// the same bytes are the same file.
pub fn diff_files(before: &Files, after: &Files) -> FilesDiff {
    let added_or_modified = after
        .iter()
        .filter(|(path, content)| {
            before
                .get(*path)
                .map_or(true, |previous| previous.as_bytes() != content.as_bytes())
        })
        .map(|(path, content)| (path.clone(), content.clone()))
        .collect();

    let removed = before
        .keys()
        .filter(|path| !after.contains_key(*path))
        .cloned()
        .collect();

    FilesDiff {
        added_or_modified,
        removed,
    }
}

/// Merge `overlay` on top of `base`; entries of `overlay` win on collisions.
pub fn merge_files(base: &Files, overlay: &Files) -> Files {
    let mut merged = base.clone();
    merged.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// A node of the nested representation mounted into the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileSystemNode {
    File { contents: FileContent },
    Directory { entries: FileSystemTree },
}

/// Directory entries keyed by their name (no slashes).
pub type FileSystemTree = BTreeMap<String, FileSystemNode>;

/// Convert a flat snapshot into a nested directory tree.
///
/// A path that is both a file and a directory prefix keeps the directory;
/// the conflicting file is dropped with a warning.
pub fn to_file_tree(files: &Files) -> FileSystemTree {
    let entries = files
        .iter()
        .map(|(path, content)| {
            let segments = path
                .split(['/', '\\'])
                .filter(|s| !s.is_empty() && *s != ".")
                .map(str::to_string)
                .collect::<Vec<_>>();
            (segments, content)
        })
        .collect();
    build_tree(entries)
}

fn build_tree(entries: Vec<(Vec<String>, &FileContent)>) -> FileSystemTree {
    let mut leaves: BTreeMap<String, &FileContent> = BTreeMap::new();
    let mut directories: BTreeMap<String, Vec<(Vec<String>, &FileContent)>> = BTreeMap::new();

    for (segments, content) in entries {
        let Some((name, rest)) = segments.split_first() else {
            continue;
        };
        if rest.is_empty() {
            leaves.insert(name.clone(), content);
        } else {
            directories
                .entry(name.clone())
                .or_default()
                .push((rest.to_vec(), content));
        }
    }

    let mut tree = FileSystemTree::new();
    for (name, children) in directories {
        tree.insert(
            name,
            FileSystemNode::Directory {
                entries: build_tree(children),
            },
        );
    }
    for (name, content) in leaves {
        if tree.contains_key(&name) {
            warn!(name = %name, "Skipping file that collides with a directory");
            continue;
        }
        tree.insert(
            name,
            FileSystemNode::File {
                contents: content.clone(),
            },
        );
    }

    tree
}

/// Flatten a directory tree back into a [`Files`] snapshot.
pub fn flatten_tree(tree: &FileSystemTree) -> Files {
    fn walk(prefix: &str, tree: &FileSystemTree, out: &mut Files) {
        for (name, node) in tree {
            let path = format!("{}/{}", prefix, name);
            match node {
                FileSystemNode::File { contents } => {
                    out.insert(path, contents.clone());
                }
                FileSystemNode::Directory { entries } => walk(&path, entries, out),
            }
        }
    }

    let mut files = Files::new();
    walk("", tree, &mut files);
    files
}

/// Kind of bundle a [`FilesRef`] points to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleKind {
    Template,
    Files,
    Solution,
}

impl BundleKind {
    /// Infer the kind from a bundle id (`template-*`, `*-files`, `*-solution`).
    pub fn from_ref_id(id: &str) -> Self {
        if id.starts_with(TEMPLATE_PREFIX) {
            BundleKind::Template
        } else if id.ends_with("-solution") {
            BundleKind::Solution
        } else {
            BundleKind::Files
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BundleKind::Template => "template",
            BundleKind::Files => "files",
            BundleKind::Solution => "solution",
        }
    }
}

impl fmt::Display for BundleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const TEMPLATE_PREFIX: &str = "template-";

/// Deferred handle to a remote bundle: its id plus the paths it resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilesRef {
    id: String,
    paths: Vec<String>,
}

impl FilesRef {
    pub fn new(id: impl Into<String>, paths: Vec<String>) -> Self {
        Self {
            id: id.into(),
            paths: paths.iter().map(|p| normalize_path(p)).collect(),
        }
    }

    /// Derive the bundle id from the folder holding the bundle's files.
    ///
    /// `1-basics/1-intro/_files` becomes `1-basics-1-intro-files` and
    /// `templates/vite` becomes `template-vite`.
    pub fn from_folder(folder: &str, paths: Vec<String>) -> Self {
        let segments: Vec<String> = folder
            .split(['/', '\\'])
            .filter(|s| !s.is_empty() && *s != ".")
            .enumerate()
            .map(|(index, segment)| {
                let segment = segment.trim_start_matches('_');
                if index == 0 && segment == "templates" {
                    "template".to_string()
                } else {
                    segment.to_string()
                }
            })
            .collect();
        Self::new(segments.join("-"), paths)
    }

    /// Reference to the template bundle with the given name.
    pub fn template(name: &str) -> Self {
        Self::new(format!("{}{}", TEMPLATE_PREFIX, name), Vec::new())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn kind(&self) -> BundleKind {
        BundleKind::from_ref_id(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("a.js"), "/a.js");
        assert_eq!(normalize_path("/src//index.js"), "/src/index.js");
        assert_eq!(normalize_path("./src/lib/"), "/src/lib");
        assert_eq!(normalize_path("src\\main.rs"), "/src/main.rs");
        assert_eq!(normalize_path("/"), "/");
    }

    #[test]
    fn test_diff_detects_added_modified_and_removed() {
        let before = files_from([("/a.js", "a"), ("/b.js", "b"), ("/c.js", "c")]);
        let after = files_from([("/a.js", "a"), ("/b.js", "B"), ("/d.js", "d")]);

        let diff = diff_files(&before, &after);

        assert_eq!(
            diff.added_or_modified,
            files_from([("/b.js", "B"), ("/d.js", "d")])
        );
        assert_eq!(diff.removed, vec!["/c.js".to_string()]);
    }

    #[test]
    fn test_diff_is_empty_for_identical_snapshots() {
        let files = files_from([("/a.js", "a"), ("/img.png", "")]);
        let diff = diff_files(&files, &files);
        assert!(diff.is_empty());
        assert_eq!(diff, FilesDiff::default());
    }

    #[test]
    fn test_diff_compares_bytes_not_encoding() {
        let before = files_from([("/x", FileContent::Text("ab".into()))]);
        let same = files_from([("/x", FileContent::Binary(b"ab".to_vec()))]);
        assert!(diff_files(&before, &same).is_empty());

        let changed = files_from([("/x", FileContent::Binary(vec![0xff]))]);
        assert_eq!(diff_files(&before, &changed).added_or_modified, changed);
    }

    #[test]
    fn test_merge_prefers_overlay() {
        let template = files_from([("/package.json", "{}"), ("/a.js", "template")]);
        let lesson = files_from([("/a.js", "lesson")]);
        let merged = merge_files(&template, &lesson);
        assert_eq!(merged.get("/a.js"), Some(&FileContent::from("lesson")));
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_to_file_tree_nests_directories() {
        let files = files_from([
            ("/package.json", "{}"),
            ("/src/index.js", "index"),
            ("/src/lib/util.js", "util"),
        ]);

        let tree = to_file_tree(&files);

        assert!(matches!(
            tree.get("package.json"),
            Some(FileSystemNode::File { .. })
        ));
        let Some(FileSystemNode::Directory { entries: src }) = tree.get("src") else {
            panic!("src should be a directory");
        };
        assert!(src.contains_key("index.js"));
        assert!(matches!(
            src.get("lib"),
            Some(FileSystemNode::Directory { .. })
        ));
        assert_eq!(flatten_tree(&tree), files);
    }

    #[test]
    fn test_to_file_tree_directory_wins_conflict() {
        let files = files_from([("/a", "file"), ("/a/b.js", "nested")]);
        let tree = to_file_tree(&files);
        assert_eq!(flatten_tree(&tree), files_from([("/a/b.js", "nested")]));
    }

    #[test]
    fn test_files_ref_from_folder() {
        let files = FilesRef::from_folder("1-basics/1-intro/_files", vec!["a.js".into()]);
        assert_eq!(files.id(), "1-basics-1-intro-files");
        assert_eq!(files.paths(), &["/a.js".to_string()]);
        assert_eq!(files.kind(), BundleKind::Files);

        let solution = FilesRef::from_folder("/1-basics/1-intro/_solution/", vec![]);
        assert_eq!(solution.id(), "1-basics-1-intro-solution");
        assert_eq!(solution.kind(), BundleKind::Solution);
        assert!(solution.is_empty());

        let template = FilesRef::from_folder("templates/vite", vec![]);
        assert_eq!(template.id(), "template-vite");
        assert_eq!(template.kind(), BundleKind::Template);
        assert_eq!(FilesRef::template("vite").id(), template.id());
    }

    #[test]
    fn test_file_content_from_bytes() {
        assert_eq!(
            FileContent::from_bytes(b"hello".to_vec()),
            FileContent::Text("hello".into())
        );
        let binary = FileContent::from_bytes(vec![0xff, 0x00]);
        assert!(binary.is_binary());
        assert_eq!(binary.as_bytes(), &[0xff, 0x00]);
    }
}
