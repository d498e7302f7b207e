// ABOUTME: Editor document store, the in-memory model of editable files and folders
// ABOUTME: Publishes the document map on a watch channel and per-document changes on a broadcast

use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::{broadcast, watch};
use tracing::debug;
use tutorbox_core::{normalize_path, FileContent, Files};

const CHANGE_CHANNEL_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    File,
    Folder,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScrollPosition {
    pub top: u32,
    pub left: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EditorDocument {
    pub value: FileContent,
    #[serde(rename = "type")]
    pub kind: DocumentKind,
    pub loading: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scroll: Option<ScrollPosition>,
}

impl EditorDocument {
    pub fn file(value: FileContent) -> Self {
        Self {
            value,
            kind: DocumentKind::File,
            loading: false,
            scroll: None,
        }
    }

    pub fn folder() -> Self {
        Self {
            value: FileContent::default(),
            kind: DocumentKind::Folder,
            loading: false,
            scroll: None,
        }
    }

    pub fn loading() -> Self {
        Self {
            loading: true,
            ..Self::file(FileContent::default())
        }
    }
}

pub type EditorDocuments = BTreeMap<String, EditorDocument>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentChange {
    Updated {
        path: String,
        document: EditorDocument,
    },
    Removed {
        path: String,
    },
}

/// Authoritative model of the documents shown in the editor.
#[derive(Debug)]
pub struct EditorStore {
    documents: watch::Sender<EditorDocuments>,
    selected: watch::Sender<Option<String>>,
    changes: broadcast::Sender<DocumentChange>,
}

impl Default for EditorStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EditorStore {
    pub fn new() -> Self {
        let (documents, _) = watch::channel(EditorDocuments::new());
        let (selected, _) = watch::channel(None);
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_SIZE);
        Self {
            documents,
            selected,
            changes,
        }
    }

    pub fn documents(&self) -> EditorDocuments {
        self.documents.borrow().clone()
    }

    pub fn document(&self, path: &str) -> Option<EditorDocument> {
        self.documents.borrow().get(&normalize_path(path)).cloned()
    }

    pub fn subscribe(&self) -> watch::Receiver<EditorDocuments> {
        self.documents.subscribe()
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<DocumentChange> {
        self.changes.subscribe()
    }

    /// Loaded file contents, without folders or loading placeholders
    pub fn files(&self) -> Files {
        self.documents
            .borrow()
            .iter()
            .filter(|(_, doc)| doc.kind == DocumentKind::File && !doc.loading)
            .map(|(path, doc)| (path.clone(), doc.value.clone()))
            .collect()
    }

    /// Replace every document with `files`. Scroll positions of paths that
    /// survive are kept.
    pub fn set_documents(&self, files: &Files) {
        let mut changes = Vec::new();
        self.documents.send_modify(|documents| {
            let mut next = EditorDocuments::new();
            for (path, value) in files {
                let mut document = EditorDocument::file(value.clone());
                document.scroll = documents.get(path).and_then(|d| d.scroll);
                if documents.get(path) != Some(&document) {
                    changes.push(DocumentChange::Updated {
                        path: path.clone(),
                        document: document.clone(),
                    });
                }
                next.insert(path.clone(), document);
            }
            for path in documents.keys().filter(|p| !next.contains_key(*p)) {
                changes.push(DocumentChange::Removed { path: path.clone() });
            }
            *documents = next;
        });
        debug!(documents = files.len(), changes = changes.len(), "Editor documents replaced");
        self.emit(changes);
    }

    /// Show `paths` as loading until their content arrives.
    pub fn set_loading(&self, paths: &[String]) {
        let mut changes = Vec::new();
        self.documents.send_modify(|documents| {
            for path in paths {
                let path = normalize_path(path);
                let document = documents.entry(path.clone()).or_insert_with(EditorDocument::loading);
                document.loading = true;
                changes.push(DocumentChange::Updated {
                    path,
                    document: document.clone(),
                });
            }
        });
        self.emit(changes);
    }

    /// Set the content of a file, creating it if needed. Returns whether
    /// anything changed.
    pub fn update_file(&self, path: &str, value: FileContent) -> bool {
        let path = normalize_path(path);
        let mut change = None;
        self.documents.send_if_modified(|documents| {
            let document = documents
                .entry(path.clone())
                .or_insert_with(EditorDocument::loading);
            if !document.loading
                && document.kind == DocumentKind::File
                && document.value.as_bytes() == value.as_bytes()
            {
                return false;
            }
            document.value = value;
            document.kind = DocumentKind::File;
            document.loading = false;
            change = Some(DocumentChange::Updated {
                path: path.clone(),
                document: document.clone(),
            });
            true
        });

        let changed = change.is_some();
        self.emit(change);
        changed
    }

    /// Add an empty file or folder. Returns `false` when the path exists.
    pub fn add_file_or_folder(&self, path: &str, kind: DocumentKind) -> bool {
        let path = normalize_path(path);
        let document = match kind {
            DocumentKind::File => EditorDocument::file(FileContent::default()),
            DocumentKind::Folder => EditorDocument::folder(),
        };

        let added = self.documents.send_if_modified(|documents| {
            if documents.contains_key(&path) {
                return false;
            }
            documents.insert(path.clone(), document.clone());
            true
        });

        if added {
            self.emit(Some(DocumentChange::Updated { path, document }));
        }
        added
    }

    /// Remove a document. Removing a folder removes everything under it.
    /// Returns whether anything was removed.
    pub fn delete_file(&self, path: &str) -> bool {
        let path = normalize_path(path);
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut removed = Vec::new();

        self.documents.send_if_modified(|documents| {
            documents.retain(|candidate, _| {
                let hit = *candidate == path || candidate.starts_with(&prefix);
                if hit {
                    removed.push(candidate.clone());
                }
                !hit
            });
            !removed.is_empty()
        });

        let any = !removed.is_empty();
        let selection_removed = self
            .selected_file()
            .is_some_and(|selected| removed.contains(&selected));
        if selection_removed {
            self.select_file(None);
        }
        self.emit(removed.into_iter().map(|path| DocumentChange::Removed { path }));
        any
    }

    pub fn set_scroll_position(&self, path: &str, position: ScrollPosition) {
        let path = normalize_path(path);
        self.documents.send_if_modified(|documents| match documents.get_mut(&path) {
            Some(document) if document.scroll != Some(position) => {
                document.scroll = Some(position);
                true
            }
            _ => false,
        });
    }

    pub fn select_file(&self, path: Option<&str>) {
        let path = path.map(normalize_path);
        self.selected.send_if_modified(|selected| {
            if *selected == path {
                false
            } else {
                *selected = path;
                true
            }
        });
    }

    pub fn selected_file(&self) -> Option<String> {
        self.selected.borrow().clone()
    }

    pub fn subscribe_selected(&self) -> watch::Receiver<Option<String>> {
        self.selected.subscribe()
    }

    fn emit(&self, changes: impl IntoIterator<Item = DocumentChange>) {
        for change in changes {
            let _ = self.changes.send(change);
        }
    }
}
