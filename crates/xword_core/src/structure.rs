use serde::Serialize;

/// Client-side mirror of the remote wiki's navigational shape.
///
/// Spaces appear in server listing order; the order is not guaranteed stable
/// across fetches. Within one structure no two spaces share a name. The
/// structure is built for single-threaded, UI-driven access and carries no
/// internal locking.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WikiStructure {
    pub spaces: Vec<Space>,
}

/// A named top-level grouping of wiki pages.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Space {
    pub name: String,
    pub description: String,
    pub home_page: String,
    pub documents: Vec<XWikiDocument>,
}

/// A single wiki page as known to the client.
///
/// Identity is `(space, name)`. The `space` field is a lookup key back to the
/// owning space, never an ownership pointer. `content` is `None` when only
/// metadata was fetched; `version` is the server revision marker.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct XWikiDocument {
    pub id: String,
    pub space: String,
    pub name: String,
    pub title: String,
    pub content: Option<String>,
    pub version: Option<i32>,
}

impl XWikiDocument {
    fn same_identity(&self, other: &XWikiDocument) -> bool {
        self.space == other.space && self.name == other.name
    }
}

impl WikiStructure {
    pub fn new() -> Self {
        Self::default()
    }

    /// All documents across all spaces, flattened in (space order, document
    /// order). Pure read; no deduplication, no sorting.
    pub fn all_documents(&self) -> Vec<&XWikiDocument> {
        let mut all = Vec::new();
        for space in &self.spaces {
            for document in &space.documents {
                all.push(document);
            }
        }
        all
    }

    pub fn document_count(&self) -> usize {
        self.spaces.iter().map(|space| space.documents.len()).sum()
    }

    pub fn space(&self, name: &str) -> Option<&Space> {
        self.spaces.iter().find(|space| space.name == name)
    }

    pub fn space_mut(&mut self, name: &str) -> Option<&mut Space> {
        self.spaces.iter_mut().find(|space| space.name == name)
    }

    /// Adds a space, replacing any existing space with the same name so the
    /// name-uniqueness invariant holds.
    pub fn add_space(&mut self, space: Space) {
        match self.spaces.iter_mut().find(|existing| existing.name == space.name) {
            Some(existing) => *existing = space,
            None => self.spaces.push(space),
        }
    }

    pub fn document(&self, space_name: &str, page_name: &str) -> Option<&XWikiDocument> {
        self.space(space_name)?
            .documents
            .iter()
            .find(|document| document.name == page_name)
    }

    /// Detaches a document from the space named by its recorded space key.
    ///
    /// Local-only cleanup: this never touches the remote wiki. Returns `true`
    /// when a document was actually removed; a missing space or a document not
    /// present in the matched space is a no-op returning `false`, never an
    /// error.
    pub fn remove_document(&mut self, doc: &XWikiDocument) -> bool {
        let Some(space) = self.space_mut(&doc.space) else {
            return false;
        };
        let before = space.documents.len();
        space.documents.retain(|existing| !existing.same_identity(doc));
        space.documents.len() < before
    }

    /// Merges a fetched or acknowledged document into the cache.
    ///
    /// Replaces the document with the same `(space, name)` identity in place,
    /// or appends it to its space. The owning space is created on demand when
    /// the document's space key matches no existing space. Returns `true` when
    /// an existing document was replaced.
    pub fn upsert_document(&mut self, doc: XWikiDocument) -> bool {
        let index = match self.spaces.iter().position(|space| space.name == doc.space) {
            Some(index) => index,
            None => {
                self.spaces.push(Space {
                    name: doc.space.clone(),
                    ..Space::default()
                });
                self.spaces.len() - 1
            }
        };
        let space = &mut self.spaces[index];
        match space
            .documents
            .iter_mut()
            .find(|existing| existing.same_identity(&doc))
        {
            Some(existing) => {
                *existing = doc;
                true
            }
            None => {
                space.documents.push(doc);
                false
            }
        }
    }
}
