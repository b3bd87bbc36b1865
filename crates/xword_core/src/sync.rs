use anyhow::{Context, Result};
use serde::Serialize;

use crate::client::{Page, XWikiProxy};
use crate::structure::{Space, WikiStructure, XWikiDocument};

/// Summary of a structure fetch, printed by the CLI as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub spaces: usize,
    pub documents: usize,
    pub request_count: usize,
}

impl SyncReport {
    pub fn for_structure(structure: &WikiStructure, request_count: usize) -> Self {
        Self {
            spaces: structure.spaces.len(),
            documents: structure.document_count(),
            request_count,
        }
    }
}

/// Builds a fresh WikiStructure from the remote listing: one `getSpaces` call,
/// then `getPages` per space. Documents carry metadata only; content arrives
/// through [`fetch_document`].
pub fn fetch_structure(proxy: &mut dyn XWikiProxy, token: &str) -> Result<WikiStructure> {
    let mut structure = WikiStructure::new();
    let spaces = proxy.get_spaces(token).context("failed to list spaces")?;
    for summary in spaces {
        let pages = proxy
            .get_pages(token, &summary.key)
            .with_context(|| format!("failed to list pages for space `{}`", summary.key))?;
        let mut space = Space {
            name: summary.key.clone(),
            ..Space::default()
        };
        for page in pages {
            space.documents.push(XWikiDocument {
                name: page_name(&page.id, &summary.key, &page.title),
                id: page.id,
                space: summary.key.clone(),
                title: page.title,
                content: None,
                version: None,
            });
        }
        structure.add_space(space);
    }
    Ok(structure)
}

/// Fills a space's display metadata from the full `getSpace` record. Documents
/// already cached for that space are kept.
pub fn refresh_space(
    proxy: &mut dyn XWikiProxy,
    token: &str,
    structure: &mut WikiStructure,
    space_key: &str,
) -> Result<()> {
    let record = proxy
        .get_space(token, space_key)
        .with_context(|| format!("failed to fetch space `{space_key}`"))?;
    match structure.space_mut(&record.key) {
        Some(space) => {
            space.description = record.description;
            space.home_page = record.home_page;
        }
        None => structure.add_space(Space {
            name: record.key,
            description: record.description,
            home_page: record.home_page,
            documents: Vec::new(),
        }),
    }
    Ok(())
}

/// Fetches a full page record and folds it into the cache.
pub fn fetch_document(
    proxy: &mut dyn XWikiProxy,
    token: &str,
    structure: &mut WikiStructure,
    page_id: &str,
) -> Result<Page> {
    let page = proxy
        .get_page(token, page_id)
        .with_context(|| format!("failed to fetch page `{page_id}`"))?;
    structure.upsert_document(document_from_page(&page));
    Ok(page)
}

/// Pushes an edit through the store call and reflects the acknowledged record
/// locally, without a full re-fetch of the structure.
pub fn publish_document(
    proxy: &mut dyn XWikiProxy,
    token: &str,
    structure: &mut WikiStructure,
    page: &Page,
    check_version: bool,
) -> Result<Page> {
    let stored = if check_version {
        proxy.store_page_checked(token, page, true)
    } else {
        proxy.store_page(token, page)
    }
    .with_context(|| format!("failed to store page `{}`", page_identity(page)))?;
    structure.upsert_document(document_from_page(&stored));
    Ok(stored)
}

fn document_from_page(page: &Page) -> XWikiDocument {
    XWikiDocument {
        name: page_name(&page.id, &page.space, &page.title),
        id: page.id.clone(),
        space: page.space.clone(),
        title: page.title.clone(),
        content: Some(page.content.clone()),
        version: page.version,
    }
}

/// Page ids take the `Space.PageName` form; the bare name falls back to the
/// title when the id doesn't carry the space prefix.
fn page_name(id: &str, space: &str, title: &str) -> String {
    let prefix = format!("{space}.");
    match id.strip_prefix(&prefix) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => title.to_string(),
    }
}

fn page_identity(page: &Page) -> String {
    if page.id.is_empty() {
        format!("{}.{}", page.space, page.title)
    } else {
        page.id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{
        Attachment, PageHistorySummary, PageSummary, SpaceRecord, SpaceSummary,
    };
    use anyhow::bail;

    #[derive(Default)]
    struct FakeProxy {
        spaces: Vec<SpaceSummary>,
        pages: Vec<PageSummary>,
        full_pages: Vec<Page>,
        stored: Vec<Page>,
        requests: usize,
    }

    impl FakeProxy {
        fn space(key: &str) -> SpaceSummary {
            SpaceSummary {
                key: key.to_string(),
                name: key.to_string(),
                url: String::new(),
            }
        }

        fn page(space: &str, name: &str) -> PageSummary {
            PageSummary {
                id: format!("{space}.{name}"),
                space: space.to_string(),
                parent_id: String::new(),
                title: name.to_string(),
                url: String::new(),
            }
        }
    }

    impl XWikiProxy for FakeProxy {
        fn login(&mut self, _username: &str, _password: &str) -> Result<String> {
            self.requests += 1;
            Ok("token".to_string())
        }

        fn get_spaces(&mut self, _token: &str) -> Result<Vec<SpaceSummary>> {
            self.requests += 1;
            Ok(self.spaces.clone())
        }

        fn get_space(&mut self, _token: &str, space_key: &str) -> Result<SpaceRecord> {
            self.requests += 1;
            Ok(SpaceRecord {
                key: space_key.to_string(),
                name: space_key.to_string(),
                description: format!("about {space_key}"),
                home_page: format!("{space_key}.WebHome"),
                url: String::new(),
            })
        }

        fn get_pages(&mut self, _token: &str, space_key: &str) -> Result<Vec<PageSummary>> {
            self.requests += 1;
            Ok(self
                .pages
                .iter()
                .filter(|page| page.space == space_key)
                .cloned()
                .collect())
        }

        fn get_page(&mut self, _token: &str, page_id: &str) -> Result<Page> {
            self.requests += 1;
            self.full_pages
                .iter()
                .find(|page| page.id == page_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no such page: {page_id}"))
        }

        fn store_page(&mut self, _token: &str, page: &Page) -> Result<Page> {
            self.requests += 1;
            let mut stored = page.clone();
            if stored.id.is_empty() {
                stored.id = format!("{}.{}", stored.space, stored.title);
            }
            stored.version = Some(stored.version.unwrap_or(0) + 1);
            self.stored.push(stored.clone());
            Ok(stored)
        }

        fn store_page_checked(
            &mut self,
            token: &str,
            page: &Page,
            check_version: bool,
        ) -> Result<Page> {
            if check_version && self.full_pages.iter().any(|existing| existing.id == page.id) {
                self.requests += 1;
                bail!("page already exists: {}", page.id);
            }
            self.store_page(token, page)
        }

        fn remove_page(&mut self, _token: &str, _page_id: &str) -> Result<bool> {
            bail!("not used in these tests")
        }

        fn get_page_history(
            &mut self,
            _token: &str,
            _page_id: &str,
        ) -> Result<Vec<PageHistorySummary>> {
            bail!("not used in these tests")
        }

        fn get_modified_pages_history(
            &mut self,
            _token: &str,
            _since: &str,
            _max_results: i32,
        ) -> Result<Vec<PageHistorySummary>> {
            bail!("not used in these tests")
        }

        fn get_attachments(&mut self, _token: &str, _page_id: &str) -> Result<Vec<Attachment>> {
            bail!("not used in these tests")
        }

        fn add_attachment(
            &mut self,
            _token: &str,
            _content_id: i32,
            _attachment: &Attachment,
            _data: &[u8],
        ) -> Result<Attachment> {
            bail!("not used in these tests")
        }

        fn get_attachment_data(
            &mut self,
            _token: &str,
            _page_id: &str,
            _file_name: &str,
            _version: &str,
        ) -> Result<Vec<u8>> {
            bail!("not used in these tests")
        }

        fn remove_attachment(
            &mut self,
            _token: &str,
            _page_id: &str,
            _file_name: &str,
        ) -> Result<bool> {
            bail!("not used in these tests")
        }

        fn request_count(&self) -> usize {
            self.requests
        }
    }

    fn seeded_proxy() -> FakeProxy {
        FakeProxy {
            spaces: vec![FakeProxy::space("Main"), FakeProxy::space("Sandbox")],
            pages: vec![
                FakeProxy::page("Main", "WebHome"),
                FakeProxy::page("Main", "Install"),
                FakeProxy::page("Sandbox", "Test"),
            ],
            ..FakeProxy::default()
        }
    }

    #[test]
    fn fetch_structure_preserves_server_listing_order() {
        let mut proxy = seeded_proxy();
        let structure = fetch_structure(&mut proxy, "token").expect("fetch");
        let names = structure
            .all_documents()
            .iter()
            .map(|document| document.name.clone())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["WebHome", "Install", "Test"]);
        // One getSpaces plus one getPages per space.
        assert_eq!(proxy.request_count(), 3);
        let report = SyncReport::for_structure(&structure, proxy.request_count());
        assert_eq!(report.spaces, 2);
        assert_eq!(report.documents, 3);
    }

    #[test]
    fn fetched_documents_are_metadata_only() {
        let mut proxy = seeded_proxy();
        let structure = fetch_structure(&mut proxy, "token").expect("fetch");
        assert!(
            structure
                .all_documents()
                .iter()
                .all(|document| document.content.is_none())
        );
    }

    #[test]
    fn fetch_document_folds_content_into_cache() {
        let mut proxy = seeded_proxy();
        proxy.full_pages.push(Page {
            id: "Main.Install".to_string(),
            space: "Main".to_string(),
            title: "Install".to_string(),
            content: "steps".to_string(),
            version: Some(3),
            ..Page::default()
        });
        let mut structure = fetch_structure(&mut proxy, "token").expect("fetch");

        let page = fetch_document(&mut proxy, "token", &mut structure, "Main.Install")
            .expect("fetch page");
        assert_eq!(page.content, "steps");
        let cached = structure.document("Main", "Install").expect("cached");
        assert_eq!(cached.content.as_deref(), Some("steps"));
        assert_eq!(cached.version, Some(3));
        assert_eq!(structure.document_count(), 3);
    }

    #[test]
    fn publish_updates_cache_without_refetch() {
        let mut proxy = seeded_proxy();
        let mut structure = fetch_structure(&mut proxy, "token").expect("fetch");
        let requests_after_fetch = proxy.request_count();

        let edit = Page {
            id: "Main.Install".to_string(),
            space: "Main".to_string(),
            title: "Install".to_string(),
            content: "new steps".to_string(),
            version: Some(3),
            ..Page::default()
        };
        let stored =
            publish_document(&mut proxy, "token", &mut structure, &edit, false).expect("publish");
        assert_eq!(stored.version, Some(4));
        let cached = structure.document("Main", "Install").expect("cached");
        assert_eq!(cached.content.as_deref(), Some("new steps"));
        assert_eq!(cached.version, Some(4));
        // Exactly one additional round trip: the store call itself.
        assert_eq!(proxy.request_count(), requests_after_fetch + 1);
    }

    #[test]
    fn publish_of_new_page_creates_document_in_cache() {
        let mut proxy = seeded_proxy();
        let mut structure = fetch_structure(&mut proxy, "token").expect("fetch");

        let draft = Page {
            space: "Sandbox".to_string(),
            title: "Draft".to_string(),
            content: "wip".to_string(),
            ..Page::default()
        };
        publish_document(&mut proxy, "token", &mut structure, &draft, false).expect("publish");
        assert_eq!(structure.document_count(), 4);
        assert!(structure.document("Sandbox", "Draft").is_some());
    }

    #[test]
    fn guarded_publish_fails_when_page_exists() {
        let mut proxy = seeded_proxy();
        proxy.full_pages.push(Page {
            id: "Main.Install".to_string(),
            space: "Main".to_string(),
            title: "Install".to_string(),
            content: "old".to_string(),
            version: Some(3),
            ..Page::default()
        });
        let mut structure = fetch_structure(&mut proxy, "token").expect("fetch");

        let edit = Page {
            id: "Main.Install".to_string(),
            space: "Main".to_string(),
            title: "Install".to_string(),
            content: "clobber".to_string(),
            ..Page::default()
        };
        let error = publish_document(&mut proxy, "token", &mut structure, &edit, true)
            .expect_err("must conflict");
        assert!(error.to_string().contains("failed to store page"));
        // The cache keeps the pre-push view.
        let cached = structure.document("Main", "Install").expect("cached");
        assert!(cached.content.is_none());
    }

    #[test]
    fn refresh_space_fills_display_metadata() {
        let mut proxy = seeded_proxy();
        let mut structure = fetch_structure(&mut proxy, "token").expect("fetch");
        refresh_space(&mut proxy, "token", &mut structure, "Main").expect("refresh");
        let main = structure.space("Main").expect("Main space");
        assert_eq!(main.description, "about Main");
        assert_eq!(main.home_page, "Main.WebHome");
        assert_eq!(main.documents.len(), 2);
    }

    #[test]
    fn page_name_strips_space_prefix() {
        assert_eq!(page_name("Main.WebHome", "Main", "Web Home"), "WebHome");
        assert_eq!(page_name("opaque-id", "Main", "Web Home"), "Web Home");
    }
}
