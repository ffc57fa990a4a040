//! Fixture files on disk

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use super::format::{decode_collection, encode_collection};
use super::FIXTURE_EXTENSION;
use crate::snapshot::FixtureCollection;
use crate::{Result, TapedeckError};

/// Reads and writes fixture collections under a root directory
///
/// Every `(host, pathname)` pair maps to
/// `<root>/<percent-encoded host>/<percent-encoded pathname>.yaml`. The query
/// string and method never influence the location.
///
/// There is no locking around a load/save pair: two requests for the same
/// fixture handled at the same time both read the old collection and the
/// last one to save wins.
#[derive(Debug, Clone)]
pub struct FixtureStore {
    root: PathBuf,
}

impl FixtureStore {
    /// Create a store rooted at `root`
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Location of the fixture for `host` and `pathname`
    #[must_use]
    pub fn fixture_path(&self, host: &str, pathname: &str) -> PathBuf {
        let file_name = format!("{}.{FIXTURE_EXTENSION}", encode_component(pathname));
        self.root.join(encode_component(host)).join(file_name)
    }

    /// Load the collection for `host` and `pathname`
    ///
    /// Returns `Ok(None)` if no fixture file exists yet.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or is malformed
    pub async fn load(&self, host: &str, pathname: &str) -> Result<Option<FixtureCollection>> {
        let path = self.fixture_path(host, pathname);

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No fixture at {}", path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let content = String::from_utf8(bytes)
            .map_err(|e| TapedeckError::parse(&path, format!("not valid UTF-8: {e}")))?;
        let collection = decode_collection(&path, &content)?;

        debug!(
            "Loaded {} snapshot(s) from {}",
            collection.len(),
            path.display()
        );

        Ok(Some(collection))
    }

    /// Replace the fixture for `host` and `pathname` with `collection`
    ///
    /// The text is written to a temporary file next to the fixture and renamed
    /// over it, so readers never observe a half-written fixture.
    ///
    /// # Errors
    ///
    /// Returns error if the collection cannot be encoded or written
    pub async fn save(
        &self,
        host: &str,
        pathname: &str,
        collection: &FixtureCollection,
    ) -> Result<PathBuf> {
        let path = self.fixture_path(host, pathname);
        let content = encode_collection(collection)?;

        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&target, content.as_bytes()))
            .await
            .map_err(|e| TapedeckError::Other(format!("Fixture writer task failed: {e}")))??;

        debug!(
            "Saved {} snapshot(s) to {}",
            collection.len(),
            path.display()
        );

        Ok(path)
    }
}

fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| TapedeckError::Other(format!("No parent for {}", path.display())))?;
    std::fs::create_dir_all(dir)?;

    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(content)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| TapedeckError::Io(e.error))?;

    Ok(())
}

/// Percent-encode a path component, leaving `!'()*` as they are
fn encode_component(component: &str) -> String {
    const KEPT: [(&str, &str); 5] = [
        ("%21", "!"),
        ("%27", "'"),
        ("%28", "("),
        ("%29", ")"),
        ("%2A", "*"),
    ];

    let encoded = urlencoding::encode(component).into_owned();
    KEPT.iter().fold(encoded, |encoded, (escape, raw)| encoded.replace(escape, raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint_request;
    use crate::snapshot::{Headers, RecordedResponse};
    use tempfile::TempDir;

    fn collection(body: &[u8]) -> FixtureCollection {
        let (collection, _) = FixtureCollection::new().upsert(
            fingerprint_request("GET", "http:", "/api/users?id=7"),
            RecordedResponse {
                status: 200,
                headers: Headers::new(),
                body: Some(body.to_vec()),
            },
        );
        collection
    }

    #[test]
    fn test_fixture_path_encoding() {
        let store = FixtureStore::new(PathBuf::from("/fixtures"));

        let path = store.fixture_path("api.example.com:8443", "/api/users");
        assert_eq!(
            path,
            PathBuf::from("/fixtures/api.example.com%3A8443/%2Fapi%2Fusers.yaml")
        );
    }

    #[test]
    fn test_fixture_path_keeps_component_punctuation() {
        let store = FixtureStore::new(PathBuf::from("/fixtures"));

        let path = store.fixture_path("h", "/wiki/Rust_(language)!*'~ x%21");
        assert_eq!(
            path,
            PathBuf::from("/fixtures/h/%2Fwiki%2FRust_(language)!*'~%20x%2521.yaml")
        );
    }

    #[test]
    fn test_query_does_not_change_location() {
        let store = FixtureStore::new(PathBuf::from("/fixtures"));
        let (pathname, _) = crate::fingerprint::split_target("/api/users?id=7");

        assert_eq!(
            store.fixture_path("h", pathname),
            store.fixture_path("h", "/api/users")
        );
    }

    #[tokio::test]
    async fn test_load_missing() {
        let temp_dir = TempDir::new().unwrap();
        let store = FixtureStore::new(temp_dir.path().to_path_buf());

        let loaded = store.load("example.com", "/nothing").await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = FixtureStore::new(temp_dir.path().to_path_buf());
        let original = collection(b"{\"id\":7}");

        let path = store
            .save("example.com", "/api/users", &original)
            .await
            .unwrap();
        assert!(path.exists());

        let loaded = store.load("example.com", "/api/users").await.unwrap();
        assert_eq!(loaded, Some(original));
    }

    #[tokio::test]
    async fn test_save_overwrites() {
        let temp_dir = TempDir::new().unwrap();
        let store = FixtureStore::new(temp_dir.path().to_path_buf());

        store
            .save("example.com", "/a", &collection(b"first version, quite long"))
            .await
            .unwrap();
        store
            .save("example.com", "/a", &FixtureCollection::new())
            .await
            .unwrap();

        let loaded = store.load("example.com", "/a").await.unwrap().unwrap();
        assert!(loaded.is_empty());

        // only the fixture itself remains, no temp files
        let entries = std::fs::read_dir(temp_dir.path().join("example.com"))
            .unwrap()
            .count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn test_load_malformed() {
        let temp_dir = TempDir::new().unwrap();
        let store = FixtureStore::new(temp_dir.path().to_path_buf());
        let path = store.fixture_path("example.com", "/bad");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "method: [\n").unwrap();

        let err = store.load("example.com", "/bad").await.unwrap_err();
        assert!(matches!(err, TapedeckError::Parse { .. }));
    }
}
