//! A credential store backed by a local JSON file

use std::{collections::BTreeMap, io, path::PathBuf};

use async_trait::async_trait;
use tokio::{fs::OpenOptions, sync::Mutex};

use super::{CredentialStore, StoreError};

type Entries = BTreeMap<String, String>;

/// A credential store that keeps its entries in a local file
///
/// Entries are kept as a single JSON object. Every write replaces the file
/// by writing a sibling temporary file and renaming it into place, so
/// readers never observe a partially written file. A missing file reads as
/// an empty store.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Constructs a new file store
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    async fn read_entries(&self) -> Result<Entries, StoreError> {
        use tokio::io::AsyncReadExt;

        let mut file = match OpenOptions::new().read(true).open(&self.path).await {
            Ok(file) => file,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Ok(Entries::new());
            }
            Err(error) => return Err(error.into()),
        };

        let mut data = String::new();
        file.read_to_string(&mut data).await?;
        if data.trim().is_empty() {
            return Ok(Entries::new());
        }

        Ok(serde_json::from_str(&data)?)
    }

    async fn write_entries(&self, entries: &Entries) -> Result<(), StoreError> {
        use tokio::io::AsyncWriteExt;

        let mut tmp_path = self.path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        let mut file_opts = OpenOptions::new();

        file_opts.create(true).truncate(true).write(true);

        #[cfg(unix)]
        file_opts.mode(0o600);

        let mut file = file_opts.open(&tmp_path).await?;
        let data = serde_json::to_string_pretty(entries)?;
        file.write_all(data.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }

    async fn modify<F>(&self, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Entries) + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.read_entries().await?;
        f(&mut entries);
        self.write_entries(&entries).await
    }
}

#[async_trait]
impl CredentialStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.read_entries().await?;
        Ok(entries.remove(key))
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        let key = key.to_owned();
        self.modify(move |entries| {
            entries.insert(key, value);
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.modify(|entries| {
            entries.remove(key);
        })
        .await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.modify(|entries| entries.clear()).await
    }

    async fn set_many(&self, new_entries: Vec<(&'static str, String)>) -> Result<(), StoreError> {
        self.modify(move |entries| {
            entries.extend(new_entries.into_iter().map(|(k, v)| (k.to_owned(), v)));
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::scratch_path;

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let store = FileStore::new(scratch_path("file-store-missing"));
        assert_eq!(store.get("auth_token").await.unwrap(), None);
    }

    #[tokio::test]
    async fn entries_survive_a_new_store_instance() {
        let path = scratch_path("file-store-reopen");
        let store = FileStore::new(path.clone());
        store
            .set_many(vec![
                ("auth_token", "abc".to_owned()),
                ("token_expiration", "1700000000000".to_owned()),
            ])
            .await
            .unwrap();

        let reopened = FileStore::new(path.clone());
        assert_eq!(
            reopened.get("auth_token").await.unwrap().as_deref(),
            Some("abc")
        );
        assert_eq!(
            reopened.get("token_expiration").await.unwrap().as_deref(),
            Some("1700000000000")
        );

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn remove_and_clear_drop_entries() {
        let path = scratch_path("file-store-remove");
        let store = FileStore::new(path.clone());
        store.set("a", "1".to_owned()).await.unwrap();
        store.set("b", "2".to_owned()).await.unwrap();

        store.remove("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.get("b").await.unwrap().as_deref(), Some("2"));

        store.clear().await.unwrap();
        assert_eq!(store.get("b").await.unwrap(), None);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn malformed_contents_are_reported() {
        let path = scratch_path("file-store-malformed");
        std::fs::write(&path, "not json").unwrap();

        let store = FileStore::new(path.clone());
        assert!(matches!(
            store.get("auth_token").await,
            Err(StoreError::Serialization(_))
        ));

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn set_many_replaces_every_key_in_one_file_write() {
        let path = scratch_path("file-store-set-many");
        let store = FileStore::new(path.clone());
        store.set("auth_token", "old".to_owned()).await.unwrap();
        store.set("user_info", "{}".to_owned()).await.unwrap();

        store
            .set_many(vec![
                ("auth_token", "new-access".to_owned()),
                ("refresh_token", "new-refresh".to_owned()),
                ("expiresIn", "900000".to_owned()),
                ("token_expiration", "1700000900000".to_owned()),
            ])
            .await
            .unwrap();

        let on_disk: Entries =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let expected: Entries = [
            ("auth_token", "new-access"),
            ("expiresIn", "900000"),
            ("refresh_token", "new-refresh"),
            ("token_expiration", "1700000900000"),
            ("user_info", "{}"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();
        assert_eq!(on_disk, expected);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn writes_leave_no_temporary_file_behind() {
        let path = scratch_path("file-store-no-tmp");
        let store = FileStore::new(path.clone());

        store.set("auth_token", "abc".to_owned()).await.unwrap();
        store.remove("auth_token").await.unwrap();

        let mut tmp_path = path.clone().into_os_string();
        tmp_path.push(".tmp");
        assert!(path.exists());
        assert!(!PathBuf::from(tmp_path).exists());

        let _ = std::fs::remove_file(path);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_is_only_readable_by_its_owner() {
        use std::os::unix::fs::PermissionsExt;

        let path = scratch_path("file-store-mode");
        let store = FileStore::new(path.clone());
        store.set("auth_token", "abc".to_owned()).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let _ = std::fs::remove_file(path);
    }
}
