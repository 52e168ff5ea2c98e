use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{StorageBackend, StorageError};

/// Suffix of in-progress writes. Escaped key names never contain a dot.
const TEMP_SUFFIX: &str = ".tmp";

/// Longest escaped key used verbatim as a file name. Leaves room for the
/// temp suffix under the usual 255-byte limit.
const MAX_PLAIN_NAME: usize = 200;

/// Escaped prefix kept in front of the digest of a long key.
const HASHED_PREFIX_LEN: usize = 96;

/// Separates the prefix from the digest. Never produced by `escape_key`.
const HASHED_MARKER: char = '~';

/// One file per key under a root directory.
///
/// Writes go to a temporary file which is synced and then renamed over the
/// target, so readers never observe a partial value.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: PathBuf) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&root).map_err(|source| StorageError::Io {
            key: root.display().to_string(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(file_name(key))
    }
}

/// File name for `key`: the escaped key, or for long keys an escaped
/// prefix plus the SHA-256 of the key. Hashed files carry the key inside.
fn file_name(key: &str) -> String {
    let escaped = escape_key(key);
    if escaped.len() <= MAX_PLAIN_NAME {
        return escaped;
    }
    // Cut on an escape boundary so the prefix stays readable
    let mut cut = 0;
    let bytes = escaped.as_bytes();
    while cut < bytes.len() {
        let step = if bytes[cut] == b'%' { 3 } else { 1 };
        if cut + step > HASHED_PREFIX_LEN {
            break;
        }
        cut += step;
    }
    format!(
        "{}{}{}",
        &escaped[..cut],
        HASHED_MARKER,
        hex::encode(Sha256::digest(key.as_bytes()))
    )
}

fn is_hashed(name: &str) -> bool {
    name.contains(HASHED_MARKER)
}

/// Hashed file layout: key length (u32 BE), key, value.
fn frame(key: &str, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + key.len() + value.len());
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out.extend_from_slice(key.as_bytes());
    out.extend_from_slice(value);
    out
}

fn unframe(bytes: &[u8]) -> Option<(&str, &[u8])> {
    let len_bytes: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let key = std::str::from_utf8(bytes.get(4..4 + len)?).ok()?;
    Some((key, &bytes[4 + len..]))
}

/// Map an arbitrary key to a file name: ASCII alphanumerics, `-` and `_`
/// pass through, every other byte becomes `%XX`.
fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

fn unescape_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn io_err(key: &str) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        key: key.to_string(),
        source,
    }
}

#[async_trait]
impl StorageBackend for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let name = file_name(key);
        let bytes = match tokio::fs::read(self.root.join(&name)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(key)(e)),
        };
        if !is_hashed(&name) {
            return Ok(Some(bytes));
        }
        match unframe(&bytes) {
            Some((stored, value)) if stored == key => Ok(Some(value.to_vec())),
            _ => Err(StorageError::Corrupt(key.to_string())),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let name = file_name(key);
        let path = self.root.join(&name);
        let temp_path = self.root.join(format!(
            "{}.{:016x}{}",
            name,
            rand::random::<u64>(),
            TEMP_SUFFIX
        ));
        let framed;
        let contents = if is_hashed(&name) {
            framed = frame(key, value);
            framed.as_slice()
        } else {
            value
        };

        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(io_err(key))?;
        file.write_all(contents).await.map_err(io_err(key))?;
        file.sync_all().await.map_err(io_err(key))?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&temp_path, &path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(io_err(key)(e));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(key)(e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut dir = tokio::fs::read_dir(&self.root)
            .await
            .map_err(io_err(prefix))?;
        let mut keys = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(io_err(prefix))? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(TEMP_SUFFIX) {
                continue;
            }
            if is_hashed(name) {
                let bytes = tokio::fs::read(entry.path()).await.map_err(io_err(prefix))?;
                match unframe(&bytes) {
                    Some((key, _)) if key.starts_with(prefix) => keys.push(key.to_string()),
                    Some(_) => {}
                    None => debug!(file = name, "Skipping unreadable hashed entry"),
                }
                continue;
            }
            match unescape_key(name) {
                Some(key) if key.starts_with(prefix) => keys.push(key),
                Some(_) => {}
                None => debug!(file = name, "Skipping unrecognized file in storage root"),
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_key() {
        assert_eq!(escape_key("feed:home"), "feed%3Ahome");
        assert_eq!(escape_key("a/b.c"), "a%2Fb%2Ec");
        assert_eq!(unescape_key("feed%3Ahome").as_deref(), Some("feed:home"));
        assert_eq!(
            unescape_key(&escape_key("credentials/did:plc:ab12")).as_deref(),
            Some("credentials/did:plc:ab12")
        );
        assert_eq!(unescape_key("bad%G1"), None);
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf()).unwrap();

        assert_eq!(storage.get("cache/feed:home").await.unwrap(), None);
        storage.put("cache/feed:home", b"v1").await.unwrap();
        storage.put("cache/feed:home", b"v2").await.unwrap();
        assert_eq!(
            storage.get("cache/feed:home").await.unwrap(),
            Some(b"v2".to_vec())
        );

        storage.delete("cache/feed:home").await.unwrap();
        storage.delete("cache/feed:home").await.unwrap();
        assert_eq!(storage.get("cache/feed:home").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_long_keys_are_hashed() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf()).unwrap();
        let key = format!(
            "cache/app.bsky.feed.getAuthorFeed:actor=did:plc:alice:cursor={}",
            "x".repeat(300)
        );
        assert!(key.len() > 255);

        storage.put(&key, b"{\"feed\":[]}").await.unwrap();
        assert_eq!(
            storage.get(&key).await.unwrap(),
            Some(b"{\"feed\":[]}".to_vec())
        );
        assert_eq!(storage.list("cache/").await.unwrap(), vec![key.clone()]);

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].len() <= MAX_PLAIN_NAME);
        assert!(names[0].starts_with("cache%2Fapp%2Ebsky"));

        // Keys sharing the kept prefix still get their own files
        let other = format!("{}y", key);
        storage.put(&other, b"2").await.unwrap();
        assert_eq!(storage.get(&key).await.unwrap().map(|v| v.len()), Some(11));
        assert_eq!(storage.list("cache/").await.unwrap().len(), 2);

        storage.delete(&key).await.unwrap();
        assert_eq!(storage.get(&key).await.unwrap(), None);
        assert_eq!(storage.list("cache/").await.unwrap(), vec![other]);
    }

    #[test]
    fn test_hashed_prefix_never_splits_an_escape() {
        let key = ":".repeat(100);
        let name = file_name(&key);
        let (prefix, digest) = name.split_once(HASHED_MARKER).unwrap();
        assert_eq!(prefix.len() % 3, 0);
        assert!(prefix.len() <= HASHED_PREFIX_LEN);
        assert_eq!(digest.len(), 64);
        assert_eq!(file_name("feed:home"), "feed%3Ahome");
    }

    #[tokio::test]
    async fn test_list_ignores_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf()).unwrap();
        storage.put("queue/did:plc:a", b"[]").await.unwrap();
        storage.put("queue/did:plc:b", b"[]").await.unwrap();
        storage.put("cache/x", b"{}").await.unwrap();
        std::fs::write(dir.path().join("queue%2Fdid%3Aplc%3Ac.0000.tmp"), b"partial").unwrap();

        let keys = storage.list("queue/").await.unwrap();
        assert_eq!(keys, vec!["queue/did:plc:a", "queue/did:plc:b"]);
    }
}
