//! A file-per-id blob cache under a base directory, and the conversation
//! codec built on top of it.

use std::fs;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::proto::Message;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid identifier")]
    InvalidId,

    #[error("not found")]
    NotFound,

    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{context}: {source}")]
    Codec {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl CacheError {
    fn io(context: &'static str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            CacheError::NotFound
        } else {
            CacheError::Io { context, source }
        }
    }
}

/// Which cache a store instance is scoped to; each kind gets its own
/// subdirectory under the base path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Conversations,
    Temporary,
}

impl CacheKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheKind::Conversations => "conversations",
            CacheKind::Temporary => "temp",
        }
    }
}

const CACHE_EXT: &str = "json";

/// A typed blob cache storing one serialized value per id.
pub struct Cache<T> {
    dir: PathBuf,
    _marker: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> Cache<T> {
    pub fn new(base: &Path, kind: CacheKind) -> Result<Self, CacheError> {
        let dir = base.join(kind.as_str());
        fs::create_dir_all(&dir).map_err(|err| CacheError::io("create cache dir", err))?;
        Ok(Self {
            dir,
            _marker: PhantomData,
        })
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry(&self, id: &str) -> Result<PathBuf, CacheError> {
        if id.is_empty() {
            return Err(CacheError::InvalidId);
        }
        Ok(self.dir.join(format!("{id}.{CACHE_EXT}")))
    }

    pub fn read(&self, id: &str) -> Result<T, CacheError> {
        let bytes =
            fs::read(self.entry(id)?).map_err(|err| CacheError::io("read", err))?;
        serde_json::from_slice(&bytes).map_err(|source| CacheError::Codec {
            context: "read",
            source,
        })
    }

    pub fn write(&self, id: &str, value: &T) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(value).map_err(|source| CacheError::Codec {
            context: "write",
            source,
        })?;
        fs::write(self.entry(id)?, bytes).map_err(|err| CacheError::io("write", err))
    }

    pub fn delete(&self, id: &str) -> Result<(), CacheError> {
        fs::remove_file(self.entry(id)?).map_err(|err| CacheError::io("delete", err))
    }
}

/// The conversation blob cache: a serialized message thread per id.
pub struct Conversations {
    cache: Cache<Vec<Message>>,
}

impl Conversations {
    pub fn new(base: &Path) -> Result<Self, CacheError> {
        Ok(Self {
            cache: Cache::new(base, CacheKind::Conversations)?,
        })
    }

    /// Reads the thread stored under `id`. Blobs written before tool
    /// calls existed carry only role and content and upgrade to empty
    /// `tool_calls` on decode.
    pub fn read(&self, id: &str) -> Result<Vec<Message>, CacheError> {
        self.cache.read(id)
    }

    pub fn write(&self, id: &str, messages: &[Message]) -> Result<(), CacheError> {
        self.cache.write(id, &messages.to_vec())
    }

    pub fn delete(&self, id: &str) -> Result<(), CacheError> {
        self.cache.delete(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{Function, Role, ToolCall};

    fn temp_cache() -> (tempfile::TempDir, Conversations) {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = Conversations::new(dir.path()).unwrap();
        (dir, cache)
    }

    #[test]
    fn read_missing_entry() {
        let (_dir, cache) = temp_cache();
        assert!(matches!(
            cache.read("super-fake"),
            Err(CacheError::NotFound)
        ));
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_dir, cache) = temp_cache();
        let messages = vec![
            Message::user("first four natural numbers"),
            Message::assistant("1, 2, 3, 4"),
            Message {
                role: Role::Tool,
                content: "4".into(),
                tool_calls: vec![ToolCall {
                    id: "call_9".into(),
                    is_error: false,
                    function: Function {
                        name: "math_count".into(),
                        arguments: "{\"upto\":4}".into(),
                    },
                }],
            },
        ];
        cache.write("fake", &messages).unwrap();
        assert_eq!(cache.read("fake").unwrap(), messages);
    }

    #[test]
    fn delete_removes_the_entry() {
        let (_dir, cache) = temp_cache();
        cache.write("fake", &[]).unwrap();
        cache.delete("fake").unwrap();
        assert!(matches!(cache.read("fake"), Err(CacheError::NotFound)));
    }

    #[test]
    fn blank_ids_are_rejected() {
        let (_dir, cache) = temp_cache();
        assert!(matches!(cache.write("", &[]), Err(CacheError::InvalidId)));
        assert!(matches!(cache.read(""), Err(CacheError::InvalidId)));
        assert!(matches!(cache.delete(""), Err(CacheError::InvalidId)));
    }

    #[test]
    fn blobs_without_tool_calls_still_decode() {
        let (dir, cache) = temp_cache();
        let legacy = r#"[
            {"role":"user","content":"hello"},
            {"role":"assistant","content":"hi"}
        ]"#;
        std::fs::write(
            dir.path().join("conversations").join("old.json"),
            legacy,
        )
        .unwrap();

        let messages = cache.read("old").unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.tool_calls.is_empty()));
        assert_eq!(messages[0].role, Role::User);
    }
}
