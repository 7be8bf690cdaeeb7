use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chat_protocol::{MessageRecord, ModelSelection, Role, ThreadRecord, ThreadUsage, UiMessage};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};
use crate::gateway::{Identity, PersistenceGateway};
use crate::schema::{CreateThread, UpsertMessage};

const STORE_FILE_VERSION: u32 = 1;

/// Thread plus the store-private ordinal counter.
///
/// `next_ordinal` only grows, so ordinals are never reused even after a
/// truncation removes the records that held them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredThread {
    thread: ThreadRecord,
    next_ordinal: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    threads: Vec<StoredThread>,
}

/// In-process reference implementation of [`PersistenceGateway`].
///
/// With a backing file every committed mutation rewrites the file
/// atomically; a failed write leaves both the file and memory unchanged.
#[derive(Debug)]
pub struct MemoryThreadStore {
    default_selection: ModelSelection,
    threads: Mutex<HashMap<String, StoredThread>>,
    path: Option<PathBuf>,
}

impl MemoryThreadStore {
    /// Creates an empty store. `default_selection` applies to threads created
    /// without an explicit selection.
    #[must_use]
    pub fn new(default_selection: ModelSelection) -> Self {
        Self {
            default_selection,
            threads: Mutex::new(HashMap::new()),
            path: None,
        }
    }

    /// Opens a file-backed store, loading existing threads when the file exists.
    pub fn open(path: impl Into<PathBuf>, default_selection: ModelSelection) -> GatewayResult<Self> {
        let path = path.into();
        let threads = if path.exists() {
            load_store_file(&path)?
        } else {
            HashMap::new()
        };

        Ok(Self {
            default_selection,
            threads: Mutex::new(threads),
            path: Some(path),
        })
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn read<T>(
        &self,
        identity: &Identity,
        thread_id: &str,
        f: impl FnOnce(&StoredThread) -> T,
    ) -> GatewayResult<T> {
        ensure_authenticated(identity)?;
        let threads = lock_unpoisoned(&self.threads);
        let stored = threads
            .get(thread_id)
            .filter(|stored| stored.thread.is_accessible_by(&identity.user_id))
            .ok_or_else(|| GatewayError::thread_not_found(thread_id))?;
        Ok(f(stored))
    }

    /// Applies `f` to a copy of the thread and commits the copy only if `f`
    /// and the optional file write both succeed.
    fn commit(
        &self,
        identity: &Identity,
        thread_id: &str,
        f: impl FnOnce(&mut StoredThread, &str) -> GatewayResult<()>,
    ) -> GatewayResult<ThreadRecord> {
        ensure_authenticated(identity)?;
        let mut threads = lock_unpoisoned(&self.threads);
        let mut updated = threads
            .get(thread_id)
            .filter(|stored| stored.thread.is_accessible_by(&identity.user_id))
            .cloned()
            .ok_or_else(|| GatewayError::thread_not_found(thread_id))?;

        let now = now_rfc3339()?;
        f(&mut updated, &now)?;
        updated.thread.updated_at = now;

        self.persist(&threads, Some(&updated))?;
        let record = updated.thread.clone();
        threads.insert(thread_id.to_string(), updated);
        Ok(record)
    }

    fn persist(
        &self,
        threads: &HashMap<String, StoredThread>,
        replacement: Option<&StoredThread>,
    ) -> GatewayResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut all: Vec<StoredThread> = threads
            .values()
            .filter(|stored| {
                replacement.map_or(true, |replacement| {
                    replacement.thread.id != stored.thread.id
                })
            })
            .cloned()
            .collect();
        all.extend(replacement.cloned());
        all.sort_by(|left, right| left.thread.created_at.cmp(&right.thread.created_at));

        let file = StoreFile {
            version: STORE_FILE_VERSION,
            threads: all,
        };
        let bytes = serde_json::to_vec_pretty(&file)?;

        let staging = path.with_extension("json.tmp");
        fs::write(&staging, bytes)
            .map_err(|source| GatewayError::io("writing store file", &staging, source))?;
        fs::rename(&staging, path)
            .map_err(|source| GatewayError::io("replacing store file", path, source))?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceGateway for MemoryThreadStore {
    async fn list_threads(&self, identity: &Identity) -> GatewayResult<Vec<ThreadRecord>> {
        ensure_authenticated(identity)?;
        let threads = lock_unpoisoned(&self.threads);
        let mut owned: Vec<ThreadRecord> = threads
            .values()
            .filter(|stored| stored.thread.is_accessible_by(&identity.user_id))
            .map(|stored| stored.thread.clone())
            .collect();
        owned.sort_by(|left, right| {
            right
                .updated_at
                .cmp(&left.updated_at)
                .then_with(|| left.id.cmp(&right.id))
        });
        Ok(owned)
    }

    async fn create_thread(
        &self,
        identity: &Identity,
        request: CreateThread,
    ) -> GatewayResult<ThreadRecord> {
        ensure_authenticated(identity)?;

        let model_selection = match request.model_selection {
            Some(selection) if selection.is_complete() => selection,
            Some(_) => {
                return Err(GatewayError::invalid_request(
                    "modelSelection must carry all four fields",
                ))
            }
            None => self.default_selection.clone(),
        };

        let now = now_rfc3339()?;
        let mut stored = StoredThread {
            thread: ThreadRecord {
                id: Uuid::new_v4().to_string(),
                user_id: identity.user_id.clone(),
                title: request.title.filter(|title| !title.trim().is_empty()),
                model_selection,
                history: Vec::new(),
                created_at: now.clone(),
                updated_at: now,
                deleted_at: None,
            },
            next_ordinal: 0,
        };

        if let Some(message) = request.initial_user_message {
            if message.role != Role::User {
                return Err(GatewayError::invalid_request(
                    "initialUserMessage must be a user message",
                ));
            }
            ensure_message_id(&message)?;
            let selection = stored.thread.model_selection.clone();
            append_record(&mut stored, message, selection, ThreadUsage::default());
        }

        let mut threads = lock_unpoisoned(&self.threads);
        self.persist(&threads, Some(&stored))?;
        let record = stored.thread.clone();
        debug!(thread_id = %record.id, user_id = %record.user_id, "created thread");
        threads.insert(record.id.clone(), stored);
        Ok(record)
    }

    async fn get_thread(
        &self,
        identity: &Identity,
        thread_id: &str,
    ) -> GatewayResult<ThreadRecord> {
        self.read(identity, thread_id, |stored| stored.thread.clone())
    }

    async fn delete_thread(&self, identity: &Identity, thread_id: &str) -> GatewayResult<()> {
        self.commit(identity, thread_id, |stored, now| {
            for record in stored
                .thread
                .history
                .iter_mut()
                .filter(|record| record.is_live())
            {
                record.deleted_at = Some(now.to_string());
            }
            stored.thread.deleted_at = Some(now.to_string());
            Ok(())
        })?;
        debug!(%thread_id, "soft-deleted thread");
        Ok(())
    }

    async fn update_model_selection(
        &self,
        identity: &Identity,
        thread_id: &str,
        selection: &ModelSelection,
    ) -> GatewayResult<ThreadRecord> {
        if !selection.is_complete() {
            return Err(GatewayError::invalid_request(
                "modelSelection must carry all four fields",
            ));
        }

        self.commit(identity, thread_id, |stored, _| {
            stored.thread.model_selection = selection.clone();
            Ok(())
        })
    }

    async fn upsert_message(
        &self,
        identity: &Identity,
        thread_id: &str,
        request: UpsertMessage,
    ) -> GatewayResult<ThreadRecord> {
        ensure_message_id(&request.message)?;
        if let Some(selection) = &request.model_selection {
            if !selection.is_complete() {
                return Err(GatewayError::invalid_request(
                    "modelSelection must carry all four fields",
                ));
            }
        }

        self.commit(identity, thread_id, |stored, _| {
            let existing = stored
                .thread
                .history
                .iter()
                .position(|record| record.is_live() && record.message.id == request.message.id);

            match existing {
                Some(index) => {
                    let previous = &stored.thread.history[index];
                    let replacement = MessageRecord {
                        id: previous.id.clone(),
                        ordinal: previous.ordinal,
                        usage: request.usage.unwrap_or(previous.usage),
                        model_selection: request
                            .model_selection
                            .unwrap_or_else(|| previous.model_selection.clone()),
                        message: request.message,
                        deleted_at: None,
                    };
                    stored.thread.history[index] = replacement;
                }
                None => {
                    let selection = request
                        .model_selection
                        .unwrap_or_else(|| stored.thread.model_selection.clone());
                    append_record(
                        stored,
                        request.message,
                        selection,
                        request.usage.unwrap_or_default(),
                    );
                }
            }
            Ok(())
        })
    }

    async fn edit_and_truncate(
        &self,
        identity: &Identity,
        thread_id: &str,
        message_id: &str,
        message: UiMessage,
    ) -> GatewayResult<ThreadRecord> {
        if message.role != Role::User {
            return Err(GatewayError::invalid_request(
                "edited message must be a user message",
            ));
        }

        self.commit(identity, thread_id, |stored, _| {
            let index = stored
                .thread
                .history
                .iter()
                .position(|record| {
                    record.is_live()
                        && record.message.id == message_id
                        && record.message.role == Role::User
                })
                .ok_or_else(|| GatewayError::message_not_found(message_id))?;

            let previous = &stored.thread.history[index];
            let cutoff = previous.ordinal;
            let replacement = MessageRecord {
                id: previous.id.clone(),
                ordinal: previous.ordinal,
                usage: previous.usage,
                model_selection: previous.model_selection.clone(),
                message: UiMessage {
                    id: message_id.to_string(),
                    ..message
                },
                deleted_at: None,
            };
            stored.thread.history[index] = replacement;

            let before = stored.thread.history.len();
            stored.thread.history.retain(|record| record.ordinal <= cutoff);
            debug!(
                %thread_id,
                %message_id,
                removed = before - stored.thread.history.len(),
                "truncated thread after edited message"
            );
            Ok(())
        })
    }
}

fn append_record(
    stored: &mut StoredThread,
    message: UiMessage,
    model_selection: ModelSelection,
    usage: ThreadUsage,
) {
    let ordinal = stored.next_ordinal;
    stored.next_ordinal += 1;
    stored.thread.history.push(MessageRecord {
        id: Uuid::new_v4().to_string(),
        ordinal,
        message,
        usage,
        model_selection,
        deleted_at: None,
    });
}

fn ensure_authenticated(identity: &Identity) -> GatewayResult<()> {
    if identity.is_authenticated() {
        Ok(())
    } else {
        Err(GatewayError::unauthorized("missing user identity"))
    }
}

fn ensure_message_id(message: &UiMessage) -> GatewayResult<()> {
    if message.id.trim().is_empty() {
        Err(GatewayError::invalid_request("message id must not be empty"))
    } else {
        Ok(())
    }
}

fn load_store_file(path: &Path) -> GatewayResult<HashMap<String, StoredThread>> {
    let bytes =
        fs::read(path).map_err(|source| GatewayError::io("reading store file", path, source))?;
    let file: StoreFile =
        serde_json::from_slice(&bytes).map_err(|source| GatewayError::StoreFileParse {
            path: path.to_path_buf(),
            source,
        })?;

    if file.version != STORE_FILE_VERSION {
        return Err(GatewayError::UnsupportedVersion {
            path: path.to_path_buf(),
            found: file.version,
            expected: STORE_FILE_VERSION,
        });
    }

    Ok(file
        .threads
        .into_iter()
        .map(|stored| (stored.thread.id.clone(), stored))
        .collect())
}

fn now_rfc3339() -> GatewayResult<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(GatewayError::ClockFormat)
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
