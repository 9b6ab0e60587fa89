/*
 * Copyright 2020 Damian Peckett <damian@pecke.tt>
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::error::*;
use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::fs::File;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration as StdDuration;
use tokio::sync::Mutex;
use tokio::time::sleep;

/// Migration bookkeeping shared between invocations.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationState {
    /// Set while a migration is underway.
    pub in_progress_since: Option<DateTime<Utc>>,
    /// When the last migration completed.
    pub last_migration: Option<DateTime<Utc>>,
}

/// Whether a new migration may start.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    Proceed,
    InProgress { since: DateTime<Utc> },
    Cooldown { until: DateTime<Utc> },
}

impl MigrationState {
    /// In-progress markers older than `stale_after` are assumed abandoned.
    pub fn admit(
        &self,
        now: DateTime<Utc>,
        cooldown: Duration,
        stale_after: Duration,
    ) -> Admission {
        if let Some(since) = self.in_progress_since {
            if now.signed_duration_since(since) < stale_after {
                return Admission::InProgress { since };
            }
        }

        if let Some(last_migration) = self.last_migration {
            let until = last_migration + cooldown;
            if now < until {
                return Admission::Cooldown { until };
            }
        }

        Admission::Proceed
    }
}

/// Delay between attempts to take the state file lock.
const LOCK_RETRY_DELAY: StdDuration = StdDuration::from_millis(50);

/// Holds the migration state, optionally persisted as a JSON file.
///
/// File backed stores serialize updates through an advisory lock on a sibling
/// `.lock` file, so every process sharing the state file sees a single
/// admission decision at a time.
pub struct MigrationStateStore {
    path: Option<PathBuf>,
    state: Mutex<MigrationState>,
}

impl MigrationStateStore {
    /// A store that only lives as long as the process.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(MigrationState::default()),
        }
    }

    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            state: Mutex::new(MigrationState::default()),
        }
    }

    /// Current state. A missing state file is an empty state.
    pub async fn load(&self) -> Result<MigrationState, Error> {
        let state = self.state.lock().await;
        self.read(&state).await
    }

    /// Decide whether a migration may start and, if so, mark it in progress.
    ///
    /// The decision and the marker are written under the state lock.
    pub async fn begin(
        &self,
        now: DateTime<Utc>,
        cooldown: Duration,
        stale_after: Duration,
    ) -> Result<Admission, Error> {
        let mut state = self.state.lock().await;
        let _lock = self.lock().await?;

        let mut current = self.read(&state).await?;
        let admission = current.admit(now, cooldown, stale_after);
        if admission == Admission::Proceed {
            current.in_progress_since = Some(now);
            self.write(&current).await?;
            *state = current;
        }
        Ok(admission)
    }

    /// Clear the in-progress marker, recording `now` as the last migration
    /// when `start_cooldown` is set.
    pub async fn finish(&self, now: DateTime<Utc>, start_cooldown: bool) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let _lock = self.lock().await?;

        let mut current = self.read(&state).await?;
        current.in_progress_since = None;
        if start_cooldown {
            current.last_migration = Some(now);
        }
        self.write(&current).await?;
        *state = current;
        Ok(())
    }

    async fn read(&self, cached: &MigrationState) -> Result<MigrationState, Error> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(cached.clone()),
        };
        match tokio::fs::read(path).await {
            Ok(contents) => serde_json::from_slice(&contents).context(JsonSerialization {}),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(MigrationState::default()),
            Err(err) => Err(err).context(StateFile { path: path.clone() }),
        }
    }

    async fn write(&self, updated: &MigrationState) -> Result<(), Error> {
        if let Some(path) = &self.path {
            let contents = serde_json::to_vec_pretty(updated).context(JsonSerialization {})?;
            // Staged and renamed, readers only ever see a complete file.
            let staging = path.with_extension("tmp");
            tokio::fs::write(&staging, contents)
                .await
                .context(StateFile {
                    path: staging.clone(),
                })?;
            tokio::fs::rename(&staging, path)
                .await
                .context(StateFile { path: path.clone() })?;
        }
        Ok(())
    }

    /// Exclusive lock shared with other processes, released when the file is dropped.
    ///
    /// The state file itself is replaced on every write, so the lock lives on a
    /// sibling file.
    async fn lock(&self) -> Result<Option<File>, Error> {
        let path = match &self.path {
            Some(path) => path.with_extension("lock"),
            None => return Ok(None),
        };
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await
            .context(StateFile { path: path.clone() })?
            .into_std()
            .await;

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Some(file)),
                Err(err) if err.kind() == ErrorKind::WouldBlock => sleep(LOCK_RETRY_DELAY).await,
                Err(err) => return Err(err).context(StateFile { path: path.clone() }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    #[test]
    fn test_admit() {
        let cooldown = Duration::seconds(300);
        let stale_after = Duration::seconds(900);

        assert_eq!(
            MigrationState::default().admit(at(0), cooldown, stale_after),
            Admission::Proceed
        );

        let in_progress = MigrationState {
            in_progress_since: Some(at(0)),
            last_migration: None,
        };
        assert_eq!(
            in_progress.admit(at(60), cooldown, stale_after),
            Admission::InProgress { since: at(0) }
        );
        assert_eq!(in_progress.admit(at(901), cooldown, stale_after), Admission::Proceed);

        let cooling = MigrationState {
            in_progress_since: None,
            last_migration: Some(at(0)),
        };
        assert_eq!(
            cooling.admit(at(299), cooldown, stale_after),
            Admission::Cooldown { until: at(300) }
        );
        assert_eq!(cooling.admit(at(300), cooldown, stale_after), Admission::Proceed);
    }

    #[tokio::test]
    async fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let cooldown = Duration::seconds(300);
        let stale_after = Duration::seconds(900);
        let store = MigrationStateStore::with_file(&path);

        assert_eq!(store.load().await.unwrap(), MigrationState::default());
        assert_eq!(
            store.begin(at(0), cooldown, stale_after).await.unwrap(),
            Admission::Proceed
        );

        // A fresh store, as a later invocation would see it.
        let reopened = MigrationStateStore::with_file(&path);
        assert_eq!(reopened.load().await.unwrap().in_progress_since, Some(at(0)));
        assert_eq!(
            reopened.begin(at(60), cooldown, stale_after).await.unwrap(),
            Admission::InProgress { since: at(0) }
        );

        store.finish(at(100), true).await.unwrap();
        assert_eq!(
            reopened.load().await.unwrap(),
            MigrationState {
                in_progress_since: None,
                last_migration: Some(at(100)),
            }
        );
        assert_eq!(
            reopened.begin(at(200), cooldown, stale_after).await.unwrap(),
            Admission::Cooldown { until: at(400) }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_file_store_admits_one_of_concurrent_stores() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let cooldown = Duration::seconds(300);
        let stale_after = Duration::seconds(900);
        let first = MigrationStateStore::with_file(&path);
        let second = MigrationStateStore::with_file(&path);

        let (a, b) = tokio::join!(
            first.begin(at(0), cooldown, stale_after),
            second.begin(at(0), cooldown, stale_after)
        );
        let admissions = vec![a.unwrap(), b.unwrap()];

        assert_eq!(
            admissions
                .iter()
                .filter(|admission| **admission == Admission::Proceed)
                .count(),
            1
        );
        assert!(admissions.contains(&Admission::InProgress { since: at(0) }));
    }

    #[tokio::test]
    async fn test_finish_without_cooldown() {
        let store = MigrationStateStore::in_memory();
        let cooldown = Duration::seconds(300);
        let stale_after = Duration::seconds(900);

        store.begin(at(0), cooldown, stale_after).await.unwrap();
        store.finish(at(10), false).await.unwrap();

        assert_eq!(store.load().await.unwrap(), MigrationState::default());
        assert_eq!(
            store.begin(at(20), cooldown, stale_after).await.unwrap(),
            Admission::Proceed
        );
    }

    #[tokio::test]
    async fn test_file_store_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "not json").unwrap();

        let store = MigrationStateStore::with_file(&path);
        assert!(store.load().await.is_err());
        assert!(store
            .begin(at(0), Duration::seconds(300), Duration::seconds(900))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = MigrationStateStore::in_memory();
        let cooldown = Duration::seconds(300);
        let stale_after = Duration::seconds(900);

        store.begin(at(1), cooldown, stale_after).await.unwrap();

        assert_eq!(
            store.load().await.unwrap(),
            MigrationState {
                in_progress_since: Some(at(1)),
                last_migration: None,
            }
        );
        assert_eq!(
            store.begin(at(2), cooldown, stale_after).await.unwrap(),
            Admission::InProgress { since: at(1) }
        );
    }
}
