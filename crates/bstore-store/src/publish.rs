use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use bstore_fs::{remove_path, rename_no_replace, touch, CancelToken, FsError, RenameOutcome};
use bstore_hash::ContentHasher;
use bstore_stage::Assembled;
use bstore_types::{ContentHash, DataMetadata};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::StoreResult;
use crate::layout::StoreLayout;

/// Attempts to promote before giving up when the destination keeps
/// vanishing between the failed rename and the refresh.
const MAX_PROMOTE_ATTEMPTS: usize = 3;

/// Steps of a single publish.
///
/// ```text
/// Staging -> Hashing -> Promoting -> Published
///                                \-> Discarded
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishState {
    Staging,
    Hashing,
    Promoting,
    /// The staged tree became `data/<hash>`.
    Published,
    /// Identical content was already stored; the staged tree was deleted.
    Discarded,
}

impl PublishState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Published | Self::Discarded)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Staging, Self::Hashing)
                | (Self::Hashing, Self::Promoting)
                | (Self::Promoting, Self::Published)
                | (Self::Promoting, Self::Discarded)
        )
    }
}

/// How a publish ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishOutcome {
    Published,
    Discarded,
}

/// What a successful publish hands back to the caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PublishReceipt {
    pub hash: ContentHash,
    pub metadata: DataMetadata,
    pub outcome: PublishOutcome,
    pub state: PublishState,
    /// Absolute `data/<hash>`.
    pub location: PathBuf,
}

/// Hashes staged trees and promotes them into `data/`.
pub struct Publisher {
    layout: StoreLayout,
    hasher: ContentHasher,
}

struct Tracker {
    state: PublishState,
}

impl Tracker {
    fn advance(&mut self, next: PublishState) {
        debug_assert!(self.state.can_advance_to(next), "{:?} -> {next:?}", self.state);
        debug!(from = ?self.state, to = ?next, "publish state");
        self.state = next;
    }
}

impl Publisher {
    pub fn new(layout: StoreLayout) -> Self {
        Self {
            layout,
            hasher: ContentHasher::BUNDLE,
        }
    }

    /// Hash `assembled.path`, move it to `data/<hash>` unless that exists,
    /// then delete `assembled.to_delete`.
    ///
    /// On return `data/<hash>` exists and is complete, whichever of several
    /// concurrent publishers of the same content won the rename. The entry's
    /// mtime is refreshed before it becomes visible (published) or before the
    /// staged copy is dropped (discarded), so a background data sweep leaves
    /// it alone for its grace window.
    pub fn publish(&self, assembled: &Assembled, cancel: &CancelToken) -> StoreResult<PublishReceipt> {
        let mut tracker = Tracker {
            state: PublishState::Staging,
        };
        let source = assembled.path.as_path();

        tracker.advance(PublishState::Hashing);
        let (hash, listing) = self.hasher.hash_path(source, cancel)?;
        let metadata = DataMetadata {
            data_size: listing.total_size(),
        };
        debug!(hash = %hash.short_hex(), size = metadata.data_size, "hashed staged tree");

        tracker.advance(PublishState::Promoting);
        cancel.check()?;
        let location = self.layout.location_of(&hash);
        if let Err(e) = touch(source) {
            warn!(path = %source.display(), error = %e, "cannot refresh staged tree mtime");
        }
        let outcome = promote(source, &location)?;
        tracker.advance(match outcome {
            PublishOutcome::Published => PublishState::Published,
            PublishOutcome::Discarded => PublishState::Discarded,
        });

        for path in &assembled.to_delete {
            match remove_path(path) {
                Ok(true) => debug!(path = %path.display(), "removed"),
                Ok(false) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "cleanup after publish failed"),
            }
        }

        Ok(PublishReceipt {
            hash,
            metadata,
            outcome,
            state: tracker.state,
            location,
        })
    }
}

fn promote(source: &Path, location: &Path) -> StoreResult<PublishOutcome> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match rename_no_replace(source, location)? {
            RenameOutcome::Renamed => {
                info!(dest = %location.display(), "published");
                return Ok(PublishOutcome::Published);
            }
            RenameOutcome::DestinationExists if refresh(location)? => {
                info!(dest = %location.display(), "content already stored; discarding staged copy");
                remove_path(source)?;
                return Ok(PublishOutcome::Discarded);
            }
            RenameOutcome::DestinationExists if attempt < MAX_PROMOTE_ATTEMPTS => {
                warn!(dest = %location.display(), attempt, "stored entry vanished during promotion; retrying");
            }
            RenameOutcome::DestinationExists => {
                let err = io::Error::new(io::ErrorKind::NotFound, "stored entry keeps vanishing");
                return Err(FsError::io("promote", location, err).into());
            }
        }
    }
}

fn present(path: &Path) -> StoreResult<bool> {
    match fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(FsError::io("stat", path, e).into()),
    }
}

/// Restart the grace window of an existing stored entry. Returns `false`
/// if the entry is gone, e.g. collected by a concurrent sweep.
fn refresh(location: &Path) -> StoreResult<bool> {
    match touch(location) {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => {
            warn!(path = %location.display(), error = %e, "cannot refresh stored entry mtime");
            present(location)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, StoreError};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::{Duration, SystemTime};

    fn store() -> (tempfile::TempDir, StoreLayout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.ensure_directories().unwrap();
        (dir, layout)
    }

    /// Stage `files` under `temp/<name>/` the way the assembler would for
    /// several sources.
    fn staged(layout: &StoreLayout, name: &str, files: &[(&str, &[u8])]) -> Assembled {
        let wrapper = layout.temp_dir().join(name);
        fs::create_dir(&wrapper).unwrap();
        for (file, data) in files {
            fs::write(wrapper.join(file), data).unwrap();
        }
        Assembled {
            path: wrapper.clone(),
            wrapper,
            to_delete: Vec::new(),
        }
    }

    #[test]
    fn state_transitions() {
        use PublishState::*;
        assert!(Staging.can_advance_to(Hashing));
        assert!(Hashing.can_advance_to(Promoting));
        assert!(Promoting.can_advance_to(Published));
        assert!(Promoting.can_advance_to(Discarded));
        assert!(!Staging.can_advance_to(Promoting));
        assert!(!Published.can_advance_to(Discarded));
        assert!(Published.is_terminal() && Discarded.is_terminal());
        assert!(!Hashing.is_terminal());
    }

    #[test]
    fn publish_promotes_into_data() {
        let (_dir, layout) = store();
        let publisher = Publisher::new(layout.clone());
        let assembled = staged(&layout, "up-1", &[("a.txt", b"aaa"), ("b.txt", b"bb")]);

        let receipt = publisher.publish(&assembled, &CancelToken::new()).unwrap();
        assert_eq!(receipt.outcome, PublishOutcome::Published);
        assert_eq!(receipt.state, PublishState::Published);
        assert_eq!(receipt.metadata.data_size, 5);
        assert_eq!(receipt.location, layout.location_of(&receipt.hash));
        assert_eq!(fs::read(receipt.location.join("a.txt")).unwrap(), b"aaa");
        assert!(!assembled.path.exists());
    }

    #[test]
    fn identical_content_is_discarded() {
        let (_dir, layout) = store();
        let publisher = Publisher::new(layout.clone());
        let first = publisher
            .publish(&staged(&layout, "up-1", &[("x", b"same")]), &CancelToken::new())
            .unwrap();
        let second_staged = staged(&layout, "up-2", &[("x", b"same")]);
        let second = publisher.publish(&second_staged, &CancelToken::new()).unwrap();

        assert_eq!(first.hash, second.hash);
        assert_eq!(second.outcome, PublishOutcome::Discarded);
        assert_eq!(second.state, PublishState::Discarded);
        assert!(!second_staged.path.exists());
        assert_eq!(layout.stored_hashes().unwrap(), vec![first.hash]);
    }

    #[test]
    fn publish_refreshes_existing_entry() {
        let (_dir, layout) = store();
        let publisher = Publisher::new(layout.clone());
        let first = publisher
            .publish(&staged(&layout, "up-1", &[("x", b"old")]), &CancelToken::new())
            .unwrap();
        let stale = SystemTime::now() - Duration::from_secs(86_400);
        fs::File::open(&first.location).unwrap().set_modified(stale).unwrap();

        publisher
            .publish(&staged(&layout, "up-2", &[("x", b"old")]), &CancelToken::new())
            .unwrap();
        let mtime = fs::metadata(&first.location).unwrap().modified().unwrap();
        assert!(mtime > stale + Duration::from_secs(3600));
    }

    #[test]
    fn published_entry_starts_fresh() {
        let (_dir, layout) = store();
        let publisher = Publisher::new(layout.clone());
        let assembled = staged(&layout, "up-1", &[("x", b"moved in")]);
        let stale = SystemTime::now() - Duration::from_secs(86_400);
        fs::File::open(&assembled.path).unwrap().set_modified(stale).unwrap();

        let receipt = publisher.publish(&assembled, &CancelToken::new()).unwrap();
        assert_eq!(receipt.outcome, PublishOutcome::Published);
        let mtime = fs::metadata(&receipt.location).unwrap().modified().unwrap();
        assert!(mtime > stale + Duration::from_secs(3600));
    }

    #[test]
    fn refresh_reports_a_collected_entry() {
        let (_dir, layout) = store();
        let location = layout.data_dir().join("entry");
        fs::create_dir(&location).unwrap();
        let stale = SystemTime::now() - Duration::from_secs(86_400);
        fs::File::open(&location).unwrap().set_modified(stale).unwrap();

        assert!(refresh(&location).unwrap());
        assert!(fs::metadata(&location).unwrap().modified().unwrap() > stale);

        // Swept between the failed rename and the refresh: promote again.
        fs::remove_dir(&location).unwrap();
        assert!(!refresh(&location).unwrap());
        let source = staged(&layout, "up-1", &[("x", b"again")]).path;
        assert_eq!(promote(&source, &location).unwrap(), PublishOutcome::Published);
        assert_eq!(fs::read(location.join("x")).unwrap(), b"again");
    }

    #[test]
    fn single_file_entries_are_promoted() {
        let (_dir, layout) = store();
        let publisher = Publisher::new(layout.clone());
        let wrapper = layout.temp_dir().join("up-1");
        fs::create_dir(&wrapper).unwrap();
        let file = wrapper.join("notes.txt");
        fs::write(&file, b"notes").unwrap();
        let assembled = Assembled {
            path: file,
            wrapper: wrapper.clone(),
            to_delete: vec![wrapper.clone()],
        };

        let receipt = publisher.publish(&assembled, &CancelToken::new()).unwrap();
        assert!(receipt.location.is_file());
        assert_eq!(fs::read(&receipt.location).unwrap(), b"notes");
        assert!(!wrapper.exists());
    }

    #[test]
    fn cleanup_list_tolerates_missing_paths() {
        let (dir, layout) = store();
        let publisher = Publisher::new(layout.clone());
        let mut assembled = staged(&layout, "up-1", &[("x", b"1")]);
        assembled.to_delete.push(dir.path().join("never-existed"));
        let original = dir.path().join("original.txt");
        fs::write(&original, b"1").unwrap();
        assembled.to_delete.push(original.clone());

        publisher.publish(&assembled, &CancelToken::new()).unwrap();
        assert!(!original.exists());
    }

    #[test]
    fn vanished_source_is_a_filesystem_error() {
        let (_dir, layout) = store();
        let publisher = Publisher::new(layout.clone());
        let assembled = staged(&layout, "up-1", &[("x", b"1")]);
        fs::remove_dir_all(&assembled.path).unwrap();

        let err = publisher.publish(&assembled, &CancelToken::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Filesystem);
        assert!(layout.stored_hashes().unwrap().is_empty());
    }

    #[test]
    fn cancelled_publish_leaves_data_untouched() {
        let (_dir, layout) = store();
        let publisher = Publisher::new(layout.clone());
        let assembled = staged(&layout, "up-1", &[("x", b"1")]);
        let token = CancelToken::new();
        token.cancel();

        let err = publisher.publish(&assembled, &token).unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
        assert!(layout.stored_hashes().unwrap().is_empty());
        assert!(assembled.path.exists());
    }

    #[test]
    fn concurrent_publishers_agree() {
        let (_dir, layout) = store();
        let publisher = Arc::new(Publisher::new(layout.clone()));
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let assembled = staged(
                    &layout,
                    &format!("up-{i}"),
                    &[("model.bin", b"weights"), ("README", b"same bundle")],
                );
                let publisher = Arc::clone(&publisher);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    publisher.publish(&assembled, &CancelToken::new()).unwrap()
                })
            })
            .collect();
        let receipts: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let hash = receipts[0].hash;
        assert!(receipts.iter().all(|r| r.hash == hash));
        let published = receipts
            .iter()
            .filter(|r| r.outcome == PublishOutcome::Published)
            .count();
        assert_eq!(published, 1);
        assert_eq!(layout.stored_hashes().unwrap(), vec![hash]);
        assert_eq!(fs::read(layout.location_of(&hash).join("model.bin")).unwrap(), b"weights");
        assert_eq!(fs::read_dir(layout.temp_dir()).unwrap().count(), 0);
    }
}
