//! Auto-update: watches the music directory and enqueues database update
//! jobs for paths that change on disk.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::Result;
use color_eyre::eyre::Context;
use notify_debouncer_full::notify::RecursiveMode;
use notify_debouncer_full::{DebounceEventResult, new_debouncer};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

/// A changed path, relative to the music directory, ready to feed into
/// [`crate::db::update::UpdateQueue::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsChange {
    pub uri: Option<Utf8PathBuf>,
}

/// Start watching; events are debounced for a couple of seconds so one copy
/// operation becomes one update job. The returned guard stops the watcher
/// when dropped.
pub fn start(
    music_dir: &Utf8Path,
    changes: UnboundedSender<FsChange>,
) -> Result<impl std::any::Any + Send> {
    let root = music_dir.to_path_buf();

    let mut debouncer = new_debouncer(
        Duration::from_secs(2),
        None,
        move |result: DebounceEventResult| match result {
            Ok(events) => {
                for event in events {
                    for path in &event.paths {
                        let uri = path
                            .strip_prefix(root.as_std_path())
                            .ok()
                            .and_then(|p| Utf8Path::from_path(p))
                            .map(Utf8Path::to_path_buf);
                        debug!("filesystem change: {uri:?}");
                        // update the parent directory so deletions are seen
                        let uri = uri.as_deref().and_then(Utf8Path::parent).map(
                            Utf8Path::to_path_buf,
                        );
                        if changes.send(FsChange { uri }).is_err() {
                            return;
                        }
                    }
                }
            }
            Err(errors) => {
                for error in errors {
                    warn!("filesystem watch error: {error}");
                }
            }
        },
    )
    .wrap_err("Could not create filesystem watcher")?;

    debouncer
        .watch(music_dir.as_std_path(), RecursiveMode::Recursive)
        .wrap_err("Could not watch the music directory")?;

    Ok(debouncer)
}
