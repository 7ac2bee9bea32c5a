//! Database walk behavior against a real directory tree.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use spela::db::Database;
use spela::db::update::{WalkOptions, walk};

fn wav_bytes(seconds: f64) -> Vec<u8> {
    let sample_rate = 8000u32;
    let frames = (sample_rate as f64 * seconds) as usize;
    let data_len = frames * 2;
    let mut out = Vec::new();
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&((36 + data_len) as u32).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&(data_len as u32).to_le_bytes());
    out.resize(out.len() + data_len, 0);
    out
}

struct Tree {
    _dir: tempfile::TempDir,
    root: Utf8PathBuf,
    db: Arc<Database>,
}

fn options() -> WalkOptions {
    WalkOptions {
        follow_inside_symlinks: true,
        follow_outside_symlinks: true,
        discard: false,
    }
}

fn setup() -> Tree {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    Tree {
        _dir: dir,
        root,
        db: Arc::new(Database::new()),
    }
}

fn write(tree: &Tree, relative: &str, bytes: &[u8]) {
    let path = tree.root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap().as_std_path()).unwrap();
    std::fs::write(path.as_std_path(), bytes).unwrap();
}

#[test]
fn walk_builds_and_purges() {
    let tree = setup();
    write(&tree, "artist/album/01.wav", &wav_bytes(1.0));
    write(&tree, "artist/album/02.wav", &wav_bytes(1.0));
    write(&tree, "artist/album/cover.jpg", b"not audio");
    write(&tree, "artist/album/set.m3u", b"01.wav\n");

    assert!(walk(&tree.db, &tree.root, None, options()));
    assert_eq!(tree.db.song_count(), 2);
    assert!(tree.db.get_song(Utf8Path::new("artist/album/01.wav")).is_some());

    tree.db.with_root(|root| {
        let album = root
            .lookup_directory(Utf8Path::new("artist/album"))
            .unwrap();
        assert!(album.playlists.contains_key("set.m3u"));
        // non-audio files are not songs
        assert!(album.get_song("cover.jpg").is_none());
    });

    // unchanged tree: second walk reports no modification
    assert!(!walk(&tree.db, &tree.root, None, options()));

    // deleting a file purges its record
    std::fs::remove_file(tree.root.join("artist/album/02.wav").as_std_path()).unwrap();
    assert!(walk(&tree.db, &tree.root, None, options()));
    assert_eq!(tree.db.song_count(), 1);

    // deleting the whole tree purges the subtree
    std::fs::remove_dir_all(tree.root.join("artist").as_std_path()).unwrap();
    assert!(walk(&tree.db, &tree.root, None, options()));
    assert_eq!(tree.db.song_count(), 0);
}

#[test]
fn walk_of_a_single_uri() {
    let tree = setup();
    write(&tree, "a/keep.wav", &wav_bytes(1.0));
    write(&tree, "b/other.wav", &wav_bytes(1.0));

    assert!(walk(
        &tree.db,
        &tree.root,
        Some(Utf8Path::new("a/keep.wav")),
        options()
    ));
    assert_eq!(tree.db.song_count(), 1);
    assert!(tree.db.get_song(Utf8Path::new("a/keep.wav")).is_some());
    // the other branch was not visited
    assert!(tree.db.get_song(Utf8Path::new("b/other.wav")).is_none());
}

#[test]
fn mpdignore_excludes_entries() {
    let tree = setup();
    write(&tree, "music/.mpdignore", b"# junk\n*.tmp.wav\ndemo*\n");
    write(&tree, "music/keep.wav", &wav_bytes(1.0));
    write(&tree, "music/scratch.tmp.wav", &wav_bytes(1.0));
    write(&tree, "music/demo take.wav", &wav_bytes(1.0));

    walk(&tree.db, &tree.root, None, options());
    assert_eq!(tree.db.song_count(), 1);
    assert!(tree.db.get_song(Utf8Path::new("music/keep.wav")).is_some());
}

#[test]
fn mtime_caching_skips_unchanged_songs() {
    let tree = setup();
    write(&tree, "song.wav", &wav_bytes(1.0));
    walk(&tree.db, &tree.root, None, options());
    let before = tree.db.get_song(Utf8Path::new("song.wav")).unwrap();

    // unchanged: the song record is reused
    walk(&tree.db, &tree.root, None, options());
    let after = tree.db.get_song(Utf8Path::new("song.wav")).unwrap();
    assert!(Arc::ptr_eq(&before, &after));

    // discard mode rescans everything
    let discard = WalkOptions {
        discard: true,
        ..options()
    };
    walk(&tree.db, &tree.root, None, discard);
    let rescanned = tree.db.get_song(Utf8Path::new("song.wav")).unwrap();
    assert!(!Arc::ptr_eq(&before, &rescanned));
}

#[cfg(unix)]
#[test]
fn symlink_policy_skips_outside_links() {
    let outside = tempfile::tempdir().unwrap();
    let outside_path = Utf8PathBuf::from_path_buf(outside.path().to_path_buf()).unwrap();
    std::fs::write(
        outside_path.join("external.wav").as_std_path(),
        wav_bytes(1.0),
    )
    .unwrap();

    let tree = setup();
    write(&tree, "inside.wav", &wav_bytes(1.0));
    std::os::unix::fs::symlink(
        outside_path.join("external.wav").as_std_path(),
        tree.root.join("linked.wav").as_std_path(),
    )
    .unwrap();

    let no_outside = WalkOptions {
        follow_outside_symlinks: false,
        ..options()
    };
    walk(&tree.db, &tree.root, None, no_outside);
    assert!(tree.db.get_song(Utf8Path::new("inside.wav")).is_some());
    assert!(tree.db.get_song(Utf8Path::new("linked.wav")).is_none());

    // with the policy open, the link is picked up
    walk(&tree.db, &tree.root, None, options());
    assert!(tree.db.get_song(Utf8Path::new("linked.wav")).is_some());
}

#[cfg(unix)]
#[test]
fn symlink_loops_are_not_descended() {
    let tree = setup();
    write(&tree, "a/song.wav", &wav_bytes(1.0));
    // a/loop -> a creates a cycle
    std::os::unix::fs::symlink(
        tree.root.join("a").as_std_path(),
        tree.root.join("a/loop").as_std_path(),
    )
    .unwrap();

    walk(&tree.db, &tree.root, None, options());
    assert_eq!(tree.db.song_count(), 1);
    assert!(tree.db.get_song(Utf8Path::new("a/song.wav")).is_some());
}

#[test]
fn database_save_load_round_trip_after_walk() {
    let tree = setup();
    write(&tree, "x/one.wav", &wav_bytes(1.0));
    write(&tree, "x/two.wav", &wav_bytes(2.0));
    walk(&tree.db, &tree.root, None, options());

    let mut text = Vec::new();
    tree.db.save(&mut text).unwrap();

    let restored = Database::new();
    restored.load(&mut text.as_slice()).unwrap();
    assert_eq!(restored.song_count(), 2);

    let mut text2 = Vec::new();
    restored.save(&mut text2).unwrap();
    assert_eq!(text, text2);
}
