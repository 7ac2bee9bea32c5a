//! Shutdown writes the state file; a fresh server restores queue and
//! options from it.

use std::sync::Arc;

use camino::Utf8PathBuf;
use pretty_assertions::assert_eq;
use spela::config::Config;
use spela::db::update::{WalkOptions, walk};
use spela::system::System;

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

fn test_config(root: &Utf8PathBuf) -> Config {
    let mut config = Config::default();
    config.music_directory = root.join("music");
    config.playlist_directory = root.join("playlists");
    config.db_file = root.join("database");
    config.state_file = Some(root.join("state"));
    config.outputs[0].sync = false;
    config
}

#[tokio::test(flavor = "multi_thread")]
async fn queue_and_options_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    std::fs::create_dir_all(root.join("music").as_std_path()).unwrap();
    for name in ["one.wav", "two.wav", "three.wav"] {
        std::fs::write(root.join("music").join(name).as_std_path(), wav_bytes(1.0)).unwrap();
    }

    let config = test_config(&root);

    // first run: build the database, fill the queue, set options
    {
        let system = System::start(config.clone()).unwrap();
        let mut sys = system.lock().await;
        let music = sys.config.music_directory.clone();
        walk(
            &sys.db,
            &music,
            None,
            WalkOptions {
                follow_inside_symlinks: true,
                follow_outside_symlinks: true,
                discard: false,
            },
        );

        for name in ["one.wav", "two.wav", "three.wav"] {
            let db = Arc::clone(&sys.db);
            sys.playlist
                .append_uri(&db, camino::Utf8Path::new(name))
                .unwrap();
        }
        sys.playlist
            .append_song(Arc::new(spela::song::Song::detached(
                "http://radio.example/live",
            )))
            .unwrap();
        sys.playlist.set_repeat(true);
        sys.playlist.set_consume(true);
        sys.playlist.set_priority(1, 2, 9).unwrap();
        sys.pc.set_cross_fade_seconds(4.0);
        sys.save_db_file();
        sys.shutdown();
    }

    // second run: everything is back
    {
        let system = System::start(config).unwrap();
        let sys = system.lock().await;
        let queue = &sys.playlist.queue;
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.get(0).uri, "one.wav");
        assert_eq!(queue.get(3).uri, "http://radio.example/live");
        assert!(!queue.get(3).in_database);
        assert_eq!(queue.item(1).priority, 9);
        assert!(queue.repeat);
        assert!(queue.consume);
        assert!(!queue.random);
        assert_eq!(sys.pc.cross_fade_seconds(), 4.0);

        let status = sys.status();
        assert_eq!(status.playlistlength, 4);
    }
}
