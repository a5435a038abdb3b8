use std::io::{Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use trib_config::testing::TestTree;
use trib_lock::{FileLockManager, Wait};

#[test]
fn stress_test_concurrent_joins() {
    // Quick stress test for CI (8 readers x 200 KiB, well under a second)
    const READERS: usize = 8;
    const CHUNKS: usize = 200;
    const CHUNK: &[u8] = &[0xAB; 1024];

    let tree = TestTree::new().unwrap();
    let target = tree.planned("large.bin");
    let mgr = Arc::new(FileLockManager::new());

    let mut out = mgr
        .open_output_stream(&target, Wait::Forever)
        .unwrap()
        .expect("writer");

    let start = Instant::now();

    // Readers join while the write is in progress
    let readers: Vec<_> = (0..READERS)
        .map(|i| {
            let mgr = Arc::clone(&mgr);
            let target = target.clone();
            thread::spawn(move || {
                let mut input = mgr.open_input_stream(&target).expect("join");
                let mut content = Vec::new();
                input.read_to_end(&mut content).unwrap();
                (i, content)
            })
        })
        .collect();

    for n in 0..CHUNKS {
        out.write_all(CHUNK).unwrap();
        if n % 50 == 0 {
            thread::yield_now();
        }
    }
    out.close().unwrap();

    for reader in readers {
        let (i, content) = reader.join().unwrap();
        assert_eq!(
            content.len(),
            CHUNKS * CHUNK.len(),
            "reader {} saw a truncated stream",
            i
        );
        assert!(content.iter().all(|b| *b == 0xAB), "reader {} saw corrupt bytes", i);
    }

    let duration = start.elapsed();
    println!(
        "{} readers joined {} KiB in {:?}",
        READERS,
        CHUNKS * CHUNK.len() / 1024,
        duration
    );

    assert_eq!(mgr.tree().tracked_count(), 0);
}

#[test]
fn stress_test_unrelated_paths_do_not_contend() {
    const WORKERS: usize = 8;
    const ROUNDS: usize = 50;

    let tree = TestTree::new().unwrap();
    for w in 0..WORKERS {
        tree.create_dir(&format!("worker{}", w)).unwrap();
    }
    let root = tree.path().to_path_buf();
    let mgr = Arc::new(FileLockManager::new());

    let start = Instant::now();

    let workers: Vec<_> = (0..WORKERS)
        .map(|w| {
            let mgr = Arc::clone(&mgr);
            let root = root.clone();
            thread::spawn(move || {
                for round in 0..ROUNDS {
                    let path = root.join(format!("worker{}/file{}.bin", w, round));
                    let mut out = mgr
                        .open_output_stream(&path, Wait::Forever)
                        .unwrap()
                        .expect("unrelated paths never contend");
                    out.write_all(b"round payload").unwrap();
                    out.close().unwrap();

                    let mut input = mgr.open_input_stream(&path).unwrap();
                    let mut content = Vec::new();
                    input.read_to_end(&mut content).unwrap();
                    assert_eq!(content, b"round payload");
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    let duration = start.elapsed();
    println!(
        "{} workers x {} open/write/read rounds in {:?}",
        WORKERS, ROUNDS, duration
    );

    assert_eq!(mgr.tree().tracked_count(), 0);
}
